//! Typed batch settings, validated once at creation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::error::ValidationError;
use crate::core::task::TaskType;

/// Requested render quality.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoQuality {
    /// Draft output.
    Low,
    /// Standard output.
    #[default]
    Medium,
    /// High quality output.
    High,
    /// Highest quality, GPU rendered.
    Ultra,
}

impl VideoQuality {
    /// Render time relative to `Medium`.
    pub const fn duration_factor(self) -> f64 {
        match self {
            Self::Low | Self::Medium => 1.0,
            Self::High => 1.5,
            Self::Ultra => 2.5,
        }
    }

    /// Render price relative to `Medium`.
    pub const fn price_factor(self) -> f64 {
        match self {
            Self::Low | Self::Medium => 1.0,
            Self::High => 1.5,
            Self::Ultra => 3.0,
        }
    }
}

/// How the optimizer reshapes a project's tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationStrategy {
    /// Raise priority of every task.
    Speed,
    /// Lower priority and prefer CPU queues.
    Cost,
    /// Force the highest render quality.
    Quality,
    /// Leave the plan untouched.
    #[default]
    Balanced,
}

/// Parameters for content generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentParams {
    /// Output language tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Writing style preset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    /// Upper bound on script length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_words: Option<u32>,
    /// Backend-specific options passed through untouched.
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

/// Parameters for speech synthesis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TtsParams {
    /// Voice identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    /// Speaking rate multiplier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
    /// Backend-specific options passed through untouched.
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

/// Parameters for the render stages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderParams {
    /// Render quality knob.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<VideoQuality>,
    /// Output resolution, e.g. `1080x1920`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    /// Frames per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<u32>,
    /// Backend-specific options passed through untouched.
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

/// Settings shared by every project of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchSettings {
    /// Run content generation first.
    pub generate_content: bool,
    /// Run speech synthesis.
    pub generate_tts: bool,
    /// Run the render stage.
    pub generate_video: bool,
    /// Requested render quality.
    pub video_quality: VideoQuality,
    /// Use the advanced render pipeline.
    pub advanced_video: bool,
    /// Route advanced renders to GPU workers.
    pub gpu_acceleration: bool,
    /// Per-batch concurrency override.
    pub parallel_limit: Option<u32>,
    /// Content stage parameters.
    pub content: ContentParams,
    /// Speech stage parameters.
    pub tts: TtsParams,
    /// Render stage parameters.
    pub video: RenderParams,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            generate_content: false,
            generate_tts: false,
            generate_video: true,
            video_quality: VideoQuality::Medium,
            advanced_video: false,
            gpu_acceleration: false,
            parallel_limit: None,
            content: ContentParams::default(),
            tts: TtsParams::default(),
            video: RenderParams::default(),
        }
    }
}

impl BatchSettings {
    /// Parse and validate settings from a loosely typed JSON document.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        let settings: Self = serde_json::from_value(value)
            .map_err(|e| ValidationError::InvalidSettings(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.parallel_limit == Some(0) {
            return Err(ValidationError::InvalidParallelLimit);
        }
        if let Some(speed) = self.tts.speed {
            if !(speed.is_finite() && speed > 0.0) {
                return Err(ValidationError::InvalidSettings(format!(
                    "tts.speed must be positive, got {speed}"
                )));
            }
        }
        if self.video.fps == Some(0) {
            return Err(ValidationError::InvalidSettings("video.fps must be positive".into()));
        }
        Ok(())
    }

    /// Render stage implied by quality and flags, if rendering is requested.
    pub const fn render_task_type(&self) -> Option<TaskType> {
        if !self.generate_video {
            return None;
        }
        Some(match (self.video_quality, self.advanced_video) {
            (VideoQuality::Ultra, _) => TaskType::UltraVideo,
            (_, true) => TaskType::AdvancedVideo,
            _ => TaskType::Video,
        })
    }

    /// Stages requested for every project, in pipeline order.
    pub fn stages(&self) -> Vec<TaskType> {
        let mut stages = Vec::with_capacity(3);
        if self.generate_content {
            stages.push(TaskType::Content);
        }
        if self.generate_tts {
            stages.push(TaskType::Tts);
        }
        if let Some(render) = self.render_task_type() {
            stages.push(render);
        }
        stages
    }
}

/// Settings recommended by the optimizer for a prospective batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendedSettings {
    /// Suggested concurrency per task group.
    pub parallel_limit: u32,
    /// Suggested render quality.
    pub video_quality: VideoQuality,
    /// Suggested strategy.
    pub optimization_strategy: OptimizationStrategy,
}

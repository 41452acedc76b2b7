//! Task types, queues, typed stage parameters and task descriptors.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::model::{BatchPriority, ProjectId};
use crate::core::settings::{ContentParams, RenderParams, TtsParams};

/// Pipeline stage executed by the backend for one project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Script/content generation.
    Content,
    /// Speech synthesis.
    Tts,
    /// Standard render.
    Video,
    /// Render with the advanced effects pipeline.
    AdvancedVideo,
    /// Highest quality render; requires a GPU worker.
    UltraVideo,
}

impl TaskType {
    /// All task types in pipeline order.
    pub const ALL: [Self; 5] = [
        Self::Content,
        Self::Tts,
        Self::Video,
        Self::AdvancedVideo,
        Self::UltraVideo,
    ];

    /// Stable lowercase name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::Tts => "tts",
            Self::Video => "video",
            Self::AdvancedVideo => "advanced_video",
            Self::UltraVideo => "ultra_video",
        }
    }

    /// Name of the backend task implementing this stage.
    pub fn task_name(self) -> String {
        format!("generate_{}", self.as_str())
    }

    /// Whether this is one of the render stages.
    pub const fn is_render(self) -> bool {
        matches!(self, Self::Video | Self::AdvancedVideo | Self::UltraVideo)
    }

    /// Queue a task of this type is routed to by default.
    pub const fn default_queue(self) -> QueueName {
        match self {
            Self::Content | Self::Tts => QueueName::Content,
            Self::Video | Self::AdvancedVideo => QueueName::Video,
            Self::UltraVideo => QueueName::Gpu,
        }
    }

    /// CPU queue able to run this type, if the type does not strictly need a GPU.
    pub const fn cpu_fallback_queue(self) -> Option<QueueName> {
        match self {
            Self::Content | Self::Tts => Some(QueueName::Content),
            Self::Video | Self::AdvancedVideo => Some(QueueName::Video),
            Self::UltraVideo => None,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend queue names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    /// Lightweight CPU work (content, speech).
    Content,
    /// CPU render workers.
    Video,
    /// GPU render workers.
    Gpu,
}

impl QueueName {
    /// Queue name as understood by the backend.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::Video => "video",
            Self::Gpu => "gpu",
        }
    }

    /// Whether the queue is served by GPU workers.
    pub const fn is_gpu(self) -> bool {
        matches!(self, Self::Gpu)
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed parameters of one stage, serialized as the backend kwargs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum TaskParams {
    /// Content generation parameters.
    Content(ContentParams),
    /// Speech synthesis parameters.
    Tts(TtsParams),
    /// Render parameters (all render task types).
    Render(RenderParams),
}

impl TaskParams {
    /// Keyword arguments for the backend: the inner structure without the tag.
    pub fn to_kwargs(&self) -> Result<Map<String, Value>, serde_json::Error> {
        let value = match self {
            Self::Content(p) => serde_json::to_value(p)?,
            Self::Tts(p) => serde_json::to_value(p)?,
            Self::Render(p) => serde_json::to_value(p)?,
        };
        Ok(match value {
            Value::Object(map) => map,
            _ => Map::new(),
        })
    }

    /// Render parameters, if this is a render stage.
    pub fn render_mut(&mut self) -> Option<&mut RenderParams> {
        match self {
            Self::Render(p) => Some(p),
            _ => None,
        }
    }
}

/// One unit of work for one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Owning project.
    pub project_id: ProjectId,
    /// Stage.
    pub task_type: TaskType,
    /// Backend task name.
    pub task_name: String,
    /// Target queue.
    pub queue: QueueName,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Typed keyword parameters.
    pub params: TaskParams,
    /// Submission priority.
    pub priority: BatchPriority,
    /// Maximum wait for a terminal state.
    pub timeout: Duration,
    /// Stages of the same project that must complete first.
    pub depends_on: Vec<TaskType>,
}

impl TaskDescriptor {
    /// Identity of the task within a plan.
    pub const fn key(&self) -> (ProjectId, TaskType) {
        (self.project_id, self.task_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_routing() {
        assert_eq!(TaskType::Tts.default_queue(), QueueName::Content);
        assert_eq!(TaskType::UltraVideo.default_queue(), QueueName::Gpu);
        assert_eq!(TaskType::AdvancedVideo.cpu_fallback_queue(), Some(QueueName::Video));
        assert_eq!(TaskType::UltraVideo.cpu_fallback_queue(), None);
    }

    #[test]
    fn test_task_names() {
        assert_eq!(TaskType::AdvancedVideo.task_name(), "generate_advanced_video");
        assert_eq!(TaskType::Content.to_string(), "content");
        assert!(TaskType::UltraVideo.is_render());
        assert!(!TaskType::Tts.is_render());
    }

    #[test]
    fn test_kwargs_drop_stage_tag() {
        let params = TaskParams::Tts(TtsParams {
            voice: Some("nova".into()),
            ..TtsParams::default()
        });
        let kwargs = params.to_kwargs().unwrap();
        assert_eq!(kwargs.get("voice"), Some(&Value::from("nova")));
        assert!(!kwargs.contains_key("stage"));
    }
}

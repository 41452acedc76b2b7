//! API-facing request/response models, batch templates and estimates.

use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::BatchError;
use crate::core::model::{
    BatchId, BatchMetadata, BatchPriority, BatchResults, BatchStatus, ProcessingMetrics, ProjectId,
    UserId,
};
use crate::core::monitor::{ResourceForecast, ResourceMonitor};
use crate::core::resource::ResourceAllocation;
use crate::core::service::{BatchService, BatchStatusReport};
use crate::core::settings::{BatchSettings, OptimizationStrategy, RecommendedSettings, VideoQuality};
use crate::runtime::dispatcher::BatchDispatcher;

const MINUTES_PER_PROJECT: f64 = 5.0;
const COST_PER_PROJECT: f64 = 0.10;
const ADVANCED_COST_FACTOR: f64 = 1.3;

/// Batch creation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchCreateRequest {
    /// Projects to process.
    pub project_ids: Vec<ProjectId>,
    /// Shared settings.
    #[serde(default)]
    pub settings: BatchSettings,
    /// Plan transform.
    #[serde(default)]
    pub optimization_strategy: OptimizationStrategy,
    /// Priority; `normal` when absent.
    #[serde(default)]
    pub priority: Option<BatchPriority>,
    /// Queue the batch for dispatch right away.
    #[serde(default = "default_true")]
    pub auto_start: bool,
}

const fn default_true() -> bool {
    true
}

/// Response for batch creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    /// New batch id.
    pub batch_id: BatchId,
    /// Status after creation.
    pub status: BatchStatus,
    /// Projects requested.
    pub total_projects: usize,
    /// Projects accepted.
    pub valid_projects: usize,
    /// Priority.
    pub priority: BatchPriority,
    /// Projected completion.
    pub estimated_completion_time: DateTime<Utc>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Detailed batch status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStatusResponse {
    /// Batch id.
    pub batch_id: BatchId,
    /// Status.
    pub status: BatchStatus,
    /// Completion percentage.
    pub progress: f64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Start time.
    pub started_at: Option<DateTime<Utc>>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Projects in the batch.
    pub total_projects: usize,
    /// Projects completed.
    pub completed_projects: usize,
    /// Projects failed.
    pub failed_projects: usize,
    /// Derived metrics.
    pub metrics: ProcessingMetrics,
    /// Outcome.
    pub results: BatchResults,
}

impl From<BatchStatusReport> for BatchStatusResponse {
    fn from(report: BatchStatusReport) -> Self {
        Self {
            batch_id: report.job.batch_id,
            status: report.job.status,
            progress: report.job.progress,
            created_at: report.job.created_at,
            started_at: report.job.started_at,
            completed_at: report.job.completed_at,
            total_projects: report.job.project_ids.len(),
            completed_projects: report.progress.completed,
            failed_projects: report.progress.failed,
            metrics: report.metrics,
            results: report.job.results,
        }
    }
}

/// Settings optimization request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOptimizationRequest {
    /// Prospective projects.
    pub project_ids: Vec<ProjectId>,
    /// Desired completion window in hours.
    #[serde(default)]
    pub target_completion_hours: Option<f64>,
}

/// Settings optimization response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOptimizationResponse {
    /// Recommended settings.
    pub recommended_settings: RecommendedSettings,
    /// Projected duration in minutes.
    pub estimated_duration: u64,
    /// Projected cost.
    pub estimated_cost: f64,
}

/// Capacity summary in human units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSummary {
    /// Available cores.
    pub cpu_cores: u32,
    /// Available memory in gigabytes.
    pub memory_gb: f64,
    /// Available GPUs.
    pub gpu_count: u32,
    /// Free disk in gigabytes.
    pub storage_gb: f64,
}

impl From<ResourceAllocation> for ResourceSummary {
    #[allow(clippy::cast_precision_loss)]
    fn from(r: ResourceAllocation) -> Self {
        Self {
            cpu_cores: r.cpu_cores,
            memory_gb: r.memory_mb as f64 / 1024.0,
            gpu_count: r.gpu_count,
            storage_gb: r.storage_gb,
        }
    }
}

/// Current capacity and forecast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAvailability {
    /// Current snapshot.
    pub current: ResourceSummary,
    /// Forecast.
    pub forecast: ResourceForecast,
    /// Suggested projects per batch.
    pub recommended_batch_size: usize,
}

/// Predefined batch configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchTemplate {
    /// Stable identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Short description.
    pub description: String,
    /// Render quality.
    pub video_quality: VideoQuality,
    /// Concurrency per task group.
    pub parallel_limit: u32,
    /// Plan transform.
    pub optimization_strategy: OptimizationStrategy,
    /// Use the advanced render pipeline.
    pub advanced_video: bool,
}

impl BatchTemplate {
    fn new(
        id: &str,
        name: &str,
        description: &str,
        video_quality: VideoQuality,
        parallel_limit: u32,
        optimization_strategy: OptimizationStrategy,
        advanced_video: bool,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            video_quality,
            parallel_limit,
            optimization_strategy,
            advanced_video,
        }
    }

    /// Settings and metadata for a batch created from this template.
    pub fn apply(&self, mut settings: BatchSettings) -> (BatchSettings, BatchMetadata) {
        settings.video_quality = self.video_quality;
        settings.parallel_limit = Some(self.parallel_limit);
        settings.advanced_video |= self.advanced_video;
        let metadata = BatchMetadata {
            optimization_strategy: self.optimization_strategy,
            ..BatchMetadata::default()
        };
        (settings, metadata)
    }
}

/// Health response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    /// Healthy flag.
    pub ok: bool,
}

/// Liveness probe.
pub const fn health() -> Health {
    Health { ok: true }
}

/// Predefined templates.
pub fn batch_templates() -> Vec<BatchTemplate> {
    vec![
        BatchTemplate::new(
            "quick_batch",
            "Quick Batch",
            "Fast processing with standard quality",
            VideoQuality::Medium,
            5,
            OptimizationStrategy::Speed,
            false,
        ),
        BatchTemplate::new(
            "quality_batch",
            "Quality Batch",
            "High quality output with slower processing",
            VideoQuality::High,
            2,
            OptimizationStrategy::Quality,
            true,
        ),
        BatchTemplate::new(
            "economy_batch",
            "Economy Batch",
            "Cost-optimized processing",
            VideoQuality::Medium,
            1,
            OptimizationStrategy::Cost,
            false,
        ),
        BatchTemplate::new(
            "bulk_batch",
            "Bulk Processing",
            "Optimized for large batches",
            VideoQuality::Medium,
            3,
            OptimizationStrategy::Balanced,
            false,
        ),
    ]
}

/// Projected duration in minutes.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn estimate_duration_minutes(project_count: usize, quality: VideoQuality, parallel_limit: u32) -> u64 {
    let parallel = f64::from(parallel_limit.max(1));
    let minutes = project_count as f64 / parallel * MINUTES_PER_PROJECT * quality.duration_factor();
    minutes.floor() as u64
}

/// Projected cost, rounded to cents.
#[allow(clippy::cast_precision_loss)]
pub fn estimate_cost(project_count: usize, quality: VideoQuality, advanced_video: bool) -> f64 {
    let mut per_project = COST_PER_PROJECT * quality.price_factor();
    if advanced_video {
        per_project *= ADVANCED_COST_FACTOR;
    }
    (project_count as f64 * per_project * 100.0).round() / 100.0
}

/// Projected completion instant of a batch starting at `now`.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn estimate_completion_time(project_count: usize, parallel_limit: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    let minutes = project_count as f64 / f64::from(parallel_limit.max(1)) * MINUTES_PER_PROJECT;
    now + ChronoDuration::seconds((minutes * 60.0).round() as i64)
}

/// Suggested projects per batch for the given capacity, capped at `max`.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn recommended_batch_size(available: &ResourceAllocation, max: usize) -> usize {
    let cpu_based = f64::from(available.cpu_cores) * 5.0;
    let memory_based = available.memory_mb as f64 / 2048.0 * 3.0;
    (cpu_based.min(memory_based).floor() as usize).min(max)
}

/// Create a batch and queue it when `auto_start` is set.
pub async fn create_batch(
    service: &BatchService,
    dispatcher: Option<&BatchDispatcher>,
    user_id: UserId,
    request: BatchCreateRequest,
) -> Result<BatchResponse, BatchError> {
    let total_projects = request.project_ids.len();
    let metadata = BatchMetadata {
        optimization_strategy: request.optimization_strategy,
        ..BatchMetadata::default()
    };
    let job = service
        .create_batch(
            user_id,
            request.project_ids,
            request.settings,
            request.priority,
            Some(metadata),
        )
        .await?;
    if request.auto_start {
        if let Some(dispatcher) = dispatcher {
            dispatcher.enqueue(&job)?;
        }
    }
    Ok(BatchResponse {
        batch_id: job.batch_id.clone(),
        status: job.status,
        total_projects,
        valid_projects: job.project_ids.len(),
        priority: job.priority,
        estimated_completion_time: estimate_completion_time(
            job.project_ids.len(),
            job.parallel_limit,
            job.created_at,
        ),
        created_at: job.created_at,
    })
}

/// Status of a batch.
pub async fn batch_status(service: &BatchService, batch_id: &BatchId) -> Result<BatchStatusResponse, BatchError> {
    service.get_batch_status(batch_id).await.map(Into::into)
}

/// Completion target in hours as a duration. Non-positive and non-finite
/// targets are ignored; targets too long to represent saturate.
fn target_duration(hours: Option<f64>) -> Option<Duration> {
    hours
        .filter(|h| h.is_finite() && *h > 0.0)
        .map(|h| Duration::try_from_secs_f64(h * 3600.0).unwrap_or(Duration::MAX))
}

/// Recommended settings with duration and cost projections.
pub async fn optimize_batch_settings(
    service: &BatchService,
    request: &BatchOptimizationRequest,
) -> Result<BatchOptimizationResponse, BatchError> {
    let target = target_duration(request.target_completion_hours);
    let recommended = service
        .optimize_batch_settings(&request.project_ids, target)
        .await?;
    let count = request.project_ids.len();
    Ok(BatchOptimizationResponse {
        estimated_duration: estimate_duration_minutes(
            count,
            recommended.video_quality,
            recommended.parallel_limit,
        ),
        estimated_cost: estimate_cost(count, recommended.video_quality, false),
        recommended_settings: recommended,
    })
}

/// Current capacity, forecast and suggested batch size.
pub async fn resource_availability(monitor: &dyn ResourceMonitor, max_batch_size: usize) -> ResourceAvailability {
    let forecast = monitor.get_resource_forecast().await;
    ResourceAvailability {
        current: forecast.current.into(),
        recommended_batch_size: recommended_batch_size(&forecast.current, max_batch_size),
        forecast,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_estimate() {
        assert_eq!(estimate_duration_minutes(10, VideoQuality::Medium, 5), 10);
        assert_eq!(estimate_duration_minutes(10, VideoQuality::High, 5), 15);
        assert_eq!(estimate_duration_minutes(4, VideoQuality::Ultra, 0), 50);
    }

    #[test]
    fn test_cost_estimate() {
        assert!((estimate_cost(10, VideoQuality::Medium, false) - 1.0).abs() < 1e-9);
        assert!((estimate_cost(10, VideoQuality::Ultra, false) - 3.0).abs() < 1e-9);
        assert!((estimate_cost(10, VideoQuality::High, true) - 1.95).abs() < 1e-9);
    }

    #[test]
    fn test_completion_time_accounts_for_parallelism() {
        let now = Utc::now();
        let eta = estimate_completion_time(6, 3, now);
        assert_eq!((eta - now).num_minutes(), 10);
    }

    #[test]
    fn test_recommended_batch_size() {
        assert_eq!(recommended_batch_size(&ResourceAllocation::new(4, 8192, 0), 50), 12);
        assert_eq!(recommended_batch_size(&ResourceAllocation::new(64, 262_144, 0), 50), 50);
    }

    #[test]
    fn test_templates_apply() {
        let templates = batch_templates();
        assert_eq!(templates.len(), 4);
        let quality = templates.iter().find(|t| t.id == "quality_batch").unwrap();
        let (settings, metadata) = quality.apply(BatchSettings::default());
        assert!(settings.advanced_video);
        assert_eq!(settings.parallel_limit, Some(2));
        assert_eq!(metadata.optimization_strategy, OptimizationStrategy::Quality);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_target_duration_bounds() {
        assert_eq!(target_duration(Some(0.5)), Some(Duration::from_secs(1800)));
        assert_eq!(target_duration(Some(1e300)), Some(Duration::MAX));
        assert_eq!(target_duration(Some(f64::MAX)), Some(Duration::MAX));
        assert_eq!(target_duration(Some(f64::INFINITY)), None);
        assert_eq!(target_duration(Some(f64::NAN)), None);
        assert_eq!(target_duration(Some(-2.0)), None);
        assert_eq!(target_duration(None), None);
    }

    #[test]
    fn test_create_request_defaults() {
        let req: BatchCreateRequest = serde_json::from_str(r#"{ "project_ids": [1, 2] }"#).unwrap();
        assert!(req.auto_start);
        assert_eq!(req.optimization_strategy, OptimizationStrategy::Balanced);
        assert_eq!(req.settings, BatchSettings::default());
    }
}

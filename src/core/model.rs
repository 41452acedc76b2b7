//! Batch records, results and derived metrics.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::core::error::BatchError;
use crate::core::settings::{BatchSettings, OptimizationStrategy};
use crate::core::task::TaskType;

/// Project identifier (owned by the surrounding application).
pub type ProjectId = u64;

/// User identifier (owned by the surrounding application).
pub type UserId = u64;

/// Opaque batch identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    /// Generate a fresh unique id.
    pub fn generate() -> Self {
        Self(format!("batch_{}", Uuid::new_v4()))
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BatchId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for BatchId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Batch priority, ordered `Low < Normal < High < Urgent`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPriority {
    /// Background work.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Expedited work.
    High,
    /// Jump the queue.
    Urgent,
}

impl BatchPriority {
    /// Numeric priority passed to the execution backend.
    pub const fn value(self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Normal => 5,
            Self::High => 8,
            Self::Urgent => 10,
        }
    }

    /// Inverse of [`BatchPriority::value`].
    pub const fn from_value(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Low),
            5 => Some(Self::Normal),
            8 => Some(Self::High),
            10 => Some(Self::Urgent),
            _ => None,
        }
    }
}

/// Lifecycle status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Created, not yet started.
    Pending,
    /// Claimed by a scheduler.
    Processing,
    /// Finished; individual projects may still have failed.
    Completed,
    /// The driver itself failed.
    Failed,
}

impl BatchStatus {
    /// Whether `self -> to` is an allowed transition.
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Completed | Self::Failed)
        )
    }

    /// Whether no further transitions are possible.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Lowercase name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed batch metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchMetadata {
    /// Strategy applied by the optimizer.
    #[serde(default)]
    pub optimization_strategy: OptimizationStrategy,
    /// Batch this one recovers, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_batch_id: Option<BatchId>,
    /// Recovery attempt number; 0 for an original batch.
    #[serde(default)]
    pub recovery_attempt: u32,
    /// Whether the recovery was limited to failed projects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_failed_only: Option<bool>,
    /// When the caller requested the batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_at: Option<DateTime<Utc>>,
    /// Caller-defined annotations.
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

/// Successful project outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectResult {
    /// Project id.
    pub project_id: ProjectId,
    /// Backend id of the final task.
    pub task_id: String,
    /// Result payload of the final task.
    pub result: Value,
}

/// Failed project outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectFailure {
    /// Project id.
    pub project_id: ProjectId,
    /// Stage that failed.
    pub task_type: Option<TaskType>,
    /// Failure description.
    pub error: String,
    /// Whether the failure was an abandoned wait.
    #[serde(default)]
    pub timed_out: bool,
}

/// Aggregated batch outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResults {
    /// Projects whose final task succeeded.
    #[serde(default)]
    pub successful: Vec<ProjectResult>,
    /// Projects with a failed or unreached final task.
    #[serde(default)]
    pub failed: Vec<ProjectFailure>,
    /// Projects that contributed no tasks.
    #[serde(default)]
    pub skipped: Vec<ProjectId>,
    /// Driver-level error, when the batch failed as a whole.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Milliseconds spent waiting on tasks, summed per task type.
    #[serde(default)]
    pub busy_ms: BTreeMap<TaskType, u64>,
}

impl BatchResults {
    /// Ids of failed projects, in result order.
    pub fn failed_project_ids(&self) -> Vec<ProjectId> {
        self.failed.iter().map(|f| f.project_id).collect()
    }
}

/// Metrics derived from a batch record on demand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingMetrics {
    /// Projects in the batch.
    pub total_projects: usize,
    /// Projects completed successfully.
    pub completed_projects: usize,
    /// Projects failed.
    pub failed_projects: usize,
    /// Projects skipped.
    pub skipped_projects: usize,
    /// Wall time per completed project, in seconds.
    pub average_processing_time_secs: f64,
    /// Average in-flight tasks per task type over the batch wall time.
    pub resource_utilization: BTreeMap<String, f64>,
}

/// A batch of projects processed together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    /// Unique id.
    pub batch_id: BatchId,
    /// Owner.
    pub user_id: UserId,
    /// Projects, unique, in submission order.
    pub project_ids: Vec<ProjectId>,
    /// Shared settings.
    pub settings: BatchSettings,
    /// Priority.
    pub priority: BatchPriority,
    /// Maximum concurrent tasks per task group.
    pub parallel_limit: u32,
    /// Lifecycle status.
    pub status: BatchStatus,
    /// Completion percentage, 0-100.
    pub progress: f64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time the scheduler claimed the batch.
    pub started_at: Option<DateTime<Utc>>,
    /// Time the batch reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Outcome.
    pub results: BatchResults,
    /// Metadata.
    pub metadata: BatchMetadata,
    /// Optimistic concurrency version, bumped by every store write.
    #[serde(default)]
    pub version: u64,
}

impl BatchJob {
    /// Build a pending batch.
    pub fn new(
        user_id: UserId,
        project_ids: Vec<ProjectId>,
        settings: BatchSettings,
        priority: BatchPriority,
        parallel_limit: u32,
        metadata: BatchMetadata,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            batch_id: BatchId::generate(),
            user_id,
            project_ids,
            settings,
            priority,
            parallel_limit,
            status: BatchStatus::Pending,
            progress: 0.0,
            created_at: now,
            started_at: None,
            completed_at: None,
            results: BatchResults::default(),
            metadata,
            version: 0,
        }
    }

    fn transition(&mut self, to: BatchStatus) -> Result<(), BatchError> {
        if !self.status.can_transition_to(to) {
            return Err(BatchError::InvalidTransition {
                batch_id: self.batch_id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Move `pending -> processing`.
    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> Result<(), BatchError> {
        self.transition(BatchStatus::Processing)?;
        self.started_at = Some(now);
        Ok(())
    }

    /// Move `processing -> completed` with the aggregated results.
    pub fn mark_completed(
        &mut self,
        results: BatchResults,
        now: DateTime<Utc>,
    ) -> Result<(), BatchError> {
        self.transition(BatchStatus::Completed)?;
        self.results = results;
        self.progress = 100.0;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Move `processing -> failed`, capturing the driver error.
    pub fn mark_failed(&mut self, error: String, now: DateTime<Utc>) -> Result<(), BatchError> {
        self.transition(BatchStatus::Failed)?;
        self.results.error = Some(error);
        self.completed_at = Some(now);
        Ok(())
    }

    /// Derive processing metrics from results and timestamps.
    #[allow(clippy::cast_precision_loss)]
    pub fn metrics(&self) -> ProcessingMetrics {
        let mut metrics = ProcessingMetrics {
            total_projects: self.project_ids.len(),
            completed_projects: self.results.successful.len(),
            failed_projects: self.results.failed.len(),
            skipped_projects: self.results.skipped.len(),
            ..ProcessingMetrics::default()
        };

        if let (Some(started), Some(completed)) = (self.started_at, self.completed_at) {
            let wall_ms = (completed - started).num_milliseconds().max(0) as f64;
            if metrics.completed_projects > 0 {
                metrics.average_processing_time_secs =
                    wall_ms / 1000.0 / metrics.completed_projects as f64;
            }
            if wall_ms > 0.0 {
                for (task_type, busy) in &self.results.busy_ms {
                    metrics
                        .resource_utilization
                        .insert(task_type.to_string(), *busy as f64 / wall_ms);
                }
            }
        }
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn job() -> BatchJob {
        BatchJob::new(
            1,
            vec![10, 11, 12],
            BatchSettings::default(),
            BatchPriority::Normal,
            3,
            BatchMetadata::default(),
            Utc::now(),
        )
    }

    #[test]
    fn test_priority_ordering_and_values() {
        assert!(BatchPriority::Urgent > BatchPriority::High);
        assert!(BatchPriority::High > BatchPriority::Normal);
        assert!(BatchPriority::Normal > BatchPriority::Low);
        assert_eq!(BatchPriority::High.value(), 8);
        assert_eq!(BatchPriority::from_value(10), Some(BatchPriority::Urgent));
        assert_eq!(BatchPriority::from_value(3), None);
    }

    #[test]
    fn test_batch_id_format() {
        let id = BatchId::generate();
        assert!(id.as_str().starts_with("batch_"));
        assert_ne!(id, BatchId::generate());
    }

    #[test]
    fn test_status_never_regresses() {
        let mut job = job();
        let now = Utc::now();
        assert!(job.mark_completed(BatchResults::default(), now).is_err());
        job.mark_processing(now).unwrap();
        assert!(job.mark_processing(now).is_err());
        job.mark_completed(BatchResults::default(), now).unwrap();
        assert_eq!(job.progress, 100.0);
        assert!(job.mark_failed("late".into(), now).is_err());
        assert_eq!(job.status, BatchStatus::Completed);
    }

    #[test]
    fn test_metrics_from_results() {
        let mut job = job();
        let start = Utc::now();
        job.mark_processing(start).unwrap();
        let mut results = BatchResults::default();
        results.successful.push(ProjectResult {
            project_id: 10,
            task_id: "t1".into(),
            result: Value::Null,
        });
        results.successful.push(ProjectResult {
            project_id: 11,
            task_id: "t2".into(),
            result: Value::Null,
        });
        results.failed.push(ProjectFailure {
            project_id: 12,
            task_type: Some(TaskType::Video),
            error: "boom".into(),
            timed_out: false,
        });
        results.busy_ms.insert(TaskType::Video, 20_000);
        job.mark_completed(results, start + Duration::seconds(10)).unwrap();

        let metrics = job.metrics();
        assert_eq!(metrics.total_projects, 3);
        assert_eq!(metrics.completed_projects, 2);
        assert_eq!(metrics.failed_projects, 1);
        assert!((metrics.average_processing_time_secs - 5.0).abs() < f64::EPSILON);
        assert!((metrics.resource_utilization["video"] - 2.0).abs() < f64::EPSILON);
    }
}

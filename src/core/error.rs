//! Error types for batch scheduling operations.

use thiserror::Error;

use crate::core::model::{BatchId, BatchStatus, ProjectId};
use crate::core::task::TaskType;

/// Input rejected at batch creation. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// No project ids were supplied.
    #[error("batch must contain at least one project")]
    EmptyBatch,
    /// Too many projects for a single batch.
    #[error("batch size {count} exceeds limit of {max}")]
    TooManyProjects {
        /// Number of project ids supplied.
        count: usize,
        /// Configured maximum.
        max: usize,
    },
    /// The same project id appears more than once.
    #[error("duplicate project id {0}")]
    DuplicateProject(ProjectId),
    /// None of the supplied projects may be batched by the user.
    #[error("no valid projects found for batch processing")]
    NoValidProjects,
    /// Parallel limit must be positive.
    #[error("parallel limit must be greater than 0")]
    InvalidParallelLimit,
    /// Settings could not be interpreted.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    /// The batch has already been recovered the maximum number of times.
    #[error("recovery attempt {attempt} exceeds limit of {max}")]
    RecoveryLimitReached {
        /// Attempt that would have been created.
        attempt: u32,
        /// Configured maximum.
        max: u32,
    },
}

/// Failures of the batch store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A record with this id already exists.
    #[error("batch {0} already exists")]
    AlreadyExists(BatchId),
    /// Update of a record that is missing or expired.
    #[error("batch {0} not found in store")]
    Missing(BatchId),
    /// Optimistic concurrency check failed.
    #[error("version conflict on batch {batch_id}: expected {expected}, found {found}")]
    VersionConflict {
        /// Batch being written.
        batch_id: BatchId,
        /// Version the writer read.
        expected: u64,
        /// Version currently stored.
        found: u64,
    },
    /// Record (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Underlying storage I/O failed.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures talking to the execution backend.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The backend refused or failed to accept the submission.
    #[error("submit failed: {0}")]
    Submit(String),
    /// Polling the task handle failed.
    #[error("poll failed: {0}")]
    Poll(String),
    /// The task did not reach a terminal state in time.
    #[error("task {task_id} timed out after {seconds:.1} seconds")]
    Timeout {
        /// Backend task id.
        task_id: String,
        /// Wait that elapsed.
        seconds: f64,
    },
}

impl BackendError {
    /// Whether this error represents an abandoned wait.
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Failures building an execution plan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    /// A task depends on a stage its project does not contain.
    #[error("project {project_id}: {task_type} depends on missing stage {missing}")]
    UnresolvedDependency {
        /// Project owning the task.
        project_id: ProjectId,
        /// Task with the dangling dependency.
        task_type: TaskType,
        /// Dependency that could not be found.
        missing: TaskType,
    },
    /// Dependencies form a cycle.
    #[error("dependency cycle among {0} remaining tasks")]
    Cycle(usize),
}

/// Errors produced by batch service operations.
#[derive(Debug, Error)]
pub enum BatchError {
    /// Rejected input.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Unknown or expired batch id.
    #[error("batch {0} not found")]
    NotFound(BatchId),
    /// Illegal status change.
    #[error("batch {batch_id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Batch being changed.
        batch_id: BatchId,
        /// Current status.
        from: BatchStatus,
        /// Requested status.
        to: BatchStatus,
    },
    /// Recovery requested for a batch that is still pending or processing.
    #[error("batch {batch_id} is {status} and cannot be recovered yet")]
    NotRecoverable {
        /// Batch requested for recovery.
        batch_id: BatchId,
        /// Its current status.
        status: BatchStatus,
    },
    /// The dispatch queue is at capacity.
    #[error("dispatch queue full ({0} batches)")]
    QueueFull(usize),
    /// Store access failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// Plan construction failed.
    #[error("plan error: {0}")]
    Plan(#[from] PlanError),
    /// Execution backend failure outside a single task.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

impl BatchError {
    /// Whether the batch record should be marked failed for this error.
    ///
    /// Validation and lookup errors happen before a batch is claimed.
    pub const fn is_driver_failure(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Plan(_) | Self::Backend(_))
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;

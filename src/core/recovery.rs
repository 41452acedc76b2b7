//! Recovery of finished batches.
//!
//! A recovery never touches the original record. It creates a new batch over
//! the failed (or all) projects of a terminal batch and runs it through the
//! normal create and execute path.

use serde::{Deserialize, Serialize};

use crate::core::context::BatchContext;
use crate::core::error::{BatchError, ValidationError};
use crate::core::intake::{BatchIntake, NewBatch};
use crate::core::model::{BatchId, BatchMetadata, BatchPriority, BatchResults, ProjectId};
use crate::core::scheduler::BatchScheduler;

/// Result of a recovery request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecoveryReport {
    /// Nothing to retry.
    NoFailures {
        /// Batch that was inspected.
        original_batch_id: BatchId,
    },
    /// A recovery batch was created and executed.
    Recovered {
        /// Batch that was recovered.
        original_batch_id: BatchId,
        /// New batch.
        recovery_batch_id: BatchId,
        /// Projects resubmitted.
        project_ids: Vec<ProjectId>,
        /// Attempt number of the new batch.
        recovery_attempt: u32,
        /// Outcome of the new batch.
        results: BatchResults,
    },
}

/// Builds and runs recovery batches.
#[derive(Clone)]
pub struct RecoveryService {
    ctx: BatchContext,
    intake: BatchIntake,
    scheduler: BatchScheduler,
}

impl RecoveryService {
    /// Recovery service sharing the given intake and scheduler.
    pub const fn new(ctx: BatchContext, intake: BatchIntake, scheduler: BatchScheduler) -> Self {
        Self {
            ctx,
            intake,
            scheduler,
        }
    }

    /// Resubmit the failed projects of a batch, or all of them.
    pub async fn recover_failed_batch(
        &self,
        batch_id: &BatchId,
        retry_failed_only: bool,
    ) -> Result<RecoveryReport, BatchError> {
        let original = self
            .ctx
            .store
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| BatchError::NotFound(batch_id.clone()))?;
        if !original.status.is_terminal() {
            return Err(BatchError::NotRecoverable {
                batch_id: batch_id.clone(),
                status: original.status,
            });
        }

        let project_ids = if retry_failed_only {
            original.results.failed_project_ids()
        } else {
            original.project_ids.clone()
        };
        if project_ids.is_empty() {
            tracing::info!(batch_id = %batch_id, "no failed projects to recover");
            return Ok(RecoveryReport::NoFailures {
                original_batch_id: batch_id.clone(),
            });
        }

        let attempt = original.metadata.recovery_attempt + 1;
        let max = self.ctx.config.max_recovery_attempts;
        if attempt > max {
            return Err(ValidationError::RecoveryLimitReached { attempt, max }.into());
        }

        let mut settings = original.settings.clone();
        settings.parallel_limit = Some(original.parallel_limit);
        let metadata = BatchMetadata {
            optimization_strategy: original.metadata.optimization_strategy,
            original_batch_id: Some(original.batch_id.clone()),
            recovery_attempt: attempt,
            retry_failed_only: Some(retry_failed_only),
            requested_at: None,
            extra: original.metadata.extra.clone(),
        };

        let recovery = self
            .intake
            .create_batch(NewBatch {
                user_id: original.user_id,
                project_ids,
                settings,
                priority: Some(original.priority.max(BatchPriority::High)),
                metadata: Some(metadata),
            })
            .await?;
        tracing::info!(
            original_batch_id = %batch_id,
            recovery_batch_id = %recovery.batch_id,
            attempt,
            projects = recovery.project_ids.len(),
            "recovery batch created"
        );

        let results = self.scheduler.execute_batch(&recovery.batch_id).await?;
        Ok(RecoveryReport::Recovered {
            original_batch_id: batch_id.clone(),
            recovery_batch_id: recovery.batch_id,
            project_ids: recovery.project_ids,
            recovery_attempt: attempt,
            results,
        })
    }
}

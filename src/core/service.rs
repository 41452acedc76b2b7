//! Batch service facade.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::context::BatchContext;
use crate::core::error::BatchError;
use crate::core::intake::{BatchIntake, NewBatch};
use crate::core::model::{
    BatchId, BatchJob, BatchMetadata, BatchPriority, BatchResults, BatchStatus, ProcessingMetrics,
    ProjectId, UserId,
};
use crate::core::progress::BatchProgress;
use crate::core::recovery::{RecoveryReport, RecoveryService};
use crate::core::scheduler::BatchScheduler;
use crate::core::settings::{BatchSettings, RecommendedSettings};

/// Snapshot returned by [`BatchService::get_batch_status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStatusReport {
    /// Batch record; `progress` is live while processing.
    pub job: BatchJob,
    /// Per-project progress counts.
    pub progress: BatchProgress,
    /// Derived metrics.
    pub metrics: ProcessingMetrics,
}

/// Entry point for batch operations.
#[derive(Clone)]
pub struct BatchService {
    ctx: BatchContext,
    intake: BatchIntake,
    scheduler: BatchScheduler,
    recovery: RecoveryService,
}

impl BatchService {
    /// Service over the given context.
    pub fn new(ctx: BatchContext) -> Self {
        let intake = BatchIntake::new(ctx.clone());
        let scheduler = BatchScheduler::new(ctx.clone());
        let recovery = RecoveryService::new(ctx.clone(), intake.clone(), scheduler.clone());
        Self {
            ctx,
            intake,
            scheduler,
            recovery,
        }
    }

    /// Shared collaborators.
    pub const fn context(&self) -> &BatchContext {
        &self.ctx
    }

    /// Scheduler executing this service's batches.
    pub const fn scheduler(&self) -> &BatchScheduler {
        &self.scheduler
    }

    /// Validate and persist a new pending batch.
    pub async fn create_batch(
        &self,
        user_id: UserId,
        project_ids: Vec<ProjectId>,
        settings: BatchSettings,
        priority: Option<BatchPriority>,
        metadata: Option<BatchMetadata>,
    ) -> Result<BatchJob, BatchError> {
        self.intake
            .create_batch(NewBatch {
                user_id,
                project_ids,
                settings,
                priority,
                metadata,
            })
            .await
    }

    /// Execute a pending batch.
    pub async fn execute_batch(&self, batch_id: &BatchId) -> Result<BatchResults, BatchError> {
        self.scheduler.execute_batch(batch_id).await
    }

    /// Batch record with live progress and derived metrics.
    pub async fn get_batch_status(&self, batch_id: &BatchId) -> Result<BatchStatusReport, BatchError> {
        let mut job = self
            .ctx
            .store
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| BatchError::NotFound(batch_id.clone()))?;
        let progress = self.scheduler.tracker().get_batch_progress(batch_id).await?;
        if job.status == BatchStatus::Processing {
            job.progress = progress.progress_percentage;
        }
        let metrics = job.metrics();
        Ok(BatchStatusReport {
            job,
            progress,
            metrics,
        })
    }

    /// A user's batches, newest first, optionally filtered by status.
    pub async fn list_user_batches(
        &self,
        user_id: UserId,
        status: Option<BatchStatus>,
        limit: usize,
    ) -> Result<Vec<BatchJob>, BatchError> {
        let jobs = self.ctx.store.list_user_batches(user_id).await?;
        Ok(jobs
            .into_iter()
            .filter(|job| status.is_none_or(|s| job.status == s))
            .take(limit)
            .collect())
    }

    /// Recommend settings for a prospective batch.
    pub async fn optimize_batch_settings(
        &self,
        project_ids: &[ProjectId],
        target_completion_time: Option<Duration>,
    ) -> Result<RecommendedSettings, BatchError> {
        self.intake.validate_project_ids(project_ids)?;
        let forecast = self.ctx.monitor.get_resource_forecast().await;
        Ok(self.scheduler.optimizer().calculate_optimal_settings(
            project_ids.len(),
            &forecast,
            target_completion_time,
        ))
    }

    /// Resubmit the failed (or all) projects of a finished batch.
    pub async fn recover_failed_batch(
        &self,
        batch_id: &BatchId,
        retry_failed_only: bool,
    ) -> Result<RecoveryReport, BatchError> {
        self.recovery
            .recover_failed_batch(batch_id, retry_failed_only)
            .await
    }
}

//! Batch creation and input validation.

use std::collections::HashSet;

use crate::core::context::BatchContext;
use crate::core::error::{BatchError, ValidationError};
use crate::core::model::{BatchJob, BatchMetadata, BatchPriority, ProjectId, UserId};
use crate::core::settings::BatchSettings;

/// Parameters of a batch to create.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBatch {
    /// Owner.
    pub user_id: UserId,
    /// Projects, in processing order.
    pub project_ids: Vec<ProjectId>,
    /// Shared settings.
    pub settings: BatchSettings,
    /// Priority; `Normal` when absent.
    pub priority: Option<BatchPriority>,
    /// Metadata; defaults when absent.
    pub metadata: Option<BatchMetadata>,
}

/// Validates requests and persists new pending batches.
#[derive(Clone)]
pub struct BatchIntake {
    ctx: BatchContext,
}

impl BatchIntake {
    /// Intake over the given context.
    pub const fn new(ctx: BatchContext) -> Self {
        Self { ctx }
    }

    /// Check the project list shape against the configured limits.
    pub fn validate_project_ids(&self, project_ids: &[ProjectId]) -> Result<(), ValidationError> {
        if project_ids.is_empty() {
            return Err(ValidationError::EmptyBatch);
        }
        let max = self.ctx.config.max_projects_per_batch;
        if project_ids.len() > max {
            return Err(ValidationError::TooManyProjects {
                count: project_ids.len(),
                max,
            });
        }
        let mut seen = HashSet::with_capacity(project_ids.len());
        if let Some(dup) = project_ids.iter().find(|id| !seen.insert(**id)) {
            return Err(ValidationError::DuplicateProject(*dup));
        }
        Ok(())
    }

    /// Validate and persist a new pending batch.
    pub async fn create_batch(&self, request: NewBatch) -> Result<BatchJob, BatchError> {
        self.validate_project_ids(&request.project_ids)?;
        request.settings.validate()?;
        let parallel_limit = request
            .settings
            .parallel_limit
            .unwrap_or(self.ctx.config.default_parallel_limit);
        if parallel_limit == 0 {
            return Err(ValidationError::InvalidParallelLimit.into());
        }

        let project_ids = self
            .ctx
            .projects
            .filter_batchable(request.user_id, &request.project_ids)
            .await;
        if project_ids.is_empty() {
            return Err(ValidationError::NoValidProjects.into());
        }
        if project_ids.len() < request.project_ids.len() {
            tracing::warn!(
                user_id = request.user_id,
                requested = request.project_ids.len(),
                accepted = project_ids.len(),
                "dropped projects the user may not batch"
            );
        }

        let now = self.ctx.clock.now();
        let mut metadata = request.metadata.unwrap_or_default();
        metadata.requested_at.get_or_insert(now);

        let mut job = BatchJob::new(
            request.user_id,
            project_ids,
            request.settings,
            request.priority.unwrap_or_default(),
            parallel_limit,
            metadata,
            now,
        );
        self.ctx.store.insert_batch(&mut job).await?;
        tracing::info!(
            batch_id = %job.batch_id,
            user_id = job.user_id,
            projects = job.project_ids.len(),
            priority = ?job.priority,
            "batch created"
        );
        Ok(job)
    }
}

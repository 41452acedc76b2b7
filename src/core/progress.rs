//! Per-project progress ledger.
//!
//! Entries live in the [`BatchStore`] next to their batch and expire with it.
//! Every update is written first and published second; a sink failure is
//! logged and never fails the update.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::StoreError;
use crate::core::events::{EventSink, ProgressEvent};
use crate::core::model::{BatchId, BatchJob, ProjectId};
use crate::core::task::TaskType;
use crate::infra::store::BatchStore;
use crate::util::clock::Clock;

/// Status of a project or one of its tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    /// Not started.
    #[default]
    Pending,
    /// Handed to the backend.
    Submitted,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully or never ran.
    Failed,
}

impl ProgressStatus {
    /// Whether the status is final.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// State of one task of a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    /// Stage.
    pub task_type: TaskType,
    /// Current status.
    pub status: ProgressStatus,
    /// Backend task id once submitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Free-form details (result or error).
    #[serde(default)]
    pub details: Value,
    /// Time of the last change.
    pub timestamp: DateTime<Utc>,
}

/// Progress of one project within a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    /// Project id.
    pub project_id: ProjectId,
    /// Project status; `completed` and `failed` are final.
    pub status: ProgressStatus,
    /// First submission time.
    pub started_at: Option<DateTime<Utc>>,
    /// Time the project reached a final status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Tasks keyed by stage name.
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskProgress>,
}

impl ProgressEntry {
    /// Fresh pending entry.
    pub const fn pending(project_id: ProjectId) -> Self {
        Self {
            project_id,
            status: ProgressStatus::Pending,
            started_at: None,
            completed_at: None,
            tasks: BTreeMap::new(),
        }
    }

    /// Apply a task update, keeping the project status monotonic.
    pub fn apply(&mut self, update: &TaskUpdate, now: DateTime<Utc>) {
        self.tasks.insert(
            update.task_type.to_string(),
            TaskProgress {
                task_type: update.task_type,
                status: update.status,
                task_id: update.task_id.clone(),
                details: update.details.clone(),
                timestamp: now,
            },
        );

        if self.status.is_terminal() {
            return;
        }
        match update.status {
            ProgressStatus::Pending => {}
            ProgressStatus::Submitted => {
                self.status = ProgressStatus::Submitted;
                self.started_at.get_or_insert(now);
            }
            ProgressStatus::Completed if update.is_final => {
                self.status = ProgressStatus::Completed;
                self.completed_at = Some(now);
            }
            ProgressStatus::Completed => {}
            ProgressStatus::Failed => {
                self.status = ProgressStatus::Failed;
                self.completed_at = Some(now);
            }
        }
    }
}

/// One task transition reported by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskUpdate {
    /// Owning project.
    pub project_id: ProjectId,
    /// Stage.
    pub task_type: TaskType,
    /// Backend task id, when known.
    pub task_id: Option<String>,
    /// New status.
    pub status: ProgressStatus,
    /// Whether this is the project's final stage.
    pub is_final: bool,
    /// Free-form details.
    pub details: Value,
}

/// Aggregate progress of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchProgress {
    /// Projects tracked.
    pub total: usize,
    /// Projects completed.
    pub completed: usize,
    /// Projects failed.
    pub failed: usize,
    /// Projects neither completed nor failed.
    pub pending: usize,
    /// `completed / total * 100`.
    pub progress_percentage: f64,
}

impl BatchProgress {
    /// Summarise a set of entries.
    #[allow(clippy::cast_precision_loss)]
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a ProgressEntry>) -> Self {
        let mut progress = Self::default();
        for entry in entries {
            progress.total += 1;
            match entry.status {
                ProgressStatus::Completed => progress.completed += 1,
                ProgressStatus::Failed => progress.failed += 1,
                _ => progress.pending += 1,
            }
        }
        if progress.total > 0 {
            progress.progress_percentage =
                progress.completed as f64 / progress.total as f64 * 100.0;
        }
        progress
    }
}

/// Writes progress entries and publishes the resulting snapshots.
#[derive(Clone)]
pub struct ProgressTracker {
    store: Arc<dyn BatchStore>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl ProgressTracker {
    /// Tracker over the given store and sink.
    pub fn new(store: Arc<dyn BatchStore>, events: Arc<dyn EventSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            events,
            clock,
        }
    }

    /// Create a pending entry for every project of the batch.
    pub async fn init_batch(&self, job: &BatchJob) -> Result<(), StoreError> {
        for &project_id in &job.project_ids {
            self.store
                .put_progress(&job.batch_id, &ProgressEntry::pending(project_id))
                .await?;
        }
        self.emit(ProgressEvent::BatchStarted {
            batch_id: job.batch_id.clone(),
            total_projects: job.project_ids.len(),
            at: self.clock.now(),
        });
        Ok(())
    }

    /// Record a task transition, then publish the new snapshot.
    pub async fn update_task_progress(
        &self,
        batch_id: &BatchId,
        update: TaskUpdate,
    ) -> Result<BatchProgress, StoreError> {
        let now = self.clock.now();
        let mut entry = self
            .store
            .get_progress(batch_id, update.project_id)
            .await?
            .unwrap_or_else(|| ProgressEntry::pending(update.project_id));
        entry.apply(&update, now);
        self.store.put_progress(batch_id, &entry).await?;

        let progress = self.get_batch_progress(batch_id).await?;
        self.emit(ProgressEvent::TaskUpdated {
            batch_id: batch_id.clone(),
            project_id: update.project_id,
            task_id: update
                .task_id
                .unwrap_or_else(|| format!("{}:{}", update.project_id, update.task_type)),
            task_type: update.task_type,
            status: update.status,
            details: update.details,
            progress,
            at: now,
        });
        Ok(progress)
    }

    /// Aggregate progress of a batch.
    pub async fn get_batch_progress(&self, batch_id: &BatchId) -> Result<BatchProgress, StoreError> {
        let entries = self.store.list_progress(batch_id).await?;
        Ok(BatchProgress::from_entries(&entries))
    }

    /// Publish the terminal snapshot of a batch.
    pub fn finish_batch(&self, job: &BatchJob) {
        self.emit(ProgressEvent::BatchFinished {
            batch_id: job.batch_id.clone(),
            status: job.status,
            successful: job.results.successful.len(),
            failed: job.results.failed.len(),
            skipped: job.results.skipped.len(),
            at: self.clock.now(),
        });
    }

    fn emit(&self, event: ProgressEvent) {
        if let Err(e) = self.events.publish(event) {
            tracing::warn!(error = %e, "failed to publish progress event");
        }
    }
}

//! Collaborators shared by the batch components.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::SchedulerConfig;
use crate::core::events::EventSink;
use crate::core::executor::ExecutionBackend;
use crate::core::model::{ProjectId, UserId};
use crate::core::monitor::ResourceMonitor;
use crate::infra::store::BatchStore;
use crate::util::clock::Clock;

/// Decides which projects a user may batch.
#[async_trait]
pub trait ProjectValidator: Send + Sync {
    /// Subset of `project_ids` the user may batch, in input order.
    async fn filter_batchable(&self, user_id: UserId, project_ids: &[ProjectId]) -> Vec<ProjectId>;
}

/// Validator accepting every project.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllProjects;

#[async_trait]
impl ProjectValidator for AcceptAllProjects {
    async fn filter_batchable(&self, _user_id: UserId, project_ids: &[ProjectId]) -> Vec<ProjectId> {
        project_ids.to_vec()
    }
}

/// Validator accepting a fixed set of projects.
#[derive(Debug, Clone, Default)]
pub struct AllowListProjects {
    allowed: HashSet<ProjectId>,
}

impl AllowListProjects {
    /// Accept only `allowed`.
    pub fn new(allowed: impl IntoIterator<Item = ProjectId>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }
}

#[async_trait]
impl ProjectValidator for AllowListProjects {
    async fn filter_batchable(&self, _user_id: UserId, project_ids: &[ProjectId]) -> Vec<ProjectId> {
        project_ids
            .iter()
            .copied()
            .filter(|id| self.allowed.contains(id))
            .collect()
    }
}

/// Explicit dependency bundle handed to every batch component.
#[derive(Clone)]
pub struct BatchContext {
    /// Batch records and progress.
    pub store: Arc<dyn BatchStore>,
    /// Task execution.
    pub backend: Arc<dyn ExecutionBackend>,
    /// Host capacity.
    pub monitor: Arc<dyn ResourceMonitor>,
    /// Progress notifications.
    pub events: Arc<dyn EventSink>,
    /// Project access checks.
    pub projects: Arc<dyn ProjectValidator>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Limits, profiles and intervals.
    pub config: Arc<SchedulerConfig>,
}

//! Builders to assemble a batch service from configuration.

use std::sync::Arc;

use anyhow::{anyhow, Context};

use crate::config::{SchedulerConfig, StoreBackendConfig};
use crate::core::context::{AcceptAllProjects, BatchContext, ProjectValidator};
use crate::core::error::AppResult;
use crate::core::events::{EventSink, InMemoryEventSink};
use crate::core::executor::ExecutionBackend;
use crate::core::monitor::{ResourceMonitor, SystemResourceMonitor};
use crate::core::service::BatchService;
use crate::infra::store::{BatchStore, FileBatchStore, InMemoryBatchStore};
use crate::util::clock::{Clock, SystemClock};

/// Build the store selected by configuration.
pub fn build_store(cfg: &SchedulerConfig, clock: Arc<dyn Clock>) -> AppResult<Arc<dyn BatchStore>> {
    let store: Arc<dyn BatchStore> = match &cfg.store {
        StoreBackendConfig::InMemory => Arc::new(InMemoryBatchStore::new(cfg.batch_ttl(), clock)),
        StoreBackendConfig::File { path } => Arc::new(
            FileBatchStore::open(path, cfg.batch_ttl(), clock)
                .with_context(|| format!("opening batch journal {}", path.display()))?,
        ),
    };
    Ok(store)
}

/// Assembles a [`BatchService`], defaulting every collaborator but the backend.
pub struct ServiceBuilder {
    config: SchedulerConfig,
    backend: Option<Arc<dyn ExecutionBackend>>,
    store: Option<Arc<dyn BatchStore>>,
    monitor: Option<Arc<dyn ResourceMonitor>>,
    events: Option<Arc<dyn EventSink>>,
    projects: Option<Arc<dyn ProjectValidator>>,
    clock: Option<Arc<dyn Clock>>,
}

impl ServiceBuilder {
    /// Builder over a configuration.
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            backend: None,
            store: None,
            monitor: None,
            events: None,
            projects: None,
            clock: None,
        }
    }

    /// Builder over `BATCH_*` environment configuration.
    pub fn from_env() -> AppResult<Self> {
        let config = SchedulerConfig::from_env().map_err(|e| anyhow!("config invalid: {e}"))?;
        Ok(Self::new(config))
    }

    /// Execution backend (required).
    #[must_use]
    pub fn backend(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Store instead of the configured one.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn BatchStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Resource monitor instead of host sampling.
    #[must_use]
    pub fn monitor(mut self, monitor: Arc<dyn ResourceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Event sink instead of the in-memory buffer.
    #[must_use]
    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Project validator instead of accepting everything.
    #[must_use]
    pub fn projects(mut self, projects: Arc<dyn ProjectValidator>) -> Self {
        self.projects = Some(projects);
        self
    }

    /// Clock instead of system time.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate configuration and assemble the context.
    pub fn build_context(self) -> AppResult<BatchContext> {
        self.config
            .validate()
            .map_err(|e| anyhow!("config invalid: {e}"))?;
        let backend = self
            .backend
            .ok_or_else(|| anyhow!("an execution backend is required"))?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = match self.store {
            Some(store) => store,
            None => build_store(&self.config, clock.clone())?,
        };
        let monitor = self
            .monitor
            .unwrap_or_else(|| Arc::new(SystemResourceMonitor::new(self.config.monitor.clone())));
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(InMemoryEventSink::new(self.config.event_buffer)));
        let projects = self.projects.unwrap_or_else(|| Arc::new(AcceptAllProjects));

        Ok(BatchContext {
            store,
            backend,
            monitor,
            events,
            projects,
            clock,
            config: Arc::new(self.config),
        })
    }

    /// Assemble the service.
    pub fn build(self) -> AppResult<BatchService> {
        Ok(BatchService::new(self.build_context()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::monitor::StaticResourceMonitor;
    use crate::core::resource::ResourceAllocation;
    use crate::infra::backend::InMemoryBackend;

    #[test]
    fn test_backend_is_required() {
        let err = ServiceBuilder::new(SchedulerConfig::default())
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("execution backend"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let cfg = SchedulerConfig {
            default_parallel_limit: 0,
            ..SchedulerConfig::default()
        };
        let err = ServiceBuilder::new(cfg)
            .backend(Arc::new(InMemoryBackend::new()))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("config invalid"));
    }

    #[tokio::test]
    async fn test_file_store_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SchedulerConfig {
            store: StoreBackendConfig::File {
                path: dir.path().join("journal.jsonl"),
            },
            ..SchedulerConfig::default()
        };
        let ctx = ServiceBuilder::new(cfg)
            .backend(Arc::new(InMemoryBackend::new()))
            .monitor(Arc::new(StaticResourceMonitor::new(ResourceAllocation::new(4, 8192, 0))))
            .build_context()
            .unwrap();
        let missing = ctx
            .store
            .get_batch(&crate::core::model::BatchId::from("batch_missing"))
            .await
            .unwrap();
        assert!(missing.is_none());
    }
}

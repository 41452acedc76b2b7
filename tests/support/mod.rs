//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use std::sync::Arc;

use prometheus_batch_scheduler::builders::ServiceBuilder;
use prometheus_batch_scheduler::config::SchedulerConfig;
use prometheus_batch_scheduler::core::{
    BatchId, BatchService, BatchSettings, InMemoryEventSink, ProgressEvent,
    ResourceAllocation, StaticResourceMonitor, VideoQuality,
};
use prometheus_batch_scheduler::infra::InMemoryBackend;
use prometheus_batch_scheduler::util::init_tracing;

/// Service wired to in-memory collaborators the test can inspect.
pub struct Harness {
    /// Service under test.
    pub service: BatchService,
    /// Scripted backend shared with the service.
    pub backend: Arc<InMemoryBackend>,
    /// Every published progress event.
    pub events: Arc<InMemoryEventSink>,
    /// Fixed resource snapshot.
    pub monitor: Arc<StaticResourceMonitor>,
}

impl Harness {
    /// Progress percentages published for a batch, in publication order.
    pub fn progress_trail(&self, batch_id: &BatchId) -> Vec<f64> {
        self.events
            .events_for(batch_id)
            .into_iter()
            .filter_map(|event| match event {
                ProgressEvent::TaskUpdated { progress, .. } => Some(progress.progress_percentage),
                _ => None,
            })
            .collect()
    }
}

/// Defaults with a fast polling interval.
pub fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        poll_interval_ms: 2,
        ..SchedulerConfig::default()
    }
}

/// A roomy host: 16 cores, 64 GiB, one GPU.
pub const fn roomy_host() -> ResourceAllocation {
    ResourceAllocation::new(16, 65_536, 1)
}

/// Harness on a roomy host with test defaults.
pub fn harness() -> Harness {
    harness_with(test_config(), roomy_host())
}

/// Harness with the given configuration and host snapshot.
pub fn harness_with(config: SchedulerConfig, resources: ResourceAllocation) -> Harness {
    init_tracing();
    let backend = Arc::new(InMemoryBackend::new());
    let events = Arc::new(InMemoryEventSink::new(4096));
    let monitor = Arc::new(StaticResourceMonitor::new(resources));
    let service = ServiceBuilder::new(config)
        .backend(backend.clone())
        .events(events.clone())
        .monitor(monitor.clone())
        .build()
        .unwrap();
    Harness {
        service,
        backend,
        events,
        monitor,
    }
}

/// Content, speech and render for every project.
pub fn full_settings() -> BatchSettings {
    BatchSettings {
        generate_content: true,
        generate_tts: true,
        video_quality: VideoQuality::High,
        ..BatchSettings::default()
    }
}

/// Render only.
pub fn render_only() -> BatchSettings {
    BatchSettings::default()
}

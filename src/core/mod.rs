//! Core batch model, planning, scheduling and recovery.

pub mod context;
pub mod error;
pub mod events;
pub mod executor;
pub mod intake;
pub mod model;
pub mod monitor;
pub mod optimizer;
pub mod progress;
pub mod recovery;
pub mod resource;
pub mod scheduler;
pub mod service;
pub mod settings;
pub mod task;

pub use context::{AcceptAllProjects, AllowListProjects, BatchContext, ProjectValidator};
pub use error::{AppResult, BackendError, BatchError, PlanError, StoreError, ValidationError};
pub use events::{BroadcastEventSink, EventSink, EventSinkError, InMemoryEventSink, ProgressEvent};
pub use executor::{ExecutionBackend, HandleState, Spawn, TaskHandle, TaskSubmission};
pub use intake::{BatchIntake, NewBatch};
pub use model::{
    BatchId, BatchJob, BatchMetadata, BatchPriority, BatchResults, BatchStatus, ProcessingMetrics,
    ProjectFailure, ProjectId, ProjectResult, UserId,
};
pub use monitor::{
    ResourceForecast, ResourceMonitor, StaticResourceMonitor, SystemResourceMonitor, Trend,
};
pub use optimizer::{BatchOptimizer, ExecutionPlan};
pub use progress::{BatchProgress, ProgressEntry, ProgressStatus, ProgressTracker, TaskUpdate};
pub use recovery::{RecoveryReport, RecoveryService};
pub use resource::ResourceAllocation;
pub use scheduler::BatchScheduler;
pub use service::{BatchService, BatchStatusReport};
pub use settings::{
    BatchSettings, ContentParams, OptimizationStrategy, RecommendedSettings, RenderParams,
    TtsParams, VideoQuality,
};
pub use task::{QueueName, TaskDescriptor, TaskParams, TaskType};

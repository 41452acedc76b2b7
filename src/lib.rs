//! # Prometheus Batch Scheduler
//!
//! A resource-aware batch scheduling and execution engine for content-generation
//! pipelines.
//!
//! A batch is a set of projects processed together. Each project expands into a
//! linear chain of stages (content generation, speech synthesis, rendering) that
//! are dispatched to a distributed execution backend. The engine orders the work
//! into dependency levels, bounds concurrency from live host telemetry, tracks
//! per-project progress and recovers from partial failure.
//!
//! ## Core Problem Solved
//!
//! - **Variable task cost**: a render needs far more CPU, memory or GPU than a
//!   script, so concurrency is derived per task type from a resource snapshot
//! - **Stage ordering**: no stage starts before its prerequisite finished
//! - **Fault isolation**: one failing project never fails its batch; only plan
//!   or store errors do
//! - **Recovery**: failed projects can be resubmitted as a new, linked batch
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use prometheus_batch_scheduler::builders::ServiceBuilder;
//! use prometheus_batch_scheduler::config::SchedulerConfig;
//! use prometheus_batch_scheduler::core::{BatchSettings, BatchPriority};
//! use prometheus_batch_scheduler::infra::InMemoryBackend;
//!
//! let service = ServiceBuilder::new(SchedulerConfig::default())
//!     .backend(Arc::new(InMemoryBackend::new()))
//!     .build()?;
//!
//! let job = service
//!     .create_batch(42, vec![1, 2, 3], BatchSettings::default(), Some(BatchPriority::High), None)
//!     .await?;
//! let results = service.execute_batch(&job.batch_id).await?;
//! println!("{} projects rendered", results.successful.len());
//! ```
//!
//! For complete scenarios, see the integration suites under `tests/`.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core batch model, planning, scheduling and recovery.
pub mod core;
/// Configuration models for the scheduler, task profiles and stores.
pub mod config;
/// Builders to construct batch services from configuration.
pub mod builders;
/// Infrastructure adapters for stores, queues and execution backends.
pub mod infra;
/// Runtime adapters, batch dispatch and API surface.
pub mod runtime;
/// Shared utilities.
pub mod util;

//! Configuration models for the scheduler, task profiles and store backends.

pub mod scheduler;

pub use scheduler::{MonitorConfig, SchedulerConfig, StoreBackendConfig, TaskProfile, TaskProfiles};

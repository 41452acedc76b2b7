//! Dispatch queues.

pub mod memory;

pub use memory::{BatchQueue, QueuedBatch};

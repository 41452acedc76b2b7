//! Infrastructure adapters for stores, queues and execution backends.

pub mod backend;
pub mod queue;
pub mod store;

pub use backend::InMemoryBackend;
pub use queue::BatchQueue;
pub use store::{BatchStore, FileBatchStore, InMemoryBatchStore};

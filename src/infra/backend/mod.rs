//! Execution backend adapters.

pub mod memory;

pub use memory::{InMemoryBackend, InMemoryHandle, ScriptedOutcome, TaskScript};

//! Tokio runtime spawner implementation.

use std::future::Future;
use std::sync::Arc;

use crate::core::executor::Spawn;

/// Tokio-based spawner that executes tasks on a tokio runtime.
#[derive(Clone, Default)]
pub struct TokioSpawner {
    handle: Option<Arc<tokio::runtime::Handle>>,
}

impl TokioSpawner {
    /// Create a new `TokioSpawner` bound to a runtime handle.
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self {
            handle: Some(Arc::new(handle)),
        }
    }

    /// Bind to the runtime the caller is running on, if any.
    pub fn current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }
}

impl Spawn for TokioSpawner {
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match &self.handle {
            Some(handle) => {
                handle.spawn(fut);
            }
            None => {
                tokio::spawn(fut);
            }
        }
    }
}

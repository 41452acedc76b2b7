//! Execution backend contract.
//!
//! The scheduler never runs pipeline stages itself. It submits named tasks to a
//! backend and polls the returned handles until they reach a terminal state.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::core::error::BackendError;
use crate::core::task::QueueName;

/// Submission request for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSubmission {
    /// Backend task name, e.g. `generate_video`.
    pub task_name: String,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Keyword arguments.
    pub kwargs: Map<String, Value>,
    /// Numeric priority (1-10).
    pub priority: u8,
    /// Target queue.
    pub queue: QueueName,
}

/// Observed state of a submitted task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum HandleState {
    /// Still queued or running.
    Pending,
    /// Finished with a result.
    Succeeded(Value),
    /// Finished with failure info.
    Failed(String),
}

impl HandleState {
    /// Whether the task reached a terminal state.
    pub const fn ready(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Whether the task finished successfully.
    pub const fn successful(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    /// Result payload of a successful task.
    pub const fn result(&self) -> Option<&Value> {
        match self {
            Self::Succeeded(v) => Some(v),
            _ => None,
        }
    }

    /// Failure info of a failed task.
    pub fn info(&self) -> Option<&str> {
        match self {
            Self::Failed(info) => Some(info.as_str()),
            _ => None,
        }
    }
}

/// Handle to a submitted task.
#[async_trait]
pub trait TaskHandle: Send + Sync {
    /// Backend task id.
    fn id(&self) -> &str;

    /// Poll the current state.
    async fn state(&self) -> Result<HandleState, BackendError>;

    /// Poll until the task is terminal or `timeout` elapses.
    ///
    /// Returns the terminal state; elapsing the timeout is a
    /// [`BackendError::Timeout`].
    async fn wait(&self, timeout: Duration, poll_interval: Duration) -> Result<HandleState, BackendError> {
        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            let state = self.state().await?;
            if state.ready() {
                return Ok(state);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(BackendError::Timeout {
                    task_id: self.id().to_owned(),
                    seconds: (now - started).as_secs_f64(),
                });
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    /// Ask the backend to stop the task. Best-effort; the default does nothing.
    async fn revoke(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Distributed task execution backend.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Submit a task for asynchronous execution.
    async fn submit(&self, submission: TaskSubmission) -> Result<Box<dyn TaskHandle>, BackendError>;
}

/// Runtime spawner abstraction.
pub trait Spawn {
    /// Spawn an async task that returns a future.
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountdownHandle {
        polls_left: AtomicUsize,
    }

    #[async_trait]
    impl TaskHandle for CountdownHandle {
        fn id(&self) -> &str {
            "countdown"
        }

        async fn state(&self) -> Result<HandleState, BackendError> {
            let left = self.polls_left.load(Ordering::SeqCst);
            if left == 0 {
                return Ok(HandleState::Succeeded(Value::from("done")));
            }
            self.polls_left.store(left - 1, Ordering::SeqCst);
            Ok(HandleState::Pending)
        }
    }

    #[tokio::test]
    async fn test_wait_polls_until_ready() {
        let handle = CountdownHandle {
            polls_left: AtomicUsize::new(3),
        };
        let state = handle
            .wait(Duration::from_secs(5), Duration::from_millis(1))
            .await
            .unwrap();
        assert!(state.successful());
        assert_eq!(state.result(), Some(&Value::from("done")));
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let handle = CountdownHandle {
            polls_left: AtomicUsize::new(usize::MAX),
        };
        let err = handle
            .wait(Duration::from_millis(20), Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(handle.revoke().await.is_ok());
    }

    #[test]
    fn test_state_accessors() {
        let failed = HandleState::Failed("boom".into());
        assert!(failed.ready());
        assert!(!failed.successful());
        assert_eq!(failed.info(), Some("boom"));
        assert!(!HandleState::Pending.ready());
    }
}

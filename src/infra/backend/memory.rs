//! In-process execution backend with scripted outcomes.
//!
//! Tasks complete after a delay on the spawner's runtime. Outcomes can be
//! scripted per project and task type, and the backend keeps in-flight counts
//! per task name so tests can check concurrency bounds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::core::error::BackendError;
use crate::core::executor::{ExecutionBackend, HandleState, Spawn, TaskHandle, TaskSubmission};
use crate::core::model::ProjectId;
use crate::core::task::TaskType;
use crate::runtime::tokio_spawner::TokioSpawner;

/// How a scripted task ends.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedOutcome {
    /// Succeed with this result.
    Succeed(Value),
    /// Fail with this info.
    Fail(String),
    /// Never finish unless revoked.
    Hang,
    /// Refuse the submission.
    RejectSubmit(String),
}

/// Outcome and delay of one scripted task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskScript {
    /// Terminal outcome.
    pub outcome: ScriptedOutcome,
    /// Time until the outcome is reached.
    pub delay: Duration,
}

#[derive(Default)]
struct InFlight {
    current: usize,
    max: usize,
}

#[derive(Default)]
struct Shared {
    states: Mutex<HashMap<String, HandleState>>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    submissions: Mutex<Vec<TaskSubmission>>,
    revoked: Mutex<Vec<String>>,
}

impl Shared {
    fn enter(&self, task_name: &str) {
        let mut in_flight = self.in_flight.lock();
        let slot = in_flight.entry(task_name.to_owned()).or_default();
        slot.current += 1;
        slot.max = slot.max.max(slot.current);
    }

    fn finish(&self, task_id: &str, task_name: &str, state: HandleState) {
        {
            let mut states = self.states.lock();
            match states.get_mut(task_id) {
                Some(current) if !current.ready() => *current = state,
                _ => return,
            }
        }
        if let Some(slot) = self.in_flight.lock().get_mut(task_name) {
            slot.current = slot.current.saturating_sub(1);
        }
    }
}

/// Handle to a task of an [`InMemoryBackend`].
pub struct InMemoryHandle {
    id: String,
    task_name: String,
    shared: Arc<Shared>,
}

#[async_trait]
impl TaskHandle for InMemoryHandle {
    fn id(&self) -> &str {
        &self.id
    }

    async fn state(&self) -> Result<HandleState, BackendError> {
        self.shared
            .states
            .lock()
            .get(&self.id)
            .cloned()
            .ok_or_else(|| BackendError::Poll(format!("unknown task {}", self.id)))
    }

    async fn revoke(&self) -> Result<(), BackendError> {
        self.shared.revoked.lock().push(self.id.clone());
        self.shared
            .finish(&self.id, &self.task_name, HandleState::Failed("revoked".into()));
        Ok(())
    }
}

/// Execution backend running scripted tasks in process.
pub struct InMemoryBackend<S = TokioSpawner> {
    shared: Arc<Shared>,
    scripts: Mutex<HashMap<(ProjectId, String), TaskScript>>,
    default_delay: Duration,
    next_id: AtomicU64,
    spawner: S,
}

impl InMemoryBackend<TokioSpawner> {
    /// Backend on the ambient tokio runtime; unscripted tasks succeed after 10ms.
    pub fn new() -> Self {
        Self::with_spawner(TokioSpawner::default())
    }
}

impl Default for InMemoryBackend<TokioSpawner> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Spawn> InMemoryBackend<S> {
    /// Backend completing tasks on `spawner`.
    pub fn with_spawner(spawner: S) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            scripts: Mutex::new(HashMap::new()),
            default_delay: Duration::from_millis(10),
            next_id: AtomicU64::new(1),
            spawner,
        }
    }

    /// Delay used by unscripted tasks.
    #[must_use]
    pub const fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    /// Script the task of `task_type` for `project_id`.
    pub fn script(&self, project_id: ProjectId, task_type: TaskType, script: TaskScript) {
        self.scripts
            .lock()
            .insert((project_id, task_type.task_name()), script);
    }

    /// Make the task of `task_type` for `project_id` fail after the default delay.
    pub fn fail(&self, project_id: ProjectId, task_type: TaskType, info: impl Into<String>) {
        self.script(
            project_id,
            task_type,
            TaskScript {
                outcome: ScriptedOutcome::Fail(info.into()),
                delay: self.default_delay,
            },
        );
    }

    /// Make the task of `task_type` for `project_id` never finish.
    pub fn hang(&self, project_id: ProjectId, task_type: TaskType) {
        self.script(
            project_id,
            task_type,
            TaskScript {
                outcome: ScriptedOutcome::Hang,
                delay: Duration::ZERO,
            },
        );
    }

    /// Every submission received, in order.
    pub fn submissions(&self) -> Vec<TaskSubmission> {
        self.shared.submissions.lock().clone()
    }

    /// Projects submitted for a task type, in submission order.
    pub fn submitted_projects(&self, task_type: TaskType) -> Vec<ProjectId> {
        let name = task_type.task_name();
        self.shared
            .submissions
            .lock()
            .iter()
            .filter(|s| s.task_name == name)
            .filter_map(|s| s.args.first().and_then(Value::as_u64))
            .collect()
    }

    /// Highest number of simultaneously running tasks of a type.
    pub fn max_in_flight(&self, task_type: TaskType) -> usize {
        self.shared
            .in_flight
            .lock()
            .get(&task_type.task_name())
            .map_or(0, |slot| slot.max)
    }

    /// Ids of revoked tasks.
    pub fn revoked(&self) -> Vec<String> {
        self.shared.revoked.lock().clone()
    }
}

#[async_trait]
impl<S: Spawn + Send + Sync> ExecutionBackend for InMemoryBackend<S> {
    async fn submit(&self, submission: TaskSubmission) -> Result<Box<dyn TaskHandle>, BackendError> {
        let project_id = submission.args.first().and_then(Value::as_u64);
        let script = project_id.and_then(|p| {
            self.scripts
                .lock()
                .get(&(p, submission.task_name.clone()))
                .cloned()
        });
        let script = script.unwrap_or_else(|| TaskScript {
            outcome: ScriptedOutcome::Succeed(json!({
                "project_id": project_id,
                "task": submission.task_name,
            })),
            delay: self.default_delay,
        });

        if let ScriptedOutcome::RejectSubmit(reason) = &script.outcome {
            return Err(BackendError::Submit(reason.clone()));
        }

        let id = format!("mem-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let task_name = submission.task_name.clone();
        self.shared.submissions.lock().push(submission);
        self.shared
            .states
            .lock()
            .insert(id.clone(), HandleState::Pending);
        self.shared.enter(&task_name);
        tracing::debug!(task_id = %id, task_name = %task_name, "in-memory task accepted");

        let terminal = match script.outcome {
            ScriptedOutcome::Succeed(v) => Some(HandleState::Succeeded(v)),
            ScriptedOutcome::Fail(info) => Some(HandleState::Failed(info)),
            ScriptedOutcome::Hang | ScriptedOutcome::RejectSubmit(_) => None,
        };
        if let Some(state) = terminal {
            let shared = Arc::clone(&self.shared);
            let (task_id, name, delay) = (id.clone(), task_name.clone(), script.delay);
            self.spawner.spawn(async move {
                tokio::time::sleep(delay).await;
                shared.finish(&task_id, &name, state);
            });
        }

        Ok(Box::new(InMemoryHandle {
            id,
            task_name,
            shared: Arc::clone(&self.shared),
        }))
    }
}

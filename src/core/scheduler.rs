//! Batch execution driver.
//!
//! A batch runs level by level. Within a level, tasks are grouped by type and
//! the groups run one after another; each group runs under a semaphore sized
//! from the current resource snapshot, the batch's parallel limit and the
//! group size. Task failures and timeouts become failure records, as do tasks
//! whose progress could not be written. Only plan errors and batch record
//! writes fail the batch as a whole.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use futures::future::join_all;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::core::context::BatchContext;
use crate::core::error::{BackendError, BatchError, StoreError};
use crate::core::executor::{HandleState, TaskSubmission};
use crate::core::model::{
    BatchId, BatchJob, BatchResults, ProjectFailure, ProjectId, ProjectResult,
};
use crate::core::optimizer::{BatchOptimizer, ExecutionPlan};
use crate::core::progress::{ProgressStatus, ProgressTracker, TaskUpdate};
use crate::core::task::{TaskDescriptor, TaskType};

const DEPENDENCY_NOT_COMPLETED: &str = "dependency not completed";
const PROGRESS_NOT_RECORDED: &str = "progress not recorded";

#[derive(Debug, Clone)]
enum TaskOutcome {
    Succeeded { task_id: String, result: Value },
    Failed { error: String, timed_out: bool },
}

#[derive(Debug)]
struct TaskRun {
    task_type: TaskType,
    project_id: ProjectId,
    outcome: TaskOutcome,
    busy: Duration,
}

/// Drives one batch from `pending` to a terminal status.
#[derive(Clone)]
pub struct BatchScheduler {
    ctx: BatchContext,
    tracker: ProgressTracker,
    optimizer: BatchOptimizer,
}

impl BatchScheduler {
    /// Scheduler over the given context.
    pub fn new(ctx: BatchContext) -> Self {
        let tracker = ProgressTracker::new(
            ctx.store.clone(),
            ctx.events.clone(),
            ctx.clock.clone(),
        );
        let optimizer = BatchOptimizer::new(ctx.config.tasks.clone());
        Self {
            ctx,
            tracker,
            optimizer,
        }
    }

    /// Progress tracker writing this scheduler's entries.
    pub const fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    /// Optimizer building this scheduler's plans.
    pub const fn optimizer(&self) -> &BatchOptimizer {
        &self.optimizer
    }

    /// Execute a pending batch and return its aggregated results.
    ///
    /// The claiming write carries an optimistic version check, so of two
    /// concurrent calls on the same batch exactly one runs it.
    pub async fn execute_batch(&self, batch_id: &BatchId) -> Result<BatchResults, BatchError> {
        let mut job = self
            .ctx
            .store
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| BatchError::NotFound(batch_id.clone()))?;
        job.mark_processing(self.ctx.clock.now())?;
        self.ctx.store.update_batch(&mut job).await?;
        tracing::info!(
            batch_id = %job.batch_id,
            projects = job.project_ids.len(),
            parallel_limit = job.parallel_limit,
            priority = ?job.priority,
            "batch processing started"
        );

        let error = match self.run(&job).await {
            Ok(results) => {
                let mut done = job.clone();
                done.mark_completed(results.clone(), self.ctx.clock.now())?;
                match self.ctx.store.update_batch(&mut done).await {
                    Ok(()) => {
                        tracing::info!(
                            batch_id = %done.batch_id,
                            successful = results.successful.len(),
                            failed = results.failed.len(),
                            skipped = results.skipped.len(),
                            "batch processing completed"
                        );
                        self.tracker.finish_batch(&done);
                        return Ok(results);
                    }
                    Err(e) => BatchError::Store(e),
                }
            }
            Err(e) => e,
        };

        tracing::error!(batch_id = %job.batch_id, error = %error, "batch processing failed");
        job.mark_failed(error.to_string(), self.ctx.clock.now())?;
        if let Err(e) = self.ctx.store.update_batch(&mut job).await {
            tracing::error!(batch_id = %job.batch_id, error = %e, "failed to persist batch failure");
        }
        self.tracker.finish_batch(&job);
        Err(error)
    }

    async fn run(&self, job: &BatchJob) -> Result<BatchResults, BatchError> {
        self.tracker.init_batch(job).await?;
        let plan = self.optimizer.optimize_batch(job)?;
        let parallel_limit = usize::try_from(job.parallel_limit).unwrap_or(usize::MAX).max(1);

        let mut outcomes: HashMap<(ProjectId, TaskType), TaskOutcome> = HashMap::new();
        let mut first_failure: HashMap<ProjectId, ProjectFailure> = HashMap::new();
        let mut busy_ms: BTreeMap<TaskType, u64> = BTreeMap::new();

        for (index, level) in plan.levels.iter().enumerate() {
            let mut groups: BTreeMap<TaskType, Vec<&TaskDescriptor>> = BTreeMap::new();
            for task in level {
                groups.entry(task.task_type).or_default().push(task);
            }
            tracing::debug!(
                batch_id = %job.batch_id,
                level = index,
                tasks = level.len(),
                groups = groups.len(),
                "executing dependency level"
            );

            for (task_type, group) in groups {
                let concurrency = self.group_concurrency(task_type, group.len(), parallel_limit).await;
                let semaphore = Semaphore::new(concurrency);
                let runs = join_all(group.into_iter().map(|task| {
                    let ready = task.depends_on.iter().all(|dep| {
                        matches!(
                            outcomes.get(&(task.project_id, *dep)),
                            Some(TaskOutcome::Succeeded { .. })
                        )
                    });
                    let is_final = plan.final_tasks.get(&task.project_id) == Some(&task.task_type);
                    self.run_task(&job.batch_id, task, is_final, ready, &semaphore)
                }))
                .await;

                for run in runs {
                    *busy_ms.entry(run.task_type).or_default() +=
                        u64::try_from(run.busy.as_millis()).unwrap_or(u64::MAX);
                    if let TaskOutcome::Failed { error, timed_out } = &run.outcome {
                        first_failure
                            .entry(run.project_id)
                            .or_insert_with(|| ProjectFailure {
                                project_id: run.project_id,
                                task_type: Some(run.task_type),
                                error: error.clone(),
                                timed_out: *timed_out,
                            });
                    }
                    outcomes.insert((run.project_id, run.task_type), run.outcome);
                }
            }
        }

        Ok(Self::classify(job, &plan, &outcomes, &mut first_failure, busy_ms))
    }

    async fn group_concurrency(&self, task_type: TaskType, group_size: usize, parallel_limit: usize) -> usize {
        let available = self.ctx.monitor.get_available_resources().await;
        let requirement = self.ctx.config.tasks.get(task_type).requirements;
        let resource_cap = requirement.max_concurrent(&available);
        let concurrency = resource_cap.min(parallel_limit).min(group_size).max(1);
        tracing::debug!(
            %task_type,
            resource_cap,
            parallel_limit,
            group_size,
            concurrency,
            "sized task group"
        );
        concurrency
    }

    async fn run_task(
        &self,
        batch_id: &BatchId,
        task: &TaskDescriptor,
        is_final: bool,
        ready: bool,
        semaphore: &Semaphore,
    ) -> TaskRun {
        let mut run = TaskRun {
            task_type: task.task_type,
            project_id: task.project_id,
            outcome: TaskOutcome::Failed {
                error: DEPENDENCY_NOT_COMPLETED.into(),
                timed_out: false,
            },
            busy: Duration::ZERO,
        };

        if !ready {
            tracing::debug!(
                %batch_id,
                project_id = task.project_id,
                %task.task_type,
                "skipping task with incomplete dependency"
            );
            if let Err(e) = self
                .record(
                    batch_id,
                    task,
                    None,
                    ProgressStatus::Failed,
                    is_final,
                    json!({ "error": DEPENDENCY_NOT_COMPLETED, "depends_on": task.depends_on }),
                )
                .await
            {
                tracing::warn!(%batch_id, project_id = task.project_id, error = %e, "failed to record task progress");
            }
            return run;
        }

        let Ok(_permit) = semaphore.acquire().await else {
            run.outcome = TaskOutcome::Failed {
                error: "task group closed".into(),
                timed_out: false,
            };
            return run;
        };

        let started = Instant::now();
        let (task_id, outcome) = self.submit_and_wait(batch_id, task, is_final).await;
        run.busy = started.elapsed();

        let (status, details) = match &outcome {
            TaskOutcome::Succeeded { result, .. } => (ProgressStatus::Completed, json!({ "result": result })),
            TaskOutcome::Failed { error, timed_out } => {
                tracing::warn!(
                    %batch_id,
                    project_id = task.project_id,
                    %task.task_type,
                    timed_out,
                    error = %error,
                    "task failed"
                );
                (
                    ProgressStatus::Failed,
                    json!({ "error": error, "timeout": timed_out }),
                )
            }
        };
        // A task whose result never reached the store counts as failed.
        run.outcome = match self.record(batch_id, task, task_id, status, is_final, details).await {
            Ok(()) => outcome,
            Err(e) => {
                tracing::warn!(%batch_id, project_id = task.project_id, error = %e, "failed to record task progress");
                match outcome {
                    TaskOutcome::Succeeded { .. } => TaskOutcome::Failed {
                        error: format!("{PROGRESS_NOT_RECORDED}: {e}"),
                        timed_out: false,
                    },
                    failed => failed,
                }
            }
        };
        run
    }

    async fn submit_and_wait(
        &self,
        batch_id: &BatchId,
        task: &TaskDescriptor,
        is_final: bool,
    ) -> (Option<String>, TaskOutcome) {
        let failed = |error: String, timed_out: bool| TaskOutcome::Failed { error, timed_out };

        let kwargs = match task.params.to_kwargs() {
            Ok(kwargs) => kwargs,
            Err(e) => return (None, failed(format!("invalid task parameters: {e}"), false)),
        };
        let submission = TaskSubmission {
            task_name: task.task_name.clone(),
            args: task.args.clone(),
            kwargs,
            priority: task.priority.value(),
            queue: task.queue,
        };

        let handle = match self.ctx.backend.submit(submission).await {
            Ok(handle) => handle,
            Err(e) => return (None, failed(e.to_string(), false)),
        };
        let task_id = handle.id().to_owned();
        tracing::debug!(
            %batch_id,
            project_id = task.project_id,
            %task.task_type,
            task_id = %task_id,
            queue = %task.queue,
            "task submitted"
        );
        if let Err(e) = self
            .record(
                batch_id,
                task,
                Some(task_id.clone()),
                ProgressStatus::Submitted,
                is_final,
                json!({ "queue": task.queue }),
            )
            .await
        {
            if let Err(revoke) = handle.revoke().await {
                tracing::warn!(task_id = %task_id, error = %revoke, "failed to revoke unrecorded task");
            }
            return (Some(task_id), failed(format!("{PROGRESS_NOT_RECORDED}: {e}"), false));
        }

        let outcome = match handle.wait(task.timeout, self.ctx.config.poll_interval()).await {
            Ok(HandleState::Succeeded(result)) => TaskOutcome::Succeeded {
                task_id: task_id.clone(),
                result,
            },
            Ok(HandleState::Failed(info)) => failed(info, false),
            Ok(HandleState::Pending) => failed("task did not reach a terminal state".into(), false),
            Err(e @ BackendError::Timeout { .. }) => {
                if let Err(revoke) = handle.revoke().await {
                    tracing::warn!(task_id = %task_id, error = %revoke, "failed to revoke timed out task");
                }
                failed(e.to_string(), true)
            }
            Err(e) => failed(e.to_string(), false),
        };
        (Some(task_id), outcome)
    }

    async fn record(
        &self,
        batch_id: &BatchId,
        task: &TaskDescriptor,
        task_id: Option<String>,
        status: ProgressStatus,
        is_final: bool,
        details: Value,
    ) -> Result<(), StoreError> {
        let update = TaskUpdate {
            project_id: task.project_id,
            task_type: task.task_type,
            task_id,
            status,
            is_final,
            details,
        };
        self.tracker.update_task_progress(batch_id, update).await.map(|_| ())
    }

    fn classify(
        job: &BatchJob,
        plan: &ExecutionPlan,
        outcomes: &HashMap<(ProjectId, TaskType), TaskOutcome>,
        first_failure: &mut HashMap<ProjectId, ProjectFailure>,
        busy_ms: BTreeMap<TaskType, u64>,
    ) -> BatchResults {
        let mut results = BatchResults {
            busy_ms,
            ..BatchResults::default()
        };
        for &project_id in &job.project_ids {
            let Some(final_type) = plan.final_tasks.get(&project_id) else {
                results.skipped.push(project_id);
                continue;
            };
            match outcomes.get(&(project_id, *final_type)) {
                Some(TaskOutcome::Succeeded { task_id, result }) => {
                    results.successful.push(ProjectResult {
                        project_id,
                        task_id: task_id.clone(),
                        result: result.clone(),
                    });
                }
                other => {
                    let failure = first_failure.remove(&project_id).unwrap_or_else(|| ProjectFailure {
                        project_id,
                        task_type: Some(*final_type),
                        error: match other {
                            Some(TaskOutcome::Failed { error, .. }) => error.clone(),
                            _ => "task was not executed".into(),
                        },
                        timed_out: matches!(other, Some(TaskOutcome::Failed { timed_out: true, .. })),
                    });
                    results.failed.push(failure);
                }
            }
        }
        results
    }
}

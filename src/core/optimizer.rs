//! Execution plan construction.
//!
//! Each project expands into a linear chain of stages. A strategy transform
//! rewrites priorities, queues or render quality, and the flattened task list
//! is partitioned into dependency levels: every task's prerequisites live in a
//! strictly earlier level.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::TaskProfiles;
use crate::core::error::PlanError;
use crate::core::model::{BatchJob, BatchPriority, ProjectId};
use crate::core::monitor::ResourceForecast;
use crate::core::settings::{
    BatchSettings, OptimizationStrategy, RecommendedSettings, RenderParams, VideoQuality,
};
use crate::core::task::{QueueName, TaskDescriptor, TaskParams, TaskType};

/// Dependency-leveled plan for one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Levels in execution order.
    pub levels: Vec<Vec<TaskDescriptor>>,
    /// Final stage of every planned project.
    pub final_tasks: BTreeMap<ProjectId, TaskType>,
    /// Projects that contributed no tasks.
    pub skipped: Vec<ProjectId>,
}

impl ExecutionPlan {
    /// Number of descriptors across all levels.
    pub fn task_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Iterate over all descriptors in level order.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskDescriptor> {
        self.levels.iter().flatten()
    }
}

/// Builds execution plans and recommends batch settings.
#[derive(Debug, Clone, Default)]
pub struct BatchOptimizer {
    profiles: TaskProfiles,
}

impl BatchOptimizer {
    /// Optimizer using the given per-type timeouts.
    pub const fn new(profiles: TaskProfiles) -> Self {
        Self { profiles }
    }

    /// Build the leveled plan for a batch.
    pub fn optimize_batch(&self, job: &BatchJob) -> Result<ExecutionPlan, PlanError> {
        let strategy = job.metadata.optimization_strategy;
        let mut plan = ExecutionPlan::default();
        let mut tasks = Vec::new();

        for &project_id in &job.project_ids {
            let mut chain = self.create_project_tasks(project_id, &job.settings, job.priority);
            if chain.is_empty() {
                plan.skipped.push(project_id);
                continue;
            }
            apply_strategy(&mut chain, strategy);
            if let Some(last) = chain.last() {
                plan.final_tasks.insert(project_id, last.task_type);
            }
            tasks.extend(chain);
        }

        plan.levels = partition_levels(tasks)?;
        tracing::debug!(
            batch_id = %job.batch_id,
            tasks = plan.task_count(),
            levels = plan.levels.len(),
            skipped = plan.skipped.len(),
            ?strategy,
            "built execution plan"
        );
        Ok(plan)
    }

    /// Linear stage chain for one project.
    pub fn create_project_tasks(
        &self,
        project_id: ProjectId,
        settings: &BatchSettings,
        priority: BatchPriority,
    ) -> Vec<TaskDescriptor> {
        let mut chain: Vec<TaskDescriptor> = Vec::with_capacity(3);
        for task_type in settings.stages() {
            let params = match task_type {
                TaskType::Content => TaskParams::Content(settings.content.clone()),
                TaskType::Tts => TaskParams::Tts(settings.tts.clone()),
                _ => TaskParams::Render(RenderParams {
                    quality: Some(settings.video.quality.unwrap_or(settings.video_quality)),
                    ..settings.video.clone()
                }),
            };
            let queue = if task_type == TaskType::AdvancedVideo && settings.gpu_acceleration {
                QueueName::Gpu
            } else {
                task_type.default_queue()
            };
            let depends_on = chain.last().map(|prev| vec![prev.task_type]).unwrap_or_default();
            chain.push(TaskDescriptor {
                project_id,
                task_type,
                task_name: task_type.task_name(),
                queue,
                args: vec![project_id.into()],
                params,
                priority,
                timeout: self.profiles.get(task_type).timeout(),
                depends_on,
            });
        }
        chain
    }

    /// Recommend settings for a prospective batch.
    pub fn calculate_optimal_settings(
        &self,
        project_count: usize,
        forecast: &ResourceForecast,
        target_completion_time: Option<Duration>,
    ) -> RecommendedSettings {
        let mut settings = RecommendedSettings {
            parallel_limit: 3,
            video_quality: VideoQuality::Medium,
            optimization_strategy: OptimizationStrategy::Balanced,
        };

        if project_count < 10 {
            settings.parallel_limit = 5;
            settings.video_quality = VideoQuality::High;
        } else if project_count > 30 {
            settings.parallel_limit = 2;
        }

        if let Some(target) = target_completion_time {
            let hours = target.as_secs_f64() / 3600.0;
            if hours < 1.0 {
                settings.optimization_strategy = OptimizationStrategy::Speed;
                settings.parallel_limit = 10;
            } else if hours > 6.0 {
                settings.optimization_strategy = OptimizationStrategy::Cost;
                settings.parallel_limit = 1;
            }
        }

        tracing::debug!(
            project_count,
            trend = ?forecast.trend,
            parallel_limit = settings.parallel_limit,
            "recommended batch settings"
        );
        settings
    }
}

/// Rewrite a project's tasks for the strategy. Pure.
pub fn apply_strategy(tasks: &mut [TaskDescriptor], strategy: OptimizationStrategy) {
    match strategy {
        OptimizationStrategy::Speed => {
            for task in tasks {
                task.priority = BatchPriority::High;
            }
        }
        OptimizationStrategy::Cost => {
            for task in tasks {
                task.priority = BatchPriority::Low;
                if task.queue.is_gpu() {
                    if let Some(cpu) = task.task_type.cpu_fallback_queue() {
                        task.queue = cpu;
                    }
                }
            }
        }
        OptimizationStrategy::Quality => {
            for task in tasks {
                if let Some(render) = task.params.render_mut() {
                    let current = render.quality.unwrap_or_default();
                    render.quality = Some(current.max(VideoQuality::High));
                }
            }
        }
        OptimizationStrategy::Balanced => {}
    }
}

/// Partition tasks into dependency levels.
///
/// Dependencies are resolved within the owning project. Order inside a level
/// follows the input order.
pub fn partition_levels(tasks: Vec<TaskDescriptor>) -> Result<Vec<Vec<TaskDescriptor>>, PlanError> {
    let keys: HashSet<(ProjectId, TaskType)> = tasks.iter().map(TaskDescriptor::key).collect();
    for task in &tasks {
        if let Some(missing) = task
            .depends_on
            .iter()
            .find(|dep| !keys.contains(&(task.project_id, **dep)))
        {
            return Err(PlanError::UnresolvedDependency {
                project_id: task.project_id,
                task_type: task.task_type,
                missing: *missing,
            });
        }
    }

    let mut placed: HashSet<(ProjectId, TaskType)> = HashSet::with_capacity(tasks.len());
    let mut remaining = tasks;
    let mut levels = Vec::new();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|task| {
            task.depends_on
                .iter()
                .all(|dep| placed.contains(&(task.project_id, *dep)))
        });
        if ready.is_empty() {
            return Err(PlanError::Cycle(blocked.len()));
        }
        placed.extend(ready.iter().map(TaskDescriptor::key));
        levels.push(ready);
        remaining = blocked;
    }
    Ok(levels)
}

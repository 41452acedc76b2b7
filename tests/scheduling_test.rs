//! Integration tests for level-ordered, resource-bounded execution.
//!
//! This test validates:
//! 1. Stages run level by level: no speech task starts before every script finished
//! 2. Group concurrency never exceeds the resource cap or the parallel limit
//! 3. A timed out task is revoked and recorded while its siblings complete
//! 4. Dependents of a failed stage are never submitted
//! 5. Published progress never decreases
//! 6. GPU renders are routed to the gpu queue

mod support;

use std::time::Duration;

use prometheus_batch_scheduler::core::{
    BatchSettings, BatchStatus, ProgressEvent, ProgressStatus, QueueName, ResourceAllocation,
    TaskType, VideoQuality,
};
use prometheus_batch_scheduler::infra::backend::{ScriptedOutcome, TaskScript};
use serde_json::json;
use support::{full_settings, harness, harness_with, render_only, test_config};

#[tokio::test]
async fn test_levels_run_in_stage_order() {
    let h = harness();
    let job = h
        .service
        .create_batch(1, vec![1, 2, 3, 4], full_settings(), None, None)
        .await
        .unwrap();
    h.service.execute_batch(&job.batch_id).await.unwrap();

    let names: Vec<String> = h
        .backend
        .submissions()
        .into_iter()
        .map(|s| s.task_name)
        .collect();
    let stage = |name: &str| {
        [TaskType::Content, TaskType::Tts, TaskType::Video]
            .iter()
            .position(|t| t.task_name() == name)
            .unwrap()
    };
    assert_eq!(names.len(), 12);
    assert!(names.windows(2).all(|w| stage(&w[0]) <= stage(&w[1])));

    // Each submission carries its project as the first argument.
    assert_eq!(h.backend.submitted_projects(TaskType::Tts).len(), 4);
    let mut rendered = h.backend.submitted_projects(TaskType::Video);
    rendered.sort_unstable();
    assert_eq!(rendered, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_concurrency_bounded_by_resources() {
    // Four cores fit two renders needing two cores each.
    let h = harness_with(test_config(), ResourceAllocation::new(4, 8192, 0));
    let job = h
        .service
        .create_batch(1, (1..=6).collect(), render_only(), None, None)
        .await
        .unwrap();
    assert_eq!(job.parallel_limit, 3);
    let results = h.service.execute_batch(&job.batch_id).await.unwrap();

    assert_eq!(results.successful.len(), 6);
    assert_eq!(h.backend.max_in_flight(TaskType::Video), 2);
}

#[tokio::test]
async fn test_concurrency_bounded_by_parallel_limit() {
    let h = harness();
    let settings = BatchSettings {
        parallel_limit: Some(1),
        ..render_only()
    };
    let job = h
        .service
        .create_batch(1, (1..=4).collect(), settings, None, None)
        .await
        .unwrap();
    h.service.execute_batch(&job.batch_id).await.unwrap();
    assert_eq!(h.backend.max_in_flight(TaskType::Video), 1);
}

#[tokio::test]
async fn test_starved_host_still_makes_progress() {
    let h = harness_with(test_config(), ResourceAllocation::new(0, 0, 0));
    let job = h
        .service
        .create_batch(1, vec![1, 2, 3], render_only(), None, None)
        .await
        .unwrap();
    let results = h.service.execute_batch(&job.batch_id).await.unwrap();
    assert_eq!(results.successful.len(), 3);
    assert_eq!(h.backend.max_in_flight(TaskType::Video), 1);
}

#[tokio::test]
async fn test_timeout_is_revoked_and_recorded() {
    let mut config = test_config();
    config.tasks.get_mut(TaskType::Video).timeout_ms = 80;
    let h = harness_with(config, support::roomy_host());
    h.backend.hang(2, TaskType::Video);

    let job = h
        .service
        .create_batch(1, vec![1, 2, 3], render_only(), None, None)
        .await
        .unwrap();
    let results = h.service.execute_batch(&job.batch_id).await.unwrap();

    let mut done: Vec<_> = results.successful.iter().map(|r| r.project_id).collect();
    done.sort_unstable();
    assert_eq!(done, vec![1, 3]);
    assert_eq!(results.failed.len(), 1);
    let failure = &results.failed[0];
    assert_eq!(failure.project_id, 2);
    assert_eq!(failure.task_type, Some(TaskType::Video));
    assert!(failure.timed_out);
    assert!(failure.error.contains("timed out"));
    assert_eq!(h.backend.revoked().len(), 1);

    let report = h.service.get_batch_status(&job.batch_id).await.unwrap();
    assert_eq!(report.job.status, BatchStatus::Completed);
    assert_eq!(report.progress.failed, 1);
    assert_eq!(report.progress.completed, 2);
}

#[tokio::test]
async fn test_failed_stage_blocks_dependents() {
    let h = harness();
    h.backend.fail(1, TaskType::Content, "llm quota exceeded");

    let job = h
        .service
        .create_batch(1, vec![1, 2], full_settings(), None, None)
        .await
        .unwrap();
    let results = h.service.execute_batch(&job.batch_id).await.unwrap();

    assert_eq!(results.successful.len(), 1);
    assert_eq!(results.successful[0].project_id, 2);
    assert_eq!(results.failed.len(), 1);
    let failure = &results.failed[0];
    assert_eq!(failure.project_id, 1);
    assert_eq!(failure.task_type, Some(TaskType::Content));
    assert_eq!(failure.error, "llm quota exceeded");
    assert!(!failure.timed_out);

    assert_eq!(h.backend.submitted_projects(TaskType::Content), vec![1, 2]);
    assert_eq!(h.backend.submitted_projects(TaskType::Tts), vec![2]);
    assert_eq!(h.backend.submitted_projects(TaskType::Video), vec![2]);

    let blocked: Vec<_> = h
        .events
        .events_for(&job.batch_id)
        .into_iter()
        .filter_map(|event| match event {
            ProgressEvent::TaskUpdated {
                project_id: 1,
                task_type,
                status: ProgressStatus::Failed,
                details,
                ..
            } => Some((task_type, details)),
            _ => None,
        })
        .collect();
    assert_eq!(blocked.len(), 3);
    assert_eq!(blocked[1].0, TaskType::Tts);
    assert_eq!(blocked[1].1["error"], json!("dependency not completed"));
    assert_eq!(blocked[2].0, TaskType::Video);
}

#[tokio::test]
async fn test_rejected_submission_fails_project() {
    let h = harness();
    h.backend.script(
        3,
        TaskType::Video,
        TaskScript {
            outcome: ScriptedOutcome::RejectSubmit("broker unavailable".into()),
            delay: Duration::ZERO,
        },
    );
    let job = h
        .service
        .create_batch(1, vec![3, 4], render_only(), None, None)
        .await
        .unwrap();
    let results = h.service.execute_batch(&job.batch_id).await.unwrap();
    assert_eq!(results.failed_project_ids(), vec![3]);
    assert!(results.failed[0].error.contains("broker unavailable"));
    assert_eq!(results.successful.len(), 1);
}

#[tokio::test]
async fn test_progress_is_monotonic() {
    let h = harness();
    h.backend.fail(2, TaskType::Tts, "voice unavailable");
    let job = h
        .service
        .create_batch(1, (1..=5).collect(), full_settings(), None, None)
        .await
        .unwrap();
    h.service.execute_batch(&job.batch_id).await.unwrap();

    let trail = h.progress_trail(&job.batch_id);
    assert!(!trail.is_empty());
    assert!(trail.windows(2).all(|w| w[0] <= w[1]));
    // Four of five projects completed.
    assert!((trail[trail.len() - 1] - 80.0).abs() < 1e-9);

    let events = h.events.events_for(&job.batch_id);
    assert!(matches!(events.first(), Some(ProgressEvent::BatchStarted { total_projects: 5, .. })));
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::BatchFinished {
            status: BatchStatus::Completed,
            successful: 4,
            failed: 1,
            skipped: 0,
            ..
        })
    ));
}

#[tokio::test]
async fn test_gpu_renders_use_gpu_queue() {
    let h = harness();
    let settings = BatchSettings {
        advanced_video: true,
        gpu_acceleration: true,
        video_quality: VideoQuality::High,
        ..render_only()
    };
    let job = h
        .service
        .create_batch(1, vec![1, 2], settings, None, None)
        .await
        .unwrap();
    let results = h.service.execute_batch(&job.batch_id).await.unwrap();
    assert_eq!(results.successful.len(), 2);

    let submissions = h.backend.submissions();
    assert_eq!(submissions.len(), 2);
    assert!(submissions
        .iter()
        .all(|s| s.task_name == TaskType::AdvancedVideo.task_name() && s.queue == QueueName::Gpu));
}

#[tokio::test]
async fn test_no_render_requested_skips_projects() {
    let h = harness();
    let settings = BatchSettings {
        generate_video: false,
        ..BatchSettings::default()
    };
    let job = h
        .service
        .create_batch(1, vec![1, 2], settings, None, None)
        .await
        .unwrap();
    let results = h.service.execute_batch(&job.batch_id).await.unwrap();
    assert_eq!(results.skipped, vec![1, 2]);
    assert!(h.backend.submissions().is_empty());
}

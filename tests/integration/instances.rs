//! Job instance integration tests.
//!
//! Instances are created through the scheduler or found in storage at start
//! and driven to a terminal state by their own actors.

use crate::common::{WAIT, start_job_scheduler, wait_for_instance_state};
use cadence::testing::{ScriptedInstanceProcessor, wait_until};
use cadence::{
    ActorContext, Event, EventBus, InMemoryJobManager, InstanceId, JobConfiguration, JobInstance,
    JobInstanceState, JobProcessors, JobScheduler, JobSchedulerConfig, NewJobInstance,
    ScheduleSpec, SpawnInstanceProcessor, TimeFrame,
};
use cadence::core::types::now_millis;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn request(configuration: JobConfiguration) -> NewJobInstance {
    NewJobInstance {
        trigger_id: None,
        configuration,
        schedule_time: now_millis(),
    }
}

/// Test: A simple instance runs exactly once and ends DONE.
#[tokio::test]
async fn test_instance_runs_once() {
    let jobs = Arc::new(InMemoryJobManager::new());
    let processor = Arc::new(ScriptedInstanceProcessor::new(vec![]));
    let processors = JobProcessors::new().with_instance_processor("report", processor.clone());
    let context = ActorContext::single_node();
    let (scheduler, recorder) = start_job_scheduler(&context, jobs.clone(), processors).await;

    let instance = scheduler
        .create_instance(request(JobConfiguration::new("report")))
        .await
        .unwrap();

    let done = wait_for_instance_state(&jobs, instance.id, JobInstanceState::Done, WAIT).await;
    assert!(done.work.last_execution_time.is_some());
    assert_eq!(processor.calls(), 1);
    assert_eq!(
        recorder.count(|e| matches!(e, Event::InstanceSucceeded { instance_id, .. } if *instance_id == instance.id)),
        1
    );
    context.stop().await;
}

/// Test: An instance whose deadline equals its creation time never reaches the processor.
#[tokio::test]
async fn test_deadline_at_creation_time() {
    let jobs = Arc::new(InMemoryJobManager::new());
    let processor = Arc::new(ScriptedInstanceProcessor::new(vec![]));
    let processors = JobProcessors::new().with_instance_processor("report", processor.clone());
    let context = ActorContext::single_node();
    let (scheduler, recorder) = start_job_scheduler(&context, jobs.clone(), processors).await;

    let now = now_millis();
    let instance = scheduler
        .create_instance(NewJobInstance {
            trigger_id: None,
            configuration: JobConfiguration::new("report").with_deadline(now),
            schedule_time: now,
        })
        .await
        .unwrap();

    wait_for_instance_state(&jobs, instance.id, JobInstanceState::DeadlineReached, WAIT).await;
    assert_eq!(processor.calls(), 0);
    assert_eq!(
        recorder.count(|e| matches!(e, Event::InstanceDeadlineReached { .. })),
        1
    );
    context.stop().await;
}

/// Test: Outside its time frames a dropable instance with no deferrals left is dropped.
#[tokio::test]
async fn test_defer_limit_drops_instance() {
    let jobs = Arc::new(InMemoryJobManager::new());
    let processor = Arc::new(ScriptedInstanceProcessor::new(vec![]));
    let processors = JobProcessors::new().with_instance_processor("report", processor.clone());
    let context = ActorContext::single_node();
    let (scheduler, recorder) = start_job_scheduler(&context, jobs.clone(), processors).await;

    let configuration = JobConfiguration::new("report")
        .with_time_frame(TimeFrame::new().with_years(Some(2099), Some(2099)))
        .with_dropable(true)
        .with_maximum_defer_count(0);
    let instance = scheduler.create_instance(request(configuration)).await.unwrap();

    let dropped =
        wait_for_instance_state(&jobs, instance.id, JobInstanceState::Dropped, WAIT).await;
    assert_eq!(dropped.work.defer_count, 1);
    assert_eq!(processor.calls(), 0);
    assert_eq!(recorder.count(|e| matches!(e, Event::InstanceDropped { .. })), 1);
    context.stop().await;
}

/// Test: A non-dropable instance outside its time frames waits for the next window.
#[tokio::test]
async fn test_instance_deferred_to_next_window() {
    let jobs = Arc::new(InMemoryJobManager::new());
    let processor = Arc::new(ScriptedInstanceProcessor::new(vec![]));
    let processors = JobProcessors::new().with_instance_processor("report", processor.clone());
    let context = ActorContext::single_node();
    let (scheduler, recorder) = start_job_scheduler(&context, jobs.clone(), processors).await;

    let configuration = JobConfiguration::new("report")
        .with_time_frame(TimeFrame::new().with_years(Some(2099), Some(2099)));
    let instance = scheduler.create_instance(request(configuration)).await.unwrap();

    assert!(
        wait_until(WAIT, || {
            recorder.count(|e| matches!(e, Event::InstanceDeferred { defer_count: 1, .. })) == 1
        })
        .await
    );
    let deferred = wait_for_instance_state(&jobs, instance.id, JobInstanceState::New, WAIT).await;
    assert_eq!(deferred.work.defer_count, 1);
    assert!(deferred.work.schedule_time > now_millis() + 365 * 24 * 3_600_000);
    assert_eq!(processor.calls(), 0);
    context.stop_timeout(Duration::from_secs(1)).await;
}

/// Test: A time frame that never opens again drops the instance outright.
#[tokio::test]
async fn test_expired_time_frame_drops_instance() {
    let jobs = Arc::new(InMemoryJobManager::new());
    let processors = JobProcessors::new()
        .with_instance_processor("report", Arc::new(ScriptedInstanceProcessor::new(vec![])));
    let context = ActorContext::single_node();
    let (scheduler, _) = start_job_scheduler(&context, jobs.clone(), processors).await;

    let configuration = JobConfiguration::new("report")
        .with_time_frame(TimeFrame::new().with_years(Some(2000), Some(2000)));
    let instance = scheduler.create_instance(request(configuration)).await.unwrap();

    let dropped =
        wait_for_instance_state(&jobs, instance.id, JobInstanceState::Dropped, WAIT).await;
    assert_eq!(dropped.work.defer_count, 0);
    context.stop().await;
}

/// Test: Chunk cursors survive between chunks and are persisted.
#[tokio::test]
async fn test_chunk_cursor_round_trip() {
    let jobs = Arc::new(InMemoryJobManager::new());
    let processor = Arc::new(ScriptedInstanceProcessor::new(vec![
        Some(json!({ "page": 1 })),
        Some(json!({ "page": 2 })),
    ]));
    let processors = JobProcessors::new().with_instance_processor("export", processor.clone());
    let context = ActorContext::single_node();
    let (scheduler, recorder) = start_job_scheduler(&context, jobs.clone(), processors).await;

    let instance = scheduler
        .create_instance(request(JobConfiguration::new("export")))
        .await
        .unwrap();

    wait_for_instance_state(&jobs, instance.id, JobInstanceState::Done, WAIT).await;
    assert_eq!(
        processor.seen_cursors(),
        vec![None, Some(json!({ "page": 1 })), Some(json!({ "page": 2 }))]
    );
    let cursors: Vec<_> = recorder
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::InstanceChunkSucceeded { cursor, .. } => Some(cursor),
            _ => None,
        })
        .collect();
    assert_eq!(
        cursors,
        vec![Some(json!({ "page": 1 })), Some(json!({ "page": 2 })), None]
    );
    context.stop().await;
}

/// Test: Admitting the same instance twice never runs it concurrently.
#[tokio::test]
async fn test_instance_runs_at_most_once_at_a_time() {
    let jobs = Arc::new(InMemoryJobManager::new());
    let processor = Arc::new(
        ScriptedInstanceProcessor::new(vec![Some(json!(1))])
            .with_delay(Duration::from_millis(100)),
    );
    let processors = JobProcessors::new().with_instance_processor("slow", processor.clone());
    let context = ActorContext::single_node();
    let (scheduler, _) = start_job_scheduler(&context, jobs.clone(), processors).await;

    let instance = scheduler
        .create_instance(request(JobConfiguration::new("slow")))
        .await
        .unwrap();
    for _ in 0..5 {
        scheduler.add_instance(&instance).await.unwrap();
    }

    wait_for_instance_state(&jobs, instance.id, JobInstanceState::Done, WAIT).await;
    assert_eq!(processor.max_in_flight(), 1);
    assert_eq!(processor.calls(), 2);
    context.stop().await;
}

/// Test: Distinct instances run side by side.
#[tokio::test]
async fn test_distinct_instances_run_concurrently() {
    let jobs = Arc::new(InMemoryJobManager::new());
    let processor = Arc::new(
        ScriptedInstanceProcessor::new(vec![]).with_delay(Duration::from_millis(200)),
    );
    let processors = JobProcessors::new().with_instance_processor("slow", processor.clone());
    let context = ActorContext::single_node();
    let (scheduler, _) = start_job_scheduler(&context, jobs.clone(), processors).await;

    let mut ids = Vec::new();
    for _ in 0..3 {
        let instance = scheduler
            .create_instance(request(JobConfiguration::new("slow")))
            .await
            .unwrap();
        ids.push(instance.id);
    }

    for id in ids {
        wait_for_instance_state(&jobs, id, JobInstanceState::Done, WAIT).await;
    }
    assert!(processor.max_in_flight() > 1);
    context.stop().await;
}

/// Test: A trigger that forbids overlap skips firings while its instance runs.
#[tokio::test]
async fn test_overlap_disallowed_skips_firings() {
    let jobs = Arc::new(InMemoryJobManager::new());
    let processor = Arc::new(
        ScriptedInstanceProcessor::new(vec![]).with_delay(Duration::from_millis(400)),
    );
    let processors = JobProcessors::new()
        .with_trigger_processor("sync", Arc::new(SpawnInstanceProcessor))
        .with_instance_processor("sync", processor.clone());
    let context = ActorContext::single_node();
    let (scheduler, recorder) = start_job_scheduler(&context, jobs.clone(), processors).await;

    scheduler
        .create_trigger(
            JobConfiguration::new("sync").with_allow_overlap(false),
            ScheduleSpec::interval(now_millis(), Duration::from_millis(50), None),
        )
        .await
        .unwrap();

    assert!(
        wait_until(WAIT, || {
            recorder.count(|e| matches!(e, Event::TriggerSkipped { .. })) >= 2
        })
        .await
    );
    assert_eq!(processor.max_in_flight(), 1);
    context.stop_timeout(Duration::from_secs(2)).await;
}

/// Test: Undone instances already in storage are picked up at start, page by page.
#[tokio::test]
async fn test_recovers_stored_instances_at_start() {
    let jobs = Arc::new(InMemoryJobManager::new());
    let now = now_millis();
    for id in 1..=7 {
        jobs.insert_instance(JobInstance::new(
            InstanceId::new(id),
            JobConfiguration::new("report"),
            now,
        ))
        .unwrap();
    }
    let mut finished = JobInstance::new(InstanceId::new(8), JobConfiguration::new("report"), now);
    finished.work.mark_failed("earlier run");
    jobs.insert_instance(finished).unwrap();

    let processor = Arc::new(ScriptedInstanceProcessor::new(vec![]));
    let context = ActorContext::single_node();
    let _scheduler = JobScheduler::builder(jobs.clone())
        .with_processors(JobProcessors::new().with_instance_processor("report", processor.clone()))
        .with_event_bus(Arc::new(EventBus::new()))
        .with_config(JobSchedulerConfig::default().with_process_count(2))
        .start(&context)
        .await
        .unwrap();

    for id in 1..=7 {
        wait_for_instance_state(&jobs, InstanceId::new(id), JobInstanceState::Done, WAIT).await;
    }
    assert_eq!(processor.calls(), 7);
    let untouched = wait_for_instance_state(
        &jobs,
        InstanceId::new(8),
        JobInstanceState::Failed,
        WAIT,
    )
    .await;
    assert_eq!(untouched.work.error.as_deref(), Some("earlier run"));
    context.stop().await;
}

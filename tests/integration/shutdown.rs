//! Graceful shutdown integration tests.
//!
//! Tests that verify stopping a scheduler or a whole actor context waits for
//! running work, within the shutdown budget.

use crate::common::{WAIT, start_job_scheduler, wait_for_instance_state};
use cadence::testing::{RecordingChannel, ScriptedInstanceProcessor, wait_until};
use cadence::{
    ActorContext, Event, InMemoryJobManager, InMemoryNotificationManager, InstanceId,
    JobConfiguration, JobInstanceState, JobManager, JobProcessors, NewJobInstance, Notification,
    NotificationChannels, NotificationId, NotificationScheduler, SchedulerError,
};
use cadence::core::types::now_millis;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn request() -> NewJobInstance {
    NewJobInstance {
        trigger_id: None,
        configuration: JobConfiguration::new("slow"),
        schedule_time: now_millis(),
    }
}

/// Test: Graceful shutdown waits for a running instance to complete.
#[tokio::test]
async fn test_graceful_stop_waits_for_instance() {
    let jobs = Arc::new(InMemoryJobManager::new());
    let processor =
        Arc::new(ScriptedInstanceProcessor::new(vec![]).with_delay(Duration::from_millis(300)));
    let processors = JobProcessors::new().with_instance_processor("slow", processor.clone());
    let context = ActorContext::single_node();
    let (scheduler, recorder) = start_job_scheduler(&context, jobs.clone(), processors).await;

    let instance = scheduler.create_instance(request()).await.unwrap();

    // Give the instance time to start but not complete
    assert!(wait_until(WAIT, || processor.calls() == 1).await);

    let shutdown_start = Instant::now();
    scheduler.stop(Some(Duration::from_secs(5))).await;
    let shutdown_duration = shutdown_start.elapsed();

    assert!(
        shutdown_duration >= Duration::from_millis(150),
        "Shutdown should have waited for the instance. Duration: {:?}",
        shutdown_duration
    );
    let stored = jobs.get_job_instance(instance.id).await.unwrap();
    assert_eq!(
        stored.state(),
        JobInstanceState::Done,
        "Instance should be marked as done"
    );
    assert_eq!(
        recorder.count(|e| matches!(e, Event::InstanceSucceeded { .. })),
        1
    );
    assert!(scheduler.actor_names().is_empty());
}

/// Test: Shutdown gives up on work running past the timeout.
#[tokio::test]
async fn test_stop_timeout_exceeded() {
    let jobs = Arc::new(InMemoryJobManager::new());
    let processor =
        Arc::new(ScriptedInstanceProcessor::new(vec![]).with_delay(Duration::from_secs(2)));
    let processors = JobProcessors::new().with_instance_processor("slow", processor.clone());
    let context = ActorContext::single_node();
    let (scheduler, _) = start_job_scheduler(&context, jobs.clone(), processors).await;

    let instance = scheduler.create_instance(request()).await.unwrap();
    assert!(wait_until(WAIT, || processor.calls() == 1).await);

    let shutdown_start = Instant::now();
    scheduler.stop(Some(Duration::from_millis(200))).await;
    let shutdown_duration = shutdown_start.elapsed();

    assert!(
        shutdown_duration < Duration::from_millis(1_000),
        "Shutdown should time out, not wait for the instance. Duration: {:?}",
        shutdown_duration
    );
    // Cut off mid-chunk: nothing was committed.
    let stored = jobs.get_job_instance(instance.id).await.unwrap();
    assert_eq!(stored.state(), JobInstanceState::New);
}

/// Test: Shutdown with nothing running completes immediately.
#[tokio::test]
async fn test_stop_with_no_running_work() {
    let jobs = Arc::new(InMemoryJobManager::new());
    let context = ActorContext::single_node();
    let (scheduler, _) = start_job_scheduler(&context, jobs, JobProcessors::new()).await;

    let shutdown_start = Instant::now();
    scheduler.stop(Some(Duration::from_secs(5))).await;
    let shutdown_duration = shutdown_start.elapsed();

    assert!(
        shutdown_duration < Duration::from_millis(100),
        "Shutdown with no running work should be fast. Duration: {:?}",
        shutdown_duration
    );
    assert!(scheduler.is_stopped());
}

/// Test: A stopped scheduler refuses new work.
#[tokio::test]
async fn test_stopped_scheduler_rejects_work() {
    let jobs = Arc::new(InMemoryJobManager::new());
    let processor = Arc::new(ScriptedInstanceProcessor::new(vec![]));
    let processors = JobProcessors::new().with_instance_processor("slow", processor.clone());
    let context = ActorContext::single_node();
    let (scheduler, _) = start_job_scheduler(&context, jobs.clone(), processors).await;
    scheduler.stop(None).await;

    let result = scheduler.create_instance(request()).await;
    assert!(matches!(result, Err(SchedulerError::Stopped)));

    // The instance was stored but never ran.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stored = jobs.get_job_instance(InstanceId::new(1)).await.unwrap();
    assert_eq!(stored.state(), JobInstanceState::New);
    assert_eq!(processor.calls(), 0);
}

/// Test: Context shutdown drains every scheduler within one overall budget.
#[tokio::test]
async fn test_context_budget_spans_schedulers() {
    let jobs = Arc::new(InMemoryJobManager::new());
    let processor =
        Arc::new(ScriptedInstanceProcessor::new(vec![]).with_delay(Duration::from_secs(2)));
    let processors = JobProcessors::new().with_instance_processor("slow", processor.clone());
    let store = Arc::new(InMemoryNotificationManager::new());
    store
        .insert(Notification::new(NotificationId::new(1), "email", "ops", now_millis()))
        .unwrap();
    let channel = Arc::new(RecordingChannel::ok().with_delay(Duration::from_secs(2)));

    let context = ActorContext::single_node();
    let (scheduler, _) = start_job_scheduler(&context, jobs.clone(), processors).await;
    let _notifications = NotificationScheduler::builder(store)
        .with_channels(NotificationChannels::new().with_channel("email", channel.clone()))
        .start(&context)
        .await
        .unwrap();
    assert_eq!(context.manager_count(), 2);

    scheduler.create_instance(request()).await.unwrap();
    assert!(wait_until(WAIT, || processor.calls() == 1 && channel.calls() == 1).await);

    let shutdown_start = Instant::now();
    context.stop_timeout(Duration::from_millis(300)).await;
    let shutdown_duration = shutdown_start.elapsed();

    // Both managers were stuck; together they still only used the one budget.
    assert!(
        shutdown_duration < Duration::from_millis(1_000),
        "Context shutdown should share one budget. Duration: {:?}",
        shutdown_duration
    );
    assert_eq!(context.manager_count(), 0);
}

/// Test: Context shutdown without a bound lets every chunk finish.
#[tokio::test]
async fn test_context_stop_completes_running_chunks() {
    let jobs = Arc::new(InMemoryJobManager::new());
    let processor =
        Arc::new(ScriptedInstanceProcessor::new(vec![]).with_delay(Duration::from_millis(200)));
    let processors = JobProcessors::new().with_instance_processor("slow", processor.clone());
    let context = ActorContext::single_node();
    let (scheduler, _) = start_job_scheduler(&context, jobs.clone(), processors).await;

    let first = scheduler.create_instance(request()).await.unwrap();
    let second = scheduler.create_instance(request()).await.unwrap();
    assert!(wait_until(WAIT, || processor.calls() == 2).await);

    context.stop().await;

    wait_for_instance_state(&jobs, first.id, JobInstanceState::Done, WAIT).await;
    wait_for_instance_state(&jobs, second.id, JobInstanceState::Done, WAIT).await;
}

//! Common test utilities shared across integration tests.

use cadence::{
    ActorContext, EventBus, InMemoryJobManager, InMemoryNotificationManager, InstanceId,
    JobInstance, JobInstanceState, JobManager, JobProcessors, JobScheduler, Notification,
    NotificationId, NotificationManager,
};
use cadence::testing::RecordingHandler;
use std::sync::Arc;
use std::time::Duration;

/// Generous bound for anything the schedulers should do "soon".
pub const WAIT: Duration = Duration::from_secs(5);

/// Start a job scheduler over `jobs` with a recording event handler attached.
pub async fn start_job_scheduler(
    context: &ActorContext,
    jobs: Arc<InMemoryJobManager>,
    processors: JobProcessors,
) -> (JobScheduler<InMemoryJobManager>, Arc<RecordingHandler>) {
    let recorder = Arc::new(RecordingHandler::new());
    let events = Arc::new(EventBus::new());
    events.register(recorder.clone()).await;
    let scheduler = JobScheduler::builder(jobs)
        .with_processors(processors)
        .with_event_bus(events)
        .start(context)
        .await
        .unwrap();
    (scheduler, recorder)
}

/// Wait for an instance to reach an expected state, polling storage.
///
/// Polls every 10ms and times out after the specified duration.
///
/// # Panics
///
/// Panics if the timeout is reached before the instance reaches the expected state.
pub async fn wait_for_instance_state(
    jobs: &InMemoryJobManager,
    id: InstanceId,
    expected: JobInstanceState,
    timeout: Duration,
) -> JobInstance {
    let start = tokio::time::Instant::now();
    loop {
        let instance = jobs.get_job_instance(id).await.unwrap();
        if instance.state() == expected {
            return instance;
        }
        if start.elapsed() > timeout {
            panic!(
                "Timeout waiting for instance {} to reach {:?}, current state: {:?}",
                id,
                expected,
                instance.state()
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait for a notification to reach an expected state, polling storage.
///
/// # Panics
///
/// Panics if the timeout is reached before the notification reaches the expected state.
pub async fn wait_for_notification_state(
    store: &InMemoryNotificationManager,
    id: NotificationId,
    expected: JobInstanceState,
    timeout: Duration,
) -> Notification {
    let start = tokio::time::Instant::now();
    loop {
        let notification = store.get_notification(id).await.unwrap();
        if notification.state() == expected {
            return notification;
        }
        if start.elapsed() > timeout {
            panic!(
                "Timeout waiting for notification {} to reach {:?}, current state: {:?}",
                id,
                expected,
                notification.state()
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until a stored notification satisfies `predicate`, polling storage.
///
/// # Panics
///
/// Panics if the timeout is reached first.
pub async fn wait_for_notification(
    store: &InMemoryNotificationManager,
    id: NotificationId,
    timeout: Duration,
    predicate: impl Fn(&Notification) -> bool,
) -> Notification {
    let start = tokio::time::Instant::now();
    loop {
        let notification = store.get_notification(id).await.unwrap();
        if predicate(&notification) {
            return notification;
        }
        if start.elapsed() > timeout {
            panic!(
                "Timeout waiting for notification {}, last seen: {:?}",
                id, notification.work
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

//! Notification dispatch integration tests.
//!
//! One suspended dispatch actor per scheduler fans each batch out to the
//! channels and parks until the earliest pending schedule.

use crate::common::{WAIT, wait_for_notification, wait_for_notification_state};
use cadence::testing::{RecordingChannel, RecordingHandler, wait_until};
use cadence::{
    ActorContext, Event, EventBus, InMemoryNotificationManager, JobConfiguration,
    JobInstanceState, Notification, NotificationChannels, NotificationId, NotificationManager,
    NotificationScheduler, NotificationSchedulerConfig, TimeFrame, TimeFrames,
};
use cadence::core::types::now_millis;
use std::sync::Arc;
use std::time::Duration;

fn ready(id: u64, channel: &str) -> Notification {
    Notification::new(NotificationId::new(id), channel, format!("user-{id}"), now_millis())
}

/// Test: A rate limit with a retry hint reschedules the notification by that hint.
#[tokio::test]
async fn test_rate_limit_honours_retry_after() {
    let store = Arc::new(InMemoryNotificationManager::new());
    store.insert(ready(1, "sms")).unwrap();
    let channel = Arc::new(RecordingChannel::rate_limited(Some(Duration::from_millis(1_000))));
    let recorder = Arc::new(RecordingHandler::new());
    let events = Arc::new(EventBus::new());
    events.register(recorder.clone()).await;

    let before = now_millis();
    let context = ActorContext::single_node();
    let scheduler = NotificationScheduler::builder(store.clone())
        .with_channels(NotificationChannels::new().with_channel("sms", channel.clone()))
        .with_event_bus(events)
        .start(&context)
        .await
        .unwrap();

    assert!(
        wait_until(WAIT, || {
            recorder.count(|e| matches!(e, Event::NotificationRateLimited { .. })) >= 1
        })
        .await
    );
    let notification = wait_for_notification(&store, NotificationId::new(1), WAIT, |n| {
        n.work.schedule_time >= before + 1_000
    })
    .await;
    assert_eq!(notification.state(), JobInstanceState::New);
    assert_eq!(notification.work.defer_count, 0);
    assert!(notification.work.schedule_time >= before + 1_000);
    assert!(notification.work.schedule_time <= now_millis() + 1_000);

    // The loop comes back for it once the hint has elapsed.
    assert!(wait_until(WAIT, || channel.calls() >= 2).await);
    scheduler.stop(None).await;
}

/// Test: A retry hint beyond the clock's range parks the notification instead of crashing the loop.
#[tokio::test]
async fn test_unbounded_retry_after_parks_notification() {
    let store = Arc::new(InMemoryNotificationManager::new());
    store.insert(ready(1, "sms")).unwrap();
    store.insert(ready(2, "email")).unwrap();
    let channels = NotificationChannels::new()
        .with_channel("sms", Arc::new(RecordingChannel::rate_limited(Some(Duration::MAX))))
        .with_channel("email", Arc::new(RecordingChannel::ok()));

    let context = ActorContext::single_node();
    let scheduler = NotificationScheduler::builder(store.clone())
        .with_channels(channels)
        .start(&context)
        .await
        .unwrap();

    let parked = wait_for_notification(&store, NotificationId::new(1), WAIT, |n| {
        n.work.schedule_time == i64::MAX
    })
    .await;
    assert_eq!(parked.state(), JobInstanceState::New);
    wait_for_notification_state(&store, NotificationId::new(2), JobInstanceState::Done, WAIT)
        .await;

    // The loop is still alive and picks up new work.
    store.insert(ready(3, "email")).unwrap();
    scheduler.notification_added(&ready(3, "email")).await;
    wait_for_notification_state(&store, NotificationId::new(3), JobInstanceState::Done, WAIT)
        .await;
    scheduler.stop(None).await;
}

/// Test: Every notification rate limited in one pass shares the same cooldown.
#[tokio::test]
async fn test_rate_limit_cooldown_shared_across_batch() {
    let store = Arc::new(InMemoryNotificationManager::new());
    for id in 1..=4 {
        store.insert(ready(id, "push")).unwrap();
    }
    let channel = Arc::new(RecordingChannel::rate_limited(None));

    let before = now_millis();
    let context = ActorContext::single_node();
    let scheduler = NotificationScheduler::builder(store.clone())
        .with_channels(NotificationChannels::new().with_channel("push", channel.clone()))
        .start(&context)
        .await
        .unwrap();

    assert!(wait_until(WAIT, || channel.calls() == 4).await);
    assert!(
        wait_until(WAIT, || {
            scheduler
                .earliest_schedule()
                .is_some_and(|at| at >= before + 10_000)
        })
        .await
    );

    let mut times = Vec::new();
    for id in 1..=4 {
        let notification = wait_for_notification(&store, NotificationId::new(id), WAIT, |n| {
            n.work.schedule_time >= before + 10_000
        })
        .await;
        assert_eq!(notification.state(), JobInstanceState::New);
        times.push(notification.work.schedule_time);
    }
    times.dedup();
    assert_eq!(times.len(), 1, "cooldowns differ: {times:?}");
    assert_eq!(scheduler.earliest_schedule(), Some(times[0]));
    scheduler.stop(None).await;
}

/// Test: Sends of one batch overlap instead of running one after another.
#[tokio::test]
async fn test_batch_sends_concurrently() {
    let store = Arc::new(InMemoryNotificationManager::new());
    for id in 1..=5 {
        store.insert(ready(id, "email")).unwrap();
    }
    let channel = Arc::new(RecordingChannel::ok().with_delay(Duration::from_millis(100)));

    let context = ActorContext::single_node();
    let scheduler = NotificationScheduler::builder(store.clone())
        .with_channels(NotificationChannels::new().with_channel("email", channel.clone()))
        .start(&context)
        .await
        .unwrap();

    assert!(
        wait_until(WAIT, || store.count_in_state(JobInstanceState::Done).unwrap() == 5).await
    );
    assert!(channel.max_in_flight() > 1);
    assert_eq!(channel.calls(), 5);
    scheduler.stop(None).await;
}

/// Test: Batches are capped and the loop keeps going until nothing is ready.
#[tokio::test]
async fn test_drains_more_than_one_batch() {
    let store = Arc::new(InMemoryNotificationManager::new());
    for id in 1..=9 {
        store.insert(ready(id, "email")).unwrap();
    }
    let channel = Arc::new(RecordingChannel::ok());

    let context = ActorContext::single_node();
    let scheduler = NotificationScheduler::builder(store.clone())
        .with_channels(NotificationChannels::new().with_channel("email", channel.clone()))
        .with_config(NotificationSchedulerConfig::default().with_process_count(2))
        .start(&context)
        .await
        .unwrap();

    assert!(
        wait_until(WAIT, || store.count_in_state(JobInstanceState::Done).unwrap() == 9).await
    );
    assert_eq!(channel.calls(), 9);
    scheduler.stop(None).await;
}

/// Test: A notification outside its publish window waits for the window.
#[tokio::test]
async fn test_publish_window_defers_notification() {
    let store = Arc::new(InMemoryNotificationManager::new());
    let frames = TimeFrames::new().with(TimeFrame::new().with_years(Some(2099), Some(2099)));
    store
        .insert(ready(1, "email").with_publish_time_frames(frames))
        .unwrap();
    let channel = Arc::new(RecordingChannel::ok());
    let recorder = Arc::new(RecordingHandler::new());
    let events = Arc::new(EventBus::new());
    events.register(recorder.clone()).await;

    let context = ActorContext::single_node();
    let scheduler = NotificationScheduler::builder(store.clone())
        .with_channels(NotificationChannels::new().with_channel("email", channel.clone()))
        .with_event_bus(events)
        .start(&context)
        .await
        .unwrap();

    assert!(
        wait_until(WAIT, || {
            recorder.count(|e| matches!(e, Event::NotificationDeferred { .. })) == 1
        })
        .await
    );
    let deferred =
        wait_for_notification(&store, NotificationId::new(1), WAIT, |n| n.work.defer_count == 1)
            .await;
    assert_eq!(deferred.state(), JobInstanceState::New);
    assert_eq!(deferred.work.defer_count, 1);
    let until = deferred.work.schedule_time;
    assert!(wait_until(WAIT, || scheduler.earliest_schedule() == Some(until)).await);
    assert_eq!(channel.calls(), 0);
    scheduler.stop(None).await;
}

/// Test: A dropable notification past its defer limit is dropped.
#[tokio::test]
async fn test_defer_limit_drops_notification() {
    let store = Arc::new(InMemoryNotificationManager::new());
    let frames = TimeFrames::new().with(TimeFrame::new().with_years(Some(2099), Some(2099)));
    store
        .insert(
            ready(1, "email")
                .with_publish_time_frames(frames)
                .with_configuration(
                    JobConfiguration::new("email")
                        .with_dropable(true)
                        .with_maximum_defer_count(0),
                ),
        )
        .unwrap();
    let channel = Arc::new(RecordingChannel::ok());

    let context = ActorContext::single_node();
    let scheduler = NotificationScheduler::builder(store.clone())
        .with_channels(NotificationChannels::new().with_channel("email", channel.clone()))
        .start(&context)
        .await
        .unwrap();

    let dropped = wait_for_notification_state(
        &store,
        NotificationId::new(1),
        JobInstanceState::Dropped,
        WAIT,
    )
    .await;
    assert_eq!(dropped.work.defer_count, 1);
    assert_eq!(channel.calls(), 0);
    scheduler.stop(None).await;
}

/// Test: A channel failure marks only that notification FAILED.
#[tokio::test]
async fn test_channel_failure_isolated_per_notification() {
    let store = Arc::new(InMemoryNotificationManager::new());
    store.insert(ready(1, "email")).unwrap();
    store.insert(ready(2, "webhook")).unwrap();
    let channels = NotificationChannels::new()
        .with_channel("email", Arc::new(RecordingChannel::ok()))
        .with_channel("webhook", Arc::new(RecordingChannel::failing("HTTP 500")));

    let context = ActorContext::single_node();
    let scheduler = NotificationScheduler::builder(store.clone())
        .with_channels(channels)
        .start(&context)
        .await
        .unwrap();

    wait_for_notification_state(&store, NotificationId::new(1), JobInstanceState::Done, WAIT)
        .await;
    let failed = wait_for_notification_state(
        &store,
        NotificationId::new(2),
        JobInstanceState::Failed,
        WAIT,
    )
    .await;
    assert_eq!(failed.work.error.as_deref(), Some("HTTP 500"));
    scheduler.stop(None).await;
}

/// Test: A loop restricted to one channel leaves the others alone.
#[tokio::test]
async fn test_channel_restricted_loop() {
    let store = Arc::new(InMemoryNotificationManager::new());
    store.insert(ready(1, "email")).unwrap();
    store.insert(ready(2, "sms")).unwrap();
    let email = Arc::new(RecordingChannel::ok());
    let sms = Arc::new(RecordingChannel::ok());

    let context = ActorContext::single_node();
    let scheduler = NotificationScheduler::builder(store.clone())
        .with_channels(
            NotificationChannels::new()
                .with_channel("email", email.clone())
                .with_channel("sms", sms.clone()),
        )
        .with_config(NotificationSchedulerConfig::default().with_channel("email"))
        .start(&context)
        .await
        .unwrap();

    wait_for_notification_state(&store, NotificationId::new(1), JobInstanceState::Done, WAIT)
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sms.calls(), 0);
    assert_eq!(
        store
            .get_notification(NotificationId::new(2))
            .await
            .unwrap()
            .state(),
        JobInstanceState::New
    );
    scheduler.stop(None).await;
}

/// Test: Concurrent scan requests leave the loop targeting the earliest one.
#[tokio::test]
async fn test_concurrent_scan_requests_keep_earliest() {
    let store = Arc::new(InMemoryNotificationManager::new());
    let context = ActorContext::single_node();
    let scheduler = NotificationScheduler::builder(store)
        .start(&context)
        .await
        .unwrap();
    assert_eq!(scheduler.earliest_schedule(), None);

    let base = now_millis() + 60_000;
    let requests: Vec<_> = (0..16)
        .map(|i| {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler.trigger_notification_scan(base + 1_000 * (16 - i)).await;
            })
        })
        .collect();
    for request in requests {
        request.await.unwrap();
    }

    assert_eq!(scheduler.earliest_schedule(), Some(base + 1_000));
    scheduler.trigger_notification_scan(base + 500_000).await;
    assert_eq!(scheduler.earliest_schedule(), Some(base + 1_000));
    scheduler.stop(None).await;
}

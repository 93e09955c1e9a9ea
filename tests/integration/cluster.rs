//! Multi-node integration tests.
//!
//! Several nodes of an in-process cluster share one store. Every node only
//! runs the work of its own partition and picks up the rest when the
//! membership changes.

use crate::common::{WAIT, start_job_scheduler, wait_for_instance_state};
use async_trait::async_trait;
use cadence::testing::{RecordingChannel, wait_until};
use cadence::{
    ActorContext, ClusterNode, ClusterStateManager, InMemoryCluster, InMemoryJobManager,
    InMemoryNotificationManager, InstanceId, JobConfiguration, JobInstance, JobInstanceProcessor,
    JobInstanceState, JobProcessingContext, JobProcessors, NewJobInstance, Notification,
    NotificationChannels, NotificationId, NotificationScheduler, ProcessingError, ScheduleSpec,
};
use cadence::core::types::now_millis;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Records the ids of the instances it processed.
#[derive(Default)]
struct IdRecorder {
    seen: Mutex<Vec<InstanceId>>,
}

impl IdRecorder {
    fn seen(&self) -> Vec<InstanceId> {
        let mut seen = self.seen.lock().unwrap().clone();
        seen.sort();
        seen
    }
}

#[async_trait]
impl JobInstanceProcessor for IdRecorder {
    async fn process(
        &self,
        ctx: &mut JobProcessingContext,
    ) -> Result<Option<Value>, ProcessingError> {
        self.seen.lock().unwrap().push(ctx.instance_id);
        Ok(None)
    }
}

fn context_for(node: &Arc<ClusterNode>) -> Arc<ActorContext> {
    ActorContext::builder()
        .with_cluster_state_manager(Arc::clone(node) as Arc<dyn ClusterStateManager>)
        .build()
        .unwrap()
}

fn ids(values: &[u64]) -> Vec<InstanceId> {
    values.iter().copied().map(InstanceId::new).collect()
}

/// Test: Positions follow join order and every change bumps the version.
#[tokio::test]
async fn test_membership_layout() {
    let cluster = InMemoryCluster::new();
    let first = cluster.join().await;
    assert_eq!(first.node_info().size, 1);
    assert!(first.node_info().is_coordinator);

    let second = cluster.join().await;
    assert_eq!(cluster.size(), 2);
    assert_eq!(cluster.version(), 2);
    assert_eq!(first.node_info().position, 0);
    assert_eq!(second.node_info().position, 1);
    assert!(!second.node_info().is_coordinator);

    cluster.leave(first.id()).await.unwrap();
    assert_eq!(cluster.version(), 3);
    assert_eq!(second.node_info().position, 0);
    assert_eq!(second.node_info().size, 1);
    assert!(second.node_info().is_coordinator);
}

/// Test: Each node processes exactly the instances of its partition.
#[tokio::test]
async fn test_instances_processed_by_owner() {
    let cluster = InMemoryCluster::new();
    let first = cluster.join().await;
    let second = cluster.join().await;
    let jobs = Arc::new(InMemoryJobManager::new());

    let first_ctx = context_for(&first);
    let second_ctx = context_for(&second);
    let first_seen = Arc::new(IdRecorder::default());
    let second_seen = Arc::new(IdRecorder::default());
    let (scheduler, _) = start_job_scheduler(
        &first_ctx,
        jobs.clone(),
        JobProcessors::new().with_instance_processor("job", first_seen.clone()),
    )
    .await;
    let _second = start_job_scheduler(
        &second_ctx,
        jobs.clone(),
        JobProcessors::new().with_instance_processor("job", second_seen.clone()),
    )
    .await;

    // Everything is created through the first node; odd ids are announced to the second.
    for _ in 0..6 {
        scheduler
            .create_instance(NewJobInstance {
                trigger_id: None,
                configuration: JobConfiguration::new("job"),
                schedule_time: now_millis(),
            })
            .await
            .unwrap();
    }
    for id in 1..=6 {
        wait_for_instance_state(&jobs, InstanceId::new(id), JobInstanceState::Done, WAIT).await;
    }

    assert_eq!(first_seen.seen(), ids(&[2, 4, 6]));
    assert_eq!(second_seen.seen(), ids(&[1, 3, 5]));
    first_ctx.stop().await;
    second_ctx.stop().await;
}

/// Test: A join moves every actor to the new version and splits the triggers.
#[tokio::test]
async fn test_join_rebalances_triggers() {
    let cluster = InMemoryCluster::new();
    let first = cluster.join().await;
    let jobs = Arc::new(InMemoryJobManager::new());
    let later = now_millis() + 3_600_000;

    let first_ctx = context_for(&first);
    let (first_scheduler, _) =
        start_job_scheduler(&first_ctx, jobs.clone(), JobProcessors::new()).await;
    for _ in 0..4 {
        first_scheduler
            .create_trigger(JobConfiguration::new("job"), ScheduleSpec::once(later))
            .await
            .unwrap();
    }
    let mut names = first_scheduler.actor_names();
    names.sort();
    assert_eq!(names, vec!["1/trigger/1", "1/trigger/2", "1/trigger/3", "1/trigger/4"]);

    let second = cluster.join().await;
    let second_ctx = context_for(&second);
    let (second_scheduler, _) =
        start_job_scheduler(&second_ctx, jobs.clone(), JobProcessors::new()).await;

    let mut names = first_scheduler.actor_names();
    names.sort();
    assert_eq!(names, vec!["2/trigger/2", "2/trigger/4"]);
    let mut names = second_scheduler.actor_names();
    names.sort();
    assert_eq!(names, vec!["2/trigger/1", "2/trigger/3"]);
    assert_eq!(first_scheduler.node_info().version, 2);

    first_ctx.stop_timeout(Duration::from_secs(1)).await;
    second_ctx.stop_timeout(Duration::from_secs(1)).await;
}

/// Test: A trigger created on one node is queued by its owner.
#[tokio::test]
async fn test_trigger_announced_to_owner() {
    let cluster = InMemoryCluster::new();
    let first = cluster.join().await;
    let second = cluster.join().await;
    let jobs = Arc::new(InMemoryJobManager::new());

    let first_ctx = context_for(&first);
    let second_ctx = context_for(&second);
    let (first_scheduler, _) =
        start_job_scheduler(&first_ctx, jobs.clone(), JobProcessors::new()).await;
    let (second_scheduler, _) =
        start_job_scheduler(&second_ctx, jobs.clone(), JobProcessors::new()).await;

    let trigger = first_scheduler
        .create_trigger(
            JobConfiguration::new("job"),
            ScheduleSpec::once(now_millis() + 3_600_000),
        )
        .await
        .unwrap();
    assert_eq!(trigger.id.value(), 1);

    assert!(first_scheduler.actor_names().is_empty());
    assert_eq!(second_scheduler.actor_names(), vec!["2/trigger/1"]);

    first_ctx.stop_timeout(Duration::from_secs(1)).await;
    second_ctx.stop_timeout(Duration::from_secs(1)).await;
}

/// Test: When a node leaves, the remaining node takes over its pending work.
#[tokio::test]
async fn test_leave_hands_over_partition() {
    let cluster = InMemoryCluster::new();
    let first = cluster.join().await;
    let second = cluster.join().await;
    let jobs = Arc::new(InMemoryJobManager::new());

    let first_ctx = context_for(&first);
    let second_ctx = context_for(&second);
    let survivor = Arc::new(IdRecorder::default());
    let (first_scheduler, _) = start_job_scheduler(
        &first_ctx,
        jobs.clone(),
        JobProcessors::new().with_instance_processor("job", survivor.clone()),
    )
    .await;
    let _second = start_job_scheduler(&second_ctx, jobs.clone(), JobProcessors::new()).await;

    // The second node goes away before it could run anything.
    second_ctx.stop().await;
    let now = now_millis();
    for id in [1, 3] {
        jobs.insert_instance(JobInstance::new(
            InstanceId::new(id),
            JobConfiguration::new("job"),
            now,
        ))
        .unwrap();
    }

    cluster.leave(second.id()).await.unwrap();
    assert_eq!(first_scheduler.node_info().size, 1);
    for id in [1, 3] {
        wait_for_instance_state(&jobs, InstanceId::new(id), JobInstanceState::Done, WAIT).await;
    }
    assert_eq!(survivor.seen(), ids(&[1, 3]));
    first_ctx.stop().await;
}

/// Test: Notifications are only dispatched by the node owning them.
#[tokio::test]
async fn test_notifications_partitioned_across_nodes() {
    let cluster = InMemoryCluster::new();
    let first = cluster.join().await;
    let second = cluster.join().await;
    let store = Arc::new(InMemoryNotificationManager::new());
    for id in 1..=4 {
        store
            .insert(Notification::new(NotificationId::new(id), "email", "ops", now_millis()))
            .unwrap();
    }

    let first_ctx = context_for(&first);
    let second_ctx = context_for(&second);
    let first_channel = Arc::new(RecordingChannel::ok());
    let second_channel = Arc::new(RecordingChannel::ok());
    let first_scheduler = NotificationScheduler::builder(store.clone())
        .with_channels(NotificationChannels::new().with_channel("email", first_channel.clone()))
        .start(&first_ctx)
        .await
        .unwrap();
    let _second_scheduler = NotificationScheduler::builder(store.clone())
        .with_channels(NotificationChannels::new().with_channel("email", second_channel.clone()))
        .start(&second_ctx)
        .await
        .unwrap();

    assert!(
        wait_until(WAIT, || store.count_in_state(JobInstanceState::Done).unwrap() == 4).await
    );
    let mut sent = first_channel.sent();
    sent.sort();
    assert_eq!(sent, vec![NotificationId::new(2), NotificationId::new(4)]);
    let mut sent = second_channel.sent();
    sent.sort();
    assert_eq!(sent, vec![NotificationId::new(1), NotificationId::new(3)]);

    // A notification added on the wrong node is announced to its owner.
    let late = Notification::new(NotificationId::new(5), "email", "ops", now_millis());
    store.insert(late.clone()).unwrap();
    first_scheduler.notification_added(&late).await;
    assert!(wait_until(WAIT, || second_channel.sent().contains(&NotificationId::new(5))).await);
    assert!(!first_channel.sent().contains(&NotificationId::new(5)));

    first_ctx.stop().await;
    second_ctx.stop().await;
}

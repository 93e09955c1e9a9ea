//! Notification scheduler: one suspended actor draining ready notifications.
//!
//! The actor sleeps until the earliest pending schedule, fetches a batch,
//! publishes every admissible notification concurrently and writes each one
//! back. When nothing is ready it suspends and asks storage for the next
//! schedule.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use super::handlers::NotificationClusterListener;
use super::types::{SchedulerError, names};
use crate::actor::{Actor, ActorContext, ActorManager, ActorRunResult};
use crate::cluster::{ClusterEvent, ClusterEventKind, ClusterNodeInfo, ClusterStateManager};
use crate::config::NotificationSchedulerConfig;
use crate::core::job::{Admission, Deferral};
use crate::core::notification::Notification;
use crate::core::processor::{NotificationChannels, NotificationError, ProcessingError};
use crate::core::types::{EpochMillis, delay_until, millis_after, now_millis, to_datetime};
use crate::events::{Event, EventBus};
use crate::storage::{
    LocalTransactionManager, NotificationManager, TransactionManager, TxOutcome,
    run_in_transaction,
};

/// Monotonic-minimum register holding the earliest known pending schedule.
///
/// Offers only ever lower the value; concurrent offers settle on the minimum.
#[derive(Debug)]
pub struct EarliestSchedule(AtomicI64);

impl EarliestSchedule {
    const UNKNOWN: i64 = i64::MAX;

    /// An empty register.
    pub fn new() -> Self {
        Self(AtomicI64::new(Self::UNKNOWN))
    }

    /// The earliest schedule offered since the last reset.
    pub fn get(&self) -> Option<EpochMillis> {
        let value = self.0.load(Ordering::Acquire);
        (value != Self::UNKNOWN).then_some(value)
    }

    /// Record `at` if it is strictly earlier than the current value.
    ///
    /// Returns whether the register changed.
    pub fn offer(&self, at: EpochMillis) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if at >= current {
                return false;
            }
            match self
                .0
                .compare_exchange_weak(current, at, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Forget the current value.
    pub fn reset(&self) {
        self.0.store(Self::UNKNOWN, Ordering::Release);
    }
}

impl Default for EarliestSchedule {
    fn default() -> Self {
        Self::new()
    }
}

/// Publishes ready notifications through their channels.
pub struct NotificationScheduler<N: NotificationManager + 'static> {
    inner: Arc<NotificationSchedulerInner<N>>,
}

impl<N: NotificationManager + 'static> Clone for NotificationScheduler<N> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub(crate) struct NotificationSchedulerInner<N: NotificationManager + 'static> {
    notifications: Arc<N>,
    channels: NotificationChannels,
    events: Arc<EventBus>,
    transactions: Arc<dyn TransactionManager>,
    actors: Arc<dyn ActorManager>,
    config: NotificationSchedulerConfig,
    cluster: Arc<dyn ClusterStateManager>,
    name: String,
    node: RwLock<Option<ClusterNodeInfo>>,
    earliest: EarliestSchedule,
    attempt: AtomicU32,
    closed: AtomicBool,
}

/// Builder for [`NotificationScheduler`].
pub struct NotificationSchedulerBuilder<N: NotificationManager + 'static> {
    notifications: Arc<N>,
    channels: NotificationChannels,
    events: Arc<EventBus>,
    transactions: Arc<dyn TransactionManager>,
    config: NotificationSchedulerConfig,
}

impl<N: NotificationManager + 'static> NotificationSchedulerBuilder<N> {
    /// Set the processors looked up by channel type.
    pub fn with_channels(mut self, channels: NotificationChannels) -> Self {
        self.channels = channels;
        self
    }

    /// Set the event bus that receives notification events.
    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    /// Set the transaction manager wrapping every batch.
    pub fn with_transaction_manager(mut self, transactions: Arc<dyn TransactionManager>) -> Self {
        self.transactions = transactions;
        self
    }

    /// Set the scheduler configuration.
    pub fn with_config(mut self, config: NotificationSchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Register the suspended dispatch actor and subscribe to the cluster.
    pub async fn start(
        self,
        context: &ActorContext,
    ) -> Result<NotificationScheduler<N>, SchedulerError> {
        let actors = context.new_actor_manager()?;
        let cluster = context.cluster_state_manager();
        let name = names::notifications(self.config.channel.as_deref());
        let inner = Arc::new(NotificationSchedulerInner {
            notifications: self.notifications,
            channels: self.channels,
            events: self.events,
            transactions: self.transactions,
            actors,
            config: self.config,
            cluster: Arc::clone(&cluster),
            name,
            node: RwLock::new(None),
            earliest: EarliestSchedule::new(),
            attempt: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        });

        inner.actors.register_suspended_actor(
            &inner.name,
            Box::new(DispatchActor {
                scheduler: Arc::downgrade(&inner),
            }),
        )?;

        let listener = Arc::new(NotificationClusterListener {
            scheduler: Arc::downgrade(&inner),
        });
        cluster.register_event_listener(ClusterEventKind::NotificationScheduled, listener.clone());
        cluster.register_listener(listener).await;

        Ok(NotificationScheduler { inner })
    }
}

impl<N: NotificationManager + 'static> NotificationScheduler<N> {
    /// Start building a scheduler over `notifications`.
    pub fn builder(notifications: Arc<N>) -> NotificationSchedulerBuilder<N> {
        NotificationSchedulerBuilder {
            notifications,
            channels: NotificationChannels::new(),
            events: Arc::new(EventBus::new()),
            transactions: Arc::new(LocalTransactionManager::new()),
            config: NotificationSchedulerConfig::default(),
        }
    }

    /// Ask for a scan no later than `at`. `0` queries storage for the next schedule.
    pub async fn trigger_notification_scan(&self, at: EpochMillis) {
        self.inner.rescan(at).await;
    }

    /// Tell the cluster that a notification was stored.
    ///
    /// Wakes this node's loop when it owns the notification, otherwise
    /// announces the schedule to the other nodes.
    pub async fn notification_added(&self, notification: &Notification) {
        if !notification.work.is_new() {
            return;
        }
        let at = notification.work.schedule_time.max(1);
        if self.inner.node().owns(notification.id.value()) {
            self.inner.rescan(at).await;
        } else {
            self.inner
                .cluster
                .fire_event_exclude_self(ClusterEvent::NotificationScheduled {
                    channel: Some(notification.channel_type.clone()),
                    schedule_time: at,
                })
                .await;
        }
    }

    /// Earliest schedule the loop is currently waiting for.
    pub fn earliest_schedule(&self) -> Option<EpochMillis> {
        self.inner.earliest.get()
    }

    /// Name of the dispatch actor.
    pub fn actor_name(&self) -> &str {
        &self.inner.name
    }

    /// Snapshot of this node as last seen by the scheduler.
    pub fn node_info(&self) -> ClusterNodeInfo {
        self.inner.node()
    }

    /// The event bus receiving notification events.
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    /// Whether [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    /// Stop the dispatch loop, waiting at most `timeout` for a running batch.
    pub async fn stop(&self, timeout: Option<Duration>) {
        self.inner.closed.store(true, Ordering::SeqCst);
        tracing::info!(actor = %self.inner.name, "Stopping notification scheduler");
        self.inner.actors.stop(timeout).await;
    }
}

impl<N: NotificationManager + 'static> NotificationSchedulerInner<N> {
    fn is_stopped(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn node(&self) -> ClusterNodeInfo {
        let node = *self.node.read().unwrap_or_else(PoisonError::into_inner);
        node.unwrap_or_else(|| self.cluster.node_info())
    }

    fn channel(&self) -> Option<&str> {
        self.config.channel.as_deref()
    }

    pub(crate) async fn on_cluster_state_changed(&self, info: ClusterNodeInfo) {
        {
            let mut node = self.node.write().unwrap_or_else(PoisonError::into_inner);
            if node.is_some_and(|current| current.version >= info.version) {
                return;
            }
            *node = Some(info);
        }
        if self.is_stopped() {
            return;
        }

        match self
            .notifications
            .next_schedule(info.partition(), self.channel())
            .await
        {
            Ok(None) => {
                self.earliest.reset();
                tracing::debug!(actor = %self.name, version = info.version, "No pending notifications in partition");
            }
            Ok(Some(at)) => {
                self.earliest.reset();
                self.rescan(at).await;
            }
            Err(e) => {
                tracing::warn!(actor = %self.name, error = %e, "Failed to query next notification schedule");
            }
        }
    }

    pub(crate) async fn on_cluster_event(&self, event: &ClusterEvent) {
        if let ClusterEvent::NotificationScheduled {
            channel,
            schedule_time,
        } = event
        {
            let ours = self.channel().is_none() || channel.as_deref() == self.channel();
            if ours {
                self.rescan((*schedule_time).max(1)).await;
            }
        }
    }

    async fn rescan(&self, at: EpochMillis) {
        if self.is_stopped() {
            return;
        }
        let at = if at == 0 {
            match self
                .notifications
                .next_schedule(self.node().partition(), self.channel())
                .await
            {
                Ok(Some(at)) => at,
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(actor = %self.name, error = %e, "Failed to query next notification schedule");
                    return;
                }
            }
        } else {
            at
        };

        if self.earliest.offer(at) {
            let delay = delay_until(at, now_millis());
            tracing::debug!(actor = %self.name, at, delay = ?delay, "Notification scan scheduled");
            self.actors.reschedule_actor(&self.name, delay);
        }
    }

    async fn run_batch(&self) -> ActorRunResult {
        if self.is_stopped() {
            return ActorRunResult::Done;
        }
        let outcome = run_in_transaction(
            self.transactions.as_ref(),
            self.config.transaction_timeout(),
            Box::pin(self.dispatch_batch()),
        )
        .await;
        let result = match outcome {
            TxOutcome::Completed(result) => result,
            TxOutcome::Failed(error) => return self.back_off(&error),
            TxOutcome::Unavailable(error) => return self.back_off(&error),
        };
        self.attempt.store(0, Ordering::Relaxed);

        if self.is_stopped() {
            return ActorRunResult::Done;
        }
        if result == ActorRunResult::Suspend {
            self.earliest.reset();
            self.rescan(0).await;
        }
        result
    }

    fn back_off(&self, error: &dyn std::error::Error) -> ActorRunResult {
        if self.is_stopped() {
            return ActorRunResult::Done;
        }
        let attempt = self.attempt.fetch_add(1, Ordering::Relaxed);
        let delay = self.config.backoff().delay(attempt);
        tracing::warn!(actor = %self.name, attempt, delay = ?delay, error = %error, "Notification batch failed, backing off");
        ActorRunResult::RescheduleIn(delay)
    }

    async fn dispatch_batch(&self) -> Result<ActorRunResult, ProcessingError> {
        let now = now_millis();
        let batch = self
            .notifications
            .notifications_to_send(
                self.node().partition(),
                self.channel(),
                now,
                self.config.process_count,
            )
            .await?;
        if batch.is_empty() {
            return Ok(ActorRunResult::Suspend);
        }

        // One cooldown for the whole pass.
        let rate_limited_until = millis_after(now, self.config.rate_limit_defer());
        let executor = self.actors.executor();
        let mut touched = Vec::with_capacity(batch.len());
        let mut sending = Vec::new();

        for mut notification in batch {
            let id = notification.id;
            let admission = notification
                .configuration
                .admission(&notification.publish_time_frames, to_datetime(now));
            match admission {
                Admission::DeadlineReached => {
                    notification.work.mark_deadline_reached();
                    tracing::info!(notification_id = %id, "Notification deadline reached");
                    self.events
                        .emit(Event::notification_deadline_reached(id))
                        .await;
                }
                Admission::Run => match self.channels.get(&notification.channel_type) {
                    Some(processor) => {
                        let outgoing = notification.clone();
                        let handle =
                            executor.spawn(async move { processor.send(&outgoing).await });
                        sending.push((notification, handle));
                        continue;
                    }
                    None => {
                        let error =
                            format!("no channel registered for '{}'", notification.channel_type);
                        tracing::warn!(notification_id = %id, error = %error, "Notification failed");
                        notification.work.mark_failed(&error);
                        self.events.emit(Event::notification_failed(id, error)).await;
                    }
                },
                Admission::Defer(until) => {
                    match notification
                        .work
                        .mark_deferred(until, &notification.configuration)
                    {
                        Deferral::Deferred(at) => {
                            tracing::debug!(notification_id = %id, until = at, "Notification deferred to next publish window");
                            self.events
                                .emit(Event::notification_deferred(id, at))
                                .await;
                        }
                        Deferral::Dropped => {
                            tracing::info!(notification_id = %id, "Notification dropped after too many deferrals");
                            self.events.emit(Event::notification_dropped(id)).await;
                        }
                    }
                }
                Admission::Drop => {
                    notification.work.mark_dropped();
                    tracing::info!(notification_id = %id, "Notification dropped, no publish window left");
                    self.events.emit(Event::notification_dropped(id)).await;
                }
            }
            touched.push(notification);
        }

        for (mut notification, handle) in sending {
            let id = notification.id;
            match handle.await {
                Ok(Ok(result)) => {
                    notification.mark_sent(result);
                    tracing::debug!(notification_id = %id, channel = %notification.channel_type, "Notification sent");
                    self.events
                        .emit(Event::notification_sent(
                            id,
                            notification.channel_type.clone(),
                        ))
                        .await;
                }
                Ok(Err(NotificationError::RateLimited { retry_after })) => {
                    let until = retry_after
                        .map_or(rate_limited_until, |after| millis_after(now, after));
                    notification.work.reschedule(until);
                    tracing::debug!(notification_id = %id, until, "Notification rate limited");
                    self.events
                        .emit(Event::notification_rate_limited(id, until))
                        .await;
                }
                Ok(Err(NotificationError::Failed(error))) => {
                    tracing::warn!(notification_id = %id, error = %error, "Notification failed");
                    notification.work.mark_failed(&error);
                    self.events.emit(Event::notification_failed(id, error)).await;
                }
                Err(e) => {
                    let error = ProcessingError::from(e).to_string();
                    tracing::warn!(notification_id = %id, error = %error, "Notification dispatch task failed");
                    notification.work.mark_failed(&error);
                    self.events.emit(Event::notification_failed(id, error)).await;
                }
            }
            touched.push(notification);
        }

        for notification in &touched {
            self.notifications.update_notification(notification).await?;
        }
        Ok(ActorRunResult::NOW)
    }
}

struct DispatchActor<N: NotificationManager + 'static> {
    scheduler: Weak<NotificationSchedulerInner<N>>,
}

#[async_trait]
impl<N: NotificationManager + 'static> Actor for DispatchActor<N> {
    async fn work(&mut self) -> ActorRunResult {
        match self.scheduler.upgrade() {
            Some(scheduler) => scheduler.run_batch().await,
            None => ActorRunResult::Done,
        }
    }
}

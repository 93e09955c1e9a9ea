//! In-memory storage implementation.
//!
//! Provides thread-safe in-memory backends for testing and development.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{JobManager, NotificationManager, StorageError};
use crate::core::job::{JobConfiguration, JobInstance, JobInstanceState, JobTrigger, NewJobInstance};
use crate::core::notification::Notification;
use crate::core::schedule::ScheduleSpec;
use crate::core::types::{EpochMillis, InstanceId, NotificationId, Partition, TriggerId};

fn lower_bound<K>(after: Option<K>) -> Bound<K> {
    match after {
        Some(id) => Bound::Excluded(id),
        None => Bound::Unbounded,
    }
}

/// In-memory job storage backend.
///
/// Thread-safe storage using RwLock for concurrent access.
/// Data is not persisted across restarts.
pub struct InMemoryJobManager {
    triggers: RwLock<BTreeMap<TriggerId, JobTrigger>>,
    instances: RwLock<BTreeMap<InstanceId, JobInstance>>,
    next_trigger_id: AtomicU64,
    next_instance_id: AtomicU64,
}

impl InMemoryJobManager {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            triggers: RwLock::new(BTreeMap::new()),
            instances: RwLock::new(BTreeMap::new()),
            next_trigger_id: AtomicU64::new(1),
            next_instance_id: AtomicU64::new(1),
        }
    }

    /// Store a trigger under its own id, replacing any previous version.
    pub fn insert_trigger(&self, trigger: JobTrigger) -> Result<(), StorageError> {
        self.next_trigger_id
            .fetch_max(trigger.id.value() + 1, Ordering::Relaxed);
        let mut triggers = self.triggers.write().map_err(|_| StorageError::LockPoisoned)?;
        triggers.insert(trigger.id, trigger);
        Ok(())
    }

    /// Store an instance under its own id, replacing any previous version.
    pub fn insert_instance(&self, instance: JobInstance) -> Result<(), StorageError> {
        self.next_instance_id
            .fetch_max(instance.id.value() + 1, Ordering::Relaxed);
        let mut instances = self
            .instances
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        instances.insert(instance.id, instance);
        Ok(())
    }

    /// All instances, ordered by id.
    pub fn instances(&self) -> Result<Vec<JobInstance>, StorageError> {
        let instances = self
            .instances
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(instances.values().cloned().collect())
    }

    fn modify_trigger(
        &self,
        id: TriggerId,
        f: impl FnOnce(&mut JobTrigger),
    ) -> Result<(), StorageError> {
        let mut triggers = self.triggers.write().map_err(|_| StorageError::LockPoisoned)?;
        let trigger = triggers
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("trigger: {}", id)))?;
        f(trigger);
        Ok(())
    }

    fn replace_instance(&self, instance: &JobInstance) -> Result<(), StorageError> {
        let mut instances = self
            .instances
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        let stored = instances
            .get_mut(&instance.id)
            .ok_or_else(|| StorageError::NotFound(format!("instance: {}", instance.id)))?;
        *stored = instance.clone();
        Ok(())
    }
}

impl Default for InMemoryJobManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobManager for InMemoryJobManager {
    async fn undone_job_triggers(
        &self,
        partition: Partition,
        after: Option<TriggerId>,
        limit: usize,
    ) -> Result<Vec<JobTrigger>, StorageError> {
        let triggers = self.triggers.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(triggers
            .range((lower_bound(after), Bound::Unbounded))
            .map(|(_, trigger)| trigger)
            .filter(|trigger| !trigger.is_done() && partition.owns(trigger.id.value()))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn undone_job_instances(
        &self,
        partition: Partition,
        after: Option<InstanceId>,
        limit: usize,
    ) -> Result<Vec<JobInstance>, StorageError> {
        let instances = self
            .instances
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(instances
            .range((lower_bound(after), Bound::Unbounded))
            .map(|(_, instance)| instance)
            .filter(|instance| instance.work.is_new() && partition.owns(instance.id.value()))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_job_trigger(&self, id: TriggerId) -> Result<JobTrigger, StorageError> {
        let triggers = self.triggers.read().map_err(|_| StorageError::LockPoisoned)?;
        triggers
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("trigger: {}", id)))
    }

    async fn get_job_instance(&self, id: InstanceId) -> Result<JobInstance, StorageError> {
        let instances = self
            .instances
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        instances
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("instance: {}", id)))
    }

    async fn create_job_trigger(
        &self,
        configuration: JobConfiguration,
        schedule: ScheduleSpec,
    ) -> Result<JobTrigger, StorageError> {
        let id = TriggerId::new(self.next_trigger_id.fetch_add(1, Ordering::Relaxed));
        let trigger = JobTrigger::new(id, configuration, schedule);
        let mut triggers = self.triggers.write().map_err(|_| StorageError::LockPoisoned)?;
        if triggers.contains_key(&id) {
            return Err(StorageError::DuplicateKey(format!("trigger: {}", id)));
        }
        triggers.insert(id, trigger.clone());
        Ok(trigger)
    }

    async fn create_job_instance(
        &self,
        request: NewJobInstance,
    ) -> Result<JobInstance, StorageError> {
        let id = InstanceId::new(self.next_instance_id.fetch_add(1, Ordering::Relaxed));
        let instance = JobInstance::from_request(id, request);
        let mut instances = self
            .instances
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        if instances.contains_key(&id) {
            return Err(StorageError::DuplicateKey(format!("instance: {}", id)));
        }
        instances.insert(id, instance.clone());
        Ok(instance)
    }

    async fn count_undone_instances(&self, trigger_id: TriggerId) -> Result<usize, StorageError> {
        let instances = self
            .instances
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(instances
            .values()
            .filter(|instance| instance.trigger_id == Some(trigger_id) && instance.work.is_new())
            .count())
    }

    async fn on_job_trigger_success(&self, trigger: &JobTrigger) -> Result<(), StorageError> {
        let last_execution_time = trigger.last_execution_time;
        let execution_count = trigger.execution_count;
        self.modify_trigger(trigger.id, |stored| {
            stored.last_execution_time = last_execution_time;
            stored.execution_count = execution_count;
            stored.last_error = None;
        })
    }

    async fn on_job_trigger_error(
        &self,
        id: TriggerId,
        execution_time: EpochMillis,
        execution_count: u32,
        error: &str,
    ) -> Result<(), StorageError> {
        self.modify_trigger(id, |stored| {
            stored.last_execution_time = Some(execution_time);
            stored.execution_count = execution_count;
            stored.last_error = Some(error.to_string());
        })
    }

    async fn on_job_trigger_ended(&self, id: TriggerId) -> Result<(), StorageError> {
        self.modify_trigger(id, |stored| stored.configuration.done = true)
    }

    async fn on_job_instance_chunk_success(
        &self,
        instance: &JobInstance,
    ) -> Result<(), StorageError> {
        self.replace_instance(instance)
    }

    async fn on_job_instance_success(&self, instance: &JobInstance) -> Result<(), StorageError> {
        self.replace_instance(instance)
    }

    async fn on_job_instance_error(&self, id: InstanceId, error: &str) -> Result<(), StorageError> {
        let mut instances = self
            .instances
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        let stored = instances
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("instance: {}", id)))?;
        stored.work.mark_failed(error);
        Ok(())
    }

    async fn update_job_instance(&self, instance: &JobInstance) -> Result<(), StorageError> {
        self.replace_instance(instance)
    }
}

/// In-memory notification storage backend.
pub struct InMemoryNotificationManager {
    notifications: RwLock<BTreeMap<NotificationId, Notification>>,
}

impl InMemoryNotificationManager {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            notifications: RwLock::new(BTreeMap::new()),
        }
    }

    /// Store a notification under its own id, replacing any previous version.
    pub fn insert(&self, notification: Notification) -> Result<(), StorageError> {
        let mut notifications = self
            .notifications
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        notifications.insert(notification.id, notification);
        Ok(())
    }

    /// Number of notifications in the given state.
    pub fn count_in_state(&self, state: JobInstanceState) -> Result<usize, StorageError> {
        let notifications = self
            .notifications
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(notifications
            .values()
            .filter(|notification| notification.state() == state)
            .count())
    }
}

impl Default for InMemoryNotificationManager {
    fn default() -> Self {
        Self::new()
    }
}

fn in_scope(notification: &Notification, partition: Partition, channel: Option<&str>) -> bool {
    notification.work.is_new()
        && partition.owns(notification.id.value())
        && channel.is_none_or(|channel| notification.channel_type == channel)
}

#[async_trait]
impl NotificationManager for InMemoryNotificationManager {
    async fn notifications_to_send(
        &self,
        partition: Partition,
        channel: Option<&str>,
        now: EpochMillis,
        limit: usize,
    ) -> Result<Vec<Notification>, StorageError> {
        let notifications = self
            .notifications
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        let mut ready: Vec<_> = notifications
            .values()
            .filter(|n| in_scope(n, partition, channel) && n.work.schedule_time <= now)
            .cloned()
            .collect();
        ready.sort_by_key(|n| (n.work.schedule_time, n.id));
        ready.truncate(limit);
        Ok(ready)
    }

    async fn next_schedule(
        &self,
        partition: Partition,
        channel: Option<&str>,
    ) -> Result<Option<EpochMillis>, StorageError> {
        let notifications = self
            .notifications
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(notifications
            .values()
            .filter(|n| in_scope(n, partition, channel))
            .map(|n| n.work.schedule_time)
            .min())
    }

    async fn get_notification(&self, id: NotificationId) -> Result<Notification, StorageError> {
        let notifications = self
            .notifications
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        notifications
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("notification: {}", id)))
    }

    async fn update_notification(&self, notification: &Notification) -> Result<(), StorageError> {
        let mut notifications = self
            .notifications
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        if !notifications.contains_key(&notification.id) {
            return Err(StorageError::NotFound(format!(
                "notification: {}",
                notification.id
            )));
        }
        notifications.insert(notification.id, notification.clone());
        Ok(())
    }
}

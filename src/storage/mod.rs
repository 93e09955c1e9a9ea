//! Storage abstraction for triggers, instances and notifications.
//!
//! The schedulers never own durability: they read due work through these
//! ports, mutate its state fields and write it back. In-memory backends are
//! provided for tests and single-process use.

mod memory;
mod transaction;

pub use memory::{InMemoryJobManager, InMemoryNotificationManager};
pub use transaction::{
    LocalTransactionManager, TransactionError, TransactionManager, TxBody, TxOutcome,
    run_in_transaction,
};

use async_trait::async_trait;
use thiserror::Error;

use crate::core::job::{JobConfiguration, JobInstance, JobTrigger, NewJobInstance};
use crate::core::notification::Notification;
use crate::core::schedule::ScheduleSpec;
use crate::core::types::{EpochMillis, InstanceId, NotificationId, Partition, TriggerId};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

/// Storage port for job triggers and job instances.
///
/// Listings are paged by id: pass the last id of the previous page as `after`.
#[async_trait]
pub trait JobManager: Send + Sync {
    /// Triggers not marked done whose id falls in `partition`, ordered by id.
    async fn undone_job_triggers(
        &self,
        partition: Partition,
        after: Option<TriggerId>,
        limit: usize,
    ) -> Result<Vec<JobTrigger>, StorageError>;

    /// Instances in state `NEW` whose id falls in `partition`, ordered by id.
    async fn undone_job_instances(
        &self,
        partition: Partition,
        after: Option<InstanceId>,
        limit: usize,
    ) -> Result<Vec<JobInstance>, StorageError>;

    /// Get a trigger by id.
    async fn get_job_trigger(&self, id: TriggerId) -> Result<JobTrigger, StorageError>;

    /// Get an instance by id.
    async fn get_job_instance(&self, id: InstanceId) -> Result<JobInstance, StorageError>;

    /// Persist a new trigger.
    async fn create_job_trigger(
        &self,
        configuration: JobConfiguration,
        schedule: ScheduleSpec,
    ) -> Result<JobTrigger, StorageError>;

    /// Persist a new instance in state `NEW`.
    async fn create_job_instance(&self, request: NewJobInstance)
    -> Result<JobInstance, StorageError>;

    /// Number of `NEW` instances created by the trigger.
    async fn count_undone_instances(&self, trigger_id: TriggerId) -> Result<usize, StorageError>;

    /// A trigger firing succeeded; persists its execution time and count.
    async fn on_job_trigger_success(&self, trigger: &JobTrigger) -> Result<(), StorageError>;

    /// A trigger firing failed; it still counts as an execution.
    async fn on_job_trigger_error(
        &self,
        id: TriggerId,
        execution_time: EpochMillis,
        execution_count: u32,
        error: &str,
    ) -> Result<(), StorageError>;

    /// The trigger will not fire again; marks it done.
    async fn on_job_trigger_ended(&self, id: TriggerId) -> Result<(), StorageError>;

    /// A chunk succeeded; persists the cursor and state.
    async fn on_job_instance_chunk_success(&self, instance: &JobInstance)
    -> Result<(), StorageError>;

    /// The instance completed.
    async fn on_job_instance_success(&self, instance: &JobInstance) -> Result<(), StorageError>;

    /// The instance failed; marks it `FAILED`.
    async fn on_job_instance_error(&self, id: InstanceId, error: &str) -> Result<(), StorageError>;

    /// Write back a deferred, dropped or expired instance.
    async fn update_job_instance(&self, instance: &JobInstance) -> Result<(), StorageError>;
}

/// Storage port for notifications.
#[async_trait]
pub trait NotificationManager: Send + Sync {
    /// Up to `limit` `NEW` notifications due at `now` in `partition`, earliest first.
    ///
    /// `channel` restricts the result to one channel type.
    async fn notifications_to_send(
        &self,
        partition: Partition,
        channel: Option<&str>,
        now: EpochMillis,
        limit: usize,
    ) -> Result<Vec<Notification>, StorageError>;

    /// Earliest schedule time of any `NEW` notification in `partition`.
    async fn next_schedule(
        &self,
        partition: Partition,
        channel: Option<&str>,
    ) -> Result<Option<EpochMillis>, StorageError>;

    /// Get a notification by id.
    async fn get_notification(&self, id: NotificationId) -> Result<Notification, StorageError>;

    /// Write back a notification after dispatch.
    async fn update_notification(&self, notification: &Notification) -> Result<(), StorageError>;
}

//! cadence - cluster-aware scheduling of job triggers, job instances and notifications.
//!
//! Work items live in storage behind the [`JobManager`] and
//! [`NotificationManager`] ports. The schedulers bind the items owned by this
//! node to named actors, run business logic through processors inside
//! transactions, and report every outcome on an [`EventBus`].

pub mod actor;
pub mod cluster;
pub mod config;
pub mod core;
pub mod events;
pub mod scheduler;
pub mod storage;
pub mod testing;

pub use actor::{
    Actor, ActorContext, ActorContextBuilder, ActorError, ActorManager, ActorManagerFactory,
    ActorRunResult, TokioActorManager,
};
pub use cluster::{
    ClusterError, ClusterEvent, ClusterEventKind, ClusterEventListener, ClusterNode,
    ClusterNodeInfo, ClusterStateListener, ClusterStateManager, InMemoryCluster,
    SingleNodeClusterStateManager,
};
pub use config::{
    ConfigError, JobSchedulerConfig, NotificationSchedulerConfig, SchedulerConfig, TriggerConfig,
    TriggerConfigBuilder, TriggerScheduleConfig, YamlLoader,
};
pub use core::context::{
    ContextError, JobProcessingContext, ScheduleContext, TriggerProcessingContext,
};
pub use core::job::{
    Admission, Deferral, JobConfiguration, JobInstance, JobInstanceState, JobTrigger,
    NewJobInstance, WorkState,
};
pub use core::notification::Notification;
pub use core::processor::{
    JobInstanceProcessor, JobProcessors, JobTriggerProcessor, NotificationChannels,
    NotificationError, NotificationProcessor, ProcessingError, SpawnInstanceProcessor,
};
pub use core::retry::BackoffPolicy;
pub use core::schedule::{JobSchedule, Schedule, ScheduleError, ScheduleSpec};
pub use core::time_frame::{TimeFrame, TimeFrames};
pub use core::types::{EpochMillis, InstanceId, NotificationId, Partition, TriggerId};
pub use events::{Event, EventBus, EventHandler};
pub use scheduler::{
    EarliestSchedule, JobScheduler, JobSchedulerBuilder, NotificationScheduler,
    NotificationSchedulerBuilder, SchedulerError,
};
pub use storage::{
    InMemoryJobManager, InMemoryNotificationManager, JobManager, LocalTransactionManager,
    NotificationManager, StorageError, TransactionError, TransactionManager, TxBody, TxOutcome,
    run_in_transaction,
};

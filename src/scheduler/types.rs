//! Scheduler type definitions.
//!
//! This module contains the error type and the actor naming scheme shared by
//! the schedulers.

use thiserror::Error;

use crate::actor::ActorError;
use crate::core::job::JobInstanceState;
use crate::core::types::{InstanceId, TriggerId};
use crate::storage::StorageError;

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The trigger is already done and cannot be scheduled.
    #[error("trigger {0} is done")]
    TriggerDone(TriggerId),

    /// Only instances in state `NEW` can be scheduled.
    #[error("instance {id} is {state:?}, expected NEW")]
    InstanceNotNew {
        id: InstanceId,
        state: JobInstanceState,
    },

    /// The scheduler has been stopped.
    #[error("scheduler is stopped")]
    Stopped,

    /// Actor layer error.
    #[error("actor error: {0}")]
    Actor(#[from] ActorError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Actor names are stamped with the cluster version they were registered under,
/// so a rebalance can find everything registered before it.
pub(crate) mod names {
    use super::{InstanceId, TriggerId};

    pub(crate) fn version_prefix(version: u64) -> String {
        format!("{}/", version)
    }

    pub(crate) fn trigger(version: u64, id: TriggerId) -> String {
        format!("{}/trigger/{}", version, id)
    }

    pub(crate) fn instance(version: u64, id: InstanceId) -> String {
        format!("{}/instance/{}", version, id)
    }

    pub(crate) fn notifications(channel: Option<&str>) -> String {
        match channel {
            Some(channel) => format!("notifications/{}", channel),
            None => "notifications".to_string(),
        }
    }
}

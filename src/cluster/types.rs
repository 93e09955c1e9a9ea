//! Cluster node snapshot, cross-node events and errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::types::{EpochMillis, InstanceId, Partition, TriggerId};

/// Snapshot of this node's place in the cluster.
///
/// Replaced as a whole on every membership change; `0 <= position < size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNodeInfo {
    /// Position of this node, also the partition it owns.
    pub position: u32,
    /// Number of nodes.
    pub size: u32,
    /// Membership version, increases on every change.
    pub version: u64,
    /// Whether this node coordinates the cluster.
    pub is_coordinator: bool,
}

impl ClusterNodeInfo {
    /// Snapshot of the only node of a single-node deployment.
    pub const SINGLE_NODE: ClusterNodeInfo = ClusterNodeInfo {
        position: 0,
        size: 1,
        version: 1,
        is_coordinator: true,
    };

    /// Create a snapshot.
    pub fn new(position: u32, size: u32, version: u64) -> Self {
        Self {
            position,
            size,
            version,
            is_coordinator: position == 0,
        }
    }

    /// Partition owned by this node.
    pub fn partition(&self) -> Partition {
        Partition::new(self.position, self.size)
    }

    /// Whether the id belongs to this node.
    pub fn owns(&self, id: u64) -> bool {
        self.partition().owns(id)
    }
}

/// Event propagated between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterEvent {
    /// A trigger was added on some node.
    TriggerAdded { trigger_id: TriggerId },
    /// An instance was added on some node.
    InstanceAdded { instance_id: InstanceId },
    /// A notification became due at `schedule_time`.
    NotificationScheduled {
        channel: Option<String>,
        schedule_time: EpochMillis,
    },
}

impl ClusterEvent {
    /// Tag of this event.
    pub fn kind(&self) -> ClusterEventKind {
        match self {
            ClusterEvent::TriggerAdded { .. } => ClusterEventKind::TriggerAdded,
            ClusterEvent::InstanceAdded { .. } => ClusterEventKind::InstanceAdded,
            ClusterEvent::NotificationScheduled { .. } => ClusterEventKind::NotificationScheduled,
        }
    }
}

/// Subscription filter for [`ClusterEvent`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterEventKind {
    /// Matches every event.
    All,
    /// Matches [`ClusterEvent::TriggerAdded`].
    TriggerAdded,
    /// Matches [`ClusterEvent::InstanceAdded`].
    InstanceAdded,
    /// Matches [`ClusterEvent::NotificationScheduled`].
    NotificationScheduled,
}

impl ClusterEventKind {
    /// Whether the filter matches the event.
    pub fn matches(self, event: &ClusterEvent) -> bool {
        self == ClusterEventKind::All || self == event.kind()
    }
}

/// Errors raised by cluster membership operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The node is not a member.
    #[error("unknown cluster node: {0}")]
    UnknownNode(Uuid),
}

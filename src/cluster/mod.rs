//! Cluster state: node position, membership changes and cross-node events.
//!
//! Work is partitioned over nodes by `id % size == position`. A
//! [`ClusterStateManager`] reports this node's [`ClusterNodeInfo`], tells
//! listeners when it changes and carries [`ClusterEvent`]s between nodes.

mod listener;
mod memory;
mod single;
mod types;

pub use listener::{ClusterEventListener, ClusterStateListener};
pub use memory::{ClusterNode, InMemoryCluster};
pub use single::SingleNodeClusterStateManager;
pub use types::{ClusterError, ClusterEvent, ClusterEventKind, ClusterNodeInfo};

use async_trait::async_trait;
use std::sync::Arc;

/// Port reporting cluster membership and carrying events between nodes.
#[async_trait]
pub trait ClusterStateManager: Send + Sync {
    /// Current snapshot of this node.
    fn node_info(&self) -> ClusterNodeInfo;

    /// Subscribe to membership changes. The current snapshot is delivered before returning.
    async fn register_listener(&self, listener: Arc<dyn ClusterStateListener>);

    /// Subscribe to events matching `kind`.
    fn register_event_listener(&self, kind: ClusterEventKind, listener: Arc<dyn ClusterEventListener>);

    /// Deliver an event to every node, this one included.
    async fn fire_event(&self, event: ClusterEvent);

    /// Deliver an event to every other node.
    async fn fire_event_exclude_self(&self, event: ClusterEvent);
}

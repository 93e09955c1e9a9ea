//! Cluster state manager for single-node deployments.

use async_trait::async_trait;
use std::sync::Arc;

use super::listener::{ClusterEventListener, ClusterStateListener, ListenerRegistry};
use super::types::{ClusterEvent, ClusterEventKind, ClusterNodeInfo};
use super::ClusterStateManager;

/// The node is alone: position 0 of 1, always coordinator, never changes.
#[derive(Default)]
pub struct SingleNodeClusterStateManager {
    listeners: ListenerRegistry,
}

impl SingleNodeClusterStateManager {
    /// Create the manager.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClusterStateManager for SingleNodeClusterStateManager {
    fn node_info(&self) -> ClusterNodeInfo {
        ClusterNodeInfo::SINGLE_NODE
    }

    async fn register_listener(&self, listener: Arc<dyn ClusterStateListener>) {
        self.listeners.add_state_listener(Arc::clone(&listener));
        listener.on_cluster_state_changed(self.node_info()).await;
    }

    fn register_event_listener(
        &self,
        kind: ClusterEventKind,
        listener: Arc<dyn ClusterEventListener>,
    ) {
        self.listeners.add_event_listener(kind, listener);
    }

    async fn fire_event(&self, event: ClusterEvent) {
        self.listeners.dispatch(&event).await;
    }

    async fn fire_event_exclude_self(&self, _event: ClusterEvent) {}
}

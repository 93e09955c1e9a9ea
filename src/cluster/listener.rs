//! Cluster listener traits and the per-node listener registry.

use async_trait::async_trait;
use std::sync::{Arc, RwLock};

use super::types::{ClusterEvent, ClusterEventKind, ClusterNodeInfo};

/// Receives the node snapshot on registration and on every membership change.
#[async_trait]
pub trait ClusterStateListener: Send + Sync {
    /// Handle a new snapshot.
    async fn on_cluster_state_changed(&self, info: ClusterNodeInfo);
}

/// Receives cross-node events.
#[async_trait]
pub trait ClusterEventListener: Send + Sync {
    /// Handle an event.
    async fn on_event(&self, event: &ClusterEvent);
}

/// Listeners registered on one node.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    state: RwLock<Vec<Arc<dyn ClusterStateListener>>>,
    events: RwLock<Vec<(ClusterEventKind, Arc<dyn ClusterEventListener>)>>,
}

impl ListenerRegistry {
    pub(crate) fn add_state_listener(&self, listener: Arc<dyn ClusterStateListener>) {
        if let Ok(mut listeners) = self.state.write() {
            listeners.push(listener);
        }
    }

    pub(crate) fn add_event_listener(
        &self,
        kind: ClusterEventKind,
        listener: Arc<dyn ClusterEventListener>,
    ) {
        if let Ok(mut listeners) = self.events.write() {
            listeners.push((kind, listener));
        }
    }

    /// Deliver a snapshot to every state listener.
    pub(crate) async fn notify_state(&self, info: ClusterNodeInfo) {
        let listeners: Vec<_> = match self.state.read() {
            Ok(listeners) => listeners.clone(),
            Err(_) => return,
        };
        for listener in listeners {
            listener.on_cluster_state_changed(info).await;
        }
    }

    /// Deliver an event to every listener whose filter matches.
    pub(crate) async fn dispatch(&self, event: &ClusterEvent) {
        let listeners: Vec<_> = match self.events.read() {
            Ok(listeners) => listeners
                .iter()
                .filter(|(kind, _)| kind.matches(event))
                .map(|(_, listener)| Arc::clone(listener))
                .collect(),
            Err(_) => return,
        };
        for listener in listeners {
            listener.on_event(event).await;
        }
    }
}

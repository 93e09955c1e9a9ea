//! In-process multi-node cluster.
//!
//! Nodes join and leave an [`InMemoryCluster`]; positions follow join order,
//! the version increases on every change and position 0 coordinates. Events
//! fired on one node reach the listeners of the others, so several schedulers
//! in one process behave like a real cluster sharing a store.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use uuid::Uuid;

use super::listener::{ClusterEventListener, ClusterStateListener, ListenerRegistry};
use super::types::{ClusterError, ClusterEvent, ClusterEventKind, ClusterNodeInfo};
use super::ClusterStateManager;

struct NodeShared {
    id: Uuid,
    info: RwLock<ClusterNodeInfo>,
    listeners: ListenerRegistry,
}

impl NodeShared {
    fn info(&self) -> ClusterNodeInfo {
        *self.info.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_info(&self, info: ClusterNodeInfo) {
        *self.info.write().unwrap_or_else(PoisonError::into_inner) = info;
    }
}

#[derive(Default)]
struct Membership {
    version: u64,
    members: Vec<Arc<NodeShared>>,
}

/// A cluster whose nodes live in this process.
#[derive(Clone, Default)]
pub struct InMemoryCluster {
    membership: Arc<Mutex<Membership>>,
}

impl InMemoryCluster {
    /// Create an empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node and notify every member of the new layout.
    pub async fn join(&self) -> Arc<ClusterNode> {
        let shared = Arc::new(NodeShared {
            id: Uuid::new_v4(),
            info: RwLock::new(ClusterNodeInfo::new(0, 1, 0)),
            listeners: ListenerRegistry::default(),
        });
        let snapshot = {
            let mut membership = self.lock();
            membership.members.push(Arc::clone(&shared));
            Self::relayout(&mut membership)
        };
        tracing::info!(node_id = %shared.id, "Node joined cluster");
        Self::announce(snapshot).await;

        Arc::new(ClusterNode {
            shared,
            membership: Arc::downgrade(&self.membership),
        })
    }

    /// Remove a node and notify the remaining members.
    pub async fn leave(&self, node_id: Uuid) -> Result<(), ClusterError> {
        let snapshot = {
            let mut membership = self.lock();
            let index = membership
                .members
                .iter()
                .position(|node| node.id == node_id)
                .ok_or(ClusterError::UnknownNode(node_id))?;
            membership.members.remove(index);
            Self::relayout(&mut membership)
        };
        tracing::info!(node_id = %node_id, "Node left cluster");
        Self::announce(snapshot).await;
        Ok(())
    }

    /// Number of members.
    pub fn size(&self) -> usize {
        self.lock().members.len()
    }

    /// Current membership version.
    pub fn version(&self) -> u64 {
        self.lock().version
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Membership> {
        self.membership.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn relayout(membership: &mut Membership) -> Vec<(Arc<NodeShared>, ClusterNodeInfo)> {
        membership.version += 1;
        let size = membership.members.len() as u32;
        let version = membership.version;
        membership
            .members
            .iter()
            .enumerate()
            .map(|(position, node)| {
                let info = ClusterNodeInfo::new(position as u32, size, version);
                node.set_info(info);
                (Arc::clone(node), info)
            })
            .collect()
    }

    async fn announce(snapshot: Vec<(Arc<NodeShared>, ClusterNodeInfo)>) {
        for (node, info) in snapshot {
            node.listeners.notify_state(info).await;
        }
    }
}

/// One member of an [`InMemoryCluster`].
pub struct ClusterNode {
    shared: Arc<NodeShared>,
    membership: Weak<Mutex<Membership>>,
}

impl ClusterNode {
    /// Identity of this node.
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    fn peers(&self, include_self: bool) -> Vec<Arc<NodeShared>> {
        let Some(membership) = self.membership.upgrade() else {
            return if include_self {
                vec![Arc::clone(&self.shared)]
            } else {
                Vec::new()
            };
        };
        let membership = membership.lock().unwrap_or_else(PoisonError::into_inner);
        membership
            .members
            .iter()
            .filter(|node| include_self || node.id != self.shared.id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ClusterStateManager for ClusterNode {
    fn node_info(&self) -> ClusterNodeInfo {
        self.shared.info()
    }

    async fn register_listener(&self, listener: Arc<dyn ClusterStateListener>) {
        self.shared.listeners.add_state_listener(Arc::clone(&listener));
        listener.on_cluster_state_changed(self.node_info()).await;
    }

    fn register_event_listener(
        &self,
        kind: ClusterEventKind,
        listener: Arc<dyn ClusterEventListener>,
    ) {
        self.shared.listeners.add_event_listener(kind, listener);
    }

    async fn fire_event(&self, event: ClusterEvent) {
        for node in self.peers(true) {
            node.listeners.dispatch(&event).await;
        }
    }

    async fn fire_event_exclude_self(&self, event: ClusterEvent) {
        for node in self.peers(false) {
            node.listeners.dispatch(&event).await;
        }
    }
}

//! Actor context: the root that owns actor managers and the cluster view.
//!
//! Schedulers ask the context for an actor manager and for the cluster state
//! manager. Stopping the context stops every manager it handed out, one after
//! the other, within a single time budget.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use super::manager::TokioActorManager;
use super::types::{ActorError, ActorManager};
use crate::cluster::{ClusterStateManager, SingleNodeClusterStateManager};

/// Factory creating actor managers on demand.
pub type ActorManagerFactory =
    Arc<dyn Fn() -> Result<Arc<dyn ActorManager>, ActorError> + Send + Sync>;

/// Owner of actor managers and the cluster state manager.
pub struct ActorContext {
    factory: ActorManagerFactory,
    managers: Mutex<Vec<Arc<dyn ActorManager>>>,
    cluster: Arc<dyn ClusterStateManager>,
}

impl ActorContext {
    /// Start building a context.
    pub fn builder() -> ActorContextBuilder {
        ActorContextBuilder::default()
    }

    /// Context for a single node using tokio actor managers.
    pub fn single_node() -> Arc<Self> {
        Arc::new(Self {
            factory: default_factory(),
            managers: Mutex::new(Vec::new()),
            cluster: Arc::new(SingleNodeClusterStateManager::new()),
        })
    }

    /// Create an actor manager owned by this context.
    pub fn new_actor_manager(&self) -> Result<Arc<dyn ActorManager>, ActorError> {
        let manager = (self.factory)()?;
        self.managers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&manager));
        Ok(manager)
    }

    /// The cluster state manager.
    pub fn cluster_state_manager(&self) -> Arc<dyn ClusterStateManager> {
        Arc::clone(&self.cluster)
    }

    /// Number of managers owned by this context.
    pub fn manager_count(&self) -> usize {
        self.managers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stop every owned manager, waiting for running actors without a bound.
    pub async fn stop(&self) {
        for manager in self.take_managers() {
            if manager.supports_graceful_stop() {
                manager.stop(None).await;
            }
        }
    }

    /// Stop every owned manager within `timeout` overall.
    ///
    /// Managers are drained one after another; each gets what is left of the
    /// budget. Managers without graceful stop support are skipped.
    pub async fn stop_timeout(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        for manager in self.take_managers() {
            if !manager.supports_graceful_stop() {
                tracing::debug!("Skipping actor manager without graceful stop");
                continue;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            manager.stop(Some(remaining)).await;
        }
    }

    fn take_managers(&self) -> Vec<Arc<dyn ActorManager>> {
        std::mem::take(&mut *self.managers.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

fn default_factory() -> ActorManagerFactory {
    Arc::new(|| Ok(Arc::new(TokioActorManager::new()?) as Arc<dyn ActorManager>))
}

/// Builder for [`ActorContext`].
///
/// At most one actor manager factory and one cluster state manager may be
/// supplied; anything missing falls back to the single-node defaults.
#[derive(Default)]
pub struct ActorContextBuilder {
    factories: Vec<ActorManagerFactory>,
    clusters: Vec<Arc<dyn ClusterStateManager>>,
    managers: Vec<Arc<dyn ActorManager>>,
}

impl ActorContextBuilder {
    /// Supply the factory for actor managers.
    pub fn with_actor_manager_factory(mut self, factory: ActorManagerFactory) -> Self {
        self.factories.push(factory);
        self
    }

    /// Supply the cluster state manager.
    pub fn with_cluster_state_manager(mut self, cluster: Arc<dyn ClusterStateManager>) -> Self {
        self.clusters.push(cluster);
        self
    }

    /// Hand an existing actor manager to the context so it is stopped with it.
    pub fn with_actor_manager(mut self, manager: Arc<dyn ActorManager>) -> Self {
        self.managers.push(manager);
        self
    }

    /// Build the context.
    pub fn build(mut self) -> Result<Arc<ActorContext>, ActorError> {
        if self.factories.len() > 1 {
            return Err(ActorError::DuplicateProvider("actor manager factory"));
        }
        if self.clusters.len() > 1 {
            return Err(ActorError::DuplicateProvider("cluster state manager"));
        }

        let factory = self.factories.pop().unwrap_or_else(default_factory);
        let cluster = self
            .clusters
            .pop()
            .unwrap_or_else(|| Arc::new(SingleNodeClusterStateManager::new()));

        Ok(Arc::new(ActorContext {
            factory,
            managers: Mutex::new(self.managers),
            cluster,
        }))
    }
}

//! Cluster listeners for the schedulers.
//!
//! The listeners hold weak references so a dropped scheduler does not keep
//! receiving cluster traffic.

use async_trait::async_trait;
use std::sync::Weak;

use super::job::JobSchedulerInner;
use super::notification::NotificationSchedulerInner;
use crate::cluster::{ClusterEvent, ClusterEventListener, ClusterNodeInfo, ClusterStateListener};
use crate::storage::{JobManager, NotificationManager};

/// Rebalances the job scheduler and queues announced work.
pub(crate) struct JobClusterListener<M: JobManager + 'static> {
    pub(crate) scheduler: Weak<JobSchedulerInner<M>>,
}

#[async_trait]
impl<M: JobManager + 'static> ClusterStateListener for JobClusterListener<M> {
    async fn on_cluster_state_changed(&self, info: ClusterNodeInfo) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.rebalance(info).await;
        }
    }
}

#[async_trait]
impl<M: JobManager + 'static> ClusterEventListener for JobClusterListener<M> {
    async fn on_event(&self, event: &ClusterEvent) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.on_cluster_event(event).await;
        }
    }
}

/// Re-targets the notification loop on membership changes and announced schedules.
pub(crate) struct NotificationClusterListener<N: NotificationManager + 'static> {
    pub(crate) scheduler: Weak<NotificationSchedulerInner<N>>,
}

#[async_trait]
impl<N: NotificationManager + 'static> ClusterStateListener for NotificationClusterListener<N> {
    async fn on_cluster_state_changed(&self, info: ClusterNodeInfo) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.on_cluster_state_changed(info).await;
        }
    }
}

#[async_trait]
impl<N: NotificationManager + 'static> ClusterEventListener for NotificationClusterListener<N> {
    async fn on_event(&self, event: &ClusterEvent) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.on_cluster_event(event).await;
        }
    }
}

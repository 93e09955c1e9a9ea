//! Lifecycle events and event handling.
//!
//! The run loops report every trigger, instance and notification outcome on an
//! [`EventBus`]. Handlers observe; they never influence the state transition
//! that produced the event.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::core::types::{EpochMillis, InstanceId, NotificationId, TriggerId};

/// Lifecycle events emitted by the schedulers.
#[derive(Debug, Clone)]
pub enum Event {
    /// A trigger firing completed.
    TriggerSucceeded {
        trigger_id: TriggerId,
        /// Number of instances the firing created.
        instances_created: usize,
        timestamp: Instant,
    },

    /// A trigger firing failed.
    TriggerFailed {
        trigger_id: TriggerId,
        error: String,
        timestamp: Instant,
    },

    /// A firing was skipped because instances of an earlier firing are unfinished.
    TriggerSkipped {
        trigger_id: TriggerId,
        timestamp: Instant,
    },

    /// A trigger will not fire again.
    TriggerEnded {
        trigger_id: TriggerId,
        timestamp: Instant,
    },

    /// A chunk of an instance was processed; more may follow.
    InstanceChunkSucceeded {
        instance_id: InstanceId,
        /// Cursor returned by the chunk.
        cursor: Option<Value>,
        timestamp: Instant,
    },

    /// An instance completed.
    InstanceSucceeded {
        instance_id: InstanceId,
        duration: Duration,
        timestamp: Instant,
    },

    /// An instance failed.
    InstanceFailed {
        instance_id: InstanceId,
        error: String,
        timestamp: Instant,
    },

    /// An instance was deferred to its next time frame.
    InstanceDeferred {
        instance_id: InstanceId,
        until: EpochMillis,
        defer_count: u32,
        timestamp: Instant,
    },

    /// An instance was dropped.
    InstanceDropped {
        instance_id: InstanceId,
        timestamp: Instant,
    },

    /// An instance missed its deadline.
    InstanceDeadlineReached {
        instance_id: InstanceId,
        timestamp: Instant,
    },

    /// A notification was published.
    NotificationSent {
        notification_id: NotificationId,
        channel_type: String,
        timestamp: Instant,
    },

    /// Publishing a notification failed.
    NotificationFailed {
        notification_id: NotificationId,
        error: String,
        timestamp: Instant,
    },

    /// The channel throttled; the notification is retried at `until`.
    NotificationRateLimited {
        notification_id: NotificationId,
        until: EpochMillis,
        timestamp: Instant,
    },

    /// A notification was deferred to its next publish window.
    NotificationDeferred {
        notification_id: NotificationId,
        until: EpochMillis,
        timestamp: Instant,
    },

    /// A notification was dropped.
    NotificationDropped {
        notification_id: NotificationId,
        timestamp: Instant,
    },

    /// A notification missed its deadline.
    NotificationDeadlineReached {
        notification_id: NotificationId,
        timestamp: Instant,
    },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> Instant {
        match self {
            Event::TriggerSucceeded { timestamp, .. }
            | Event::TriggerFailed { timestamp, .. }
            | Event::TriggerSkipped { timestamp, .. }
            | Event::TriggerEnded { timestamp, .. }
            | Event::InstanceChunkSucceeded { timestamp, .. }
            | Event::InstanceSucceeded { timestamp, .. }
            | Event::InstanceFailed { timestamp, .. }
            | Event::InstanceDeferred { timestamp, .. }
            | Event::InstanceDropped { timestamp, .. }
            | Event::InstanceDeadlineReached { timestamp, .. }
            | Event::NotificationSent { timestamp, .. }
            | Event::NotificationFailed { timestamp, .. }
            | Event::NotificationRateLimited { timestamp, .. }
            | Event::NotificationDeferred { timestamp, .. }
            | Event::NotificationDropped { timestamp, .. }
            | Event::NotificationDeadlineReached { timestamp, .. } => *timestamp,
        }
    }

    /// Create a TriggerSucceeded event.
    pub fn trigger_succeeded(trigger_id: TriggerId, instances_created: usize) -> Self {
        Event::TriggerSucceeded {
            trigger_id,
            instances_created,
            timestamp: Instant::now(),
        }
    }

    /// Create a TriggerFailed event.
    pub fn trigger_failed(trigger_id: TriggerId, error: impl Into<String>) -> Self {
        Event::TriggerFailed {
            trigger_id,
            error: error.into(),
            timestamp: Instant::now(),
        }
    }

    /// Create a TriggerSkipped event.
    pub fn trigger_skipped(trigger_id: TriggerId) -> Self {
        Event::TriggerSkipped {
            trigger_id,
            timestamp: Instant::now(),
        }
    }

    /// Create a TriggerEnded event.
    pub fn trigger_ended(trigger_id: TriggerId) -> Self {
        Event::TriggerEnded {
            trigger_id,
            timestamp: Instant::now(),
        }
    }

    /// Create an InstanceChunkSucceeded event.
    pub fn instance_chunk_succeeded(instance_id: InstanceId, cursor: Option<Value>) -> Self {
        Event::InstanceChunkSucceeded {
            instance_id,
            cursor,
            timestamp: Instant::now(),
        }
    }

    /// Create an InstanceSucceeded event.
    pub fn instance_succeeded(instance_id: InstanceId, duration: Duration) -> Self {
        Event::InstanceSucceeded {
            instance_id,
            duration,
            timestamp: Instant::now(),
        }
    }

    /// Create an InstanceFailed event.
    pub fn instance_failed(instance_id: InstanceId, error: impl Into<String>) -> Self {
        Event::InstanceFailed {
            instance_id,
            error: error.into(),
            timestamp: Instant::now(),
        }
    }

    /// Create an InstanceDeferred event.
    pub fn instance_deferred(instance_id: InstanceId, until: EpochMillis, defer_count: u32) -> Self {
        Event::InstanceDeferred {
            instance_id,
            until,
            defer_count,
            timestamp: Instant::now(),
        }
    }

    /// Create an InstanceDropped event.
    pub fn instance_dropped(instance_id: InstanceId) -> Self {
        Event::InstanceDropped {
            instance_id,
            timestamp: Instant::now(),
        }
    }

    /// Create an InstanceDeadlineReached event.
    pub fn instance_deadline_reached(instance_id: InstanceId) -> Self {
        Event::InstanceDeadlineReached {
            instance_id,
            timestamp: Instant::now(),
        }
    }

    /// Create a NotificationSent event.
    pub fn notification_sent(notification_id: NotificationId, channel_type: impl Into<String>) -> Self {
        Event::NotificationSent {
            notification_id,
            channel_type: channel_type.into(),
            timestamp: Instant::now(),
        }
    }

    /// Create a NotificationFailed event.
    pub fn notification_failed(notification_id: NotificationId, error: impl Into<String>) -> Self {
        Event::NotificationFailed {
            notification_id,
            error: error.into(),
            timestamp: Instant::now(),
        }
    }

    /// Create a NotificationRateLimited event.
    pub fn notification_rate_limited(notification_id: NotificationId, until: EpochMillis) -> Self {
        Event::NotificationRateLimited {
            notification_id,
            until,
            timestamp: Instant::now(),
        }
    }

    /// Create a NotificationDeferred event.
    pub fn notification_deferred(notification_id: NotificationId, until: EpochMillis) -> Self {
        Event::NotificationDeferred {
            notification_id,
            until,
            timestamp: Instant::now(),
        }
    }

    /// Create a NotificationDropped event.
    pub fn notification_dropped(notification_id: NotificationId) -> Self {
        Event::NotificationDropped {
            notification_id,
            timestamp: Instant::now(),
        }
    }

    /// Create a NotificationDeadlineReached event.
    pub fn notification_deadline_reached(notification_id: NotificationId) -> Self {
        Event::NotificationDeadlineReached {
            notification_id,
            timestamp: Instant::now(),
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await.clone();
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

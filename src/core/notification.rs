//! Pending notifications dispatched by the notification scheduler.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::job::{JobConfiguration, JobInstanceState, WorkState};
use super::time_frame::TimeFrames;
use super::types::{EpochMillis, NotificationId};

/// A message waiting to be published on a channel.
///
/// Shares its lifecycle with job instances; the notification scheduler drives
/// the transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// Notification identifier.
    pub id: NotificationId,
    /// Channel the notification is published on (e.g. `"email"`).
    pub channel_type: String,
    /// Channel-specific recipient address.
    pub recipient: String,
    /// Windows in which the notification may be published.
    #[serde(default)]
    pub publish_time_frames: TimeFrames,
    /// Message payload handed to the channel.
    #[serde(default)]
    pub payload: Value,
    /// Lifecycle fields.
    #[serde(flatten)]
    pub work: WorkState,
    /// Deadline and defer policy.
    pub configuration: JobConfiguration,
    /// What the channel reported after publishing.
    #[serde(default)]
    pub result: Option<Value>,
}

impl Notification {
    /// Create a notification due at `schedule_time`.
    pub fn new(
        id: NotificationId,
        channel_type: impl Into<String>,
        recipient: impl Into<String>,
        schedule_time: EpochMillis,
    ) -> Self {
        let channel_type = channel_type.into();
        Self {
            id,
            configuration: JobConfiguration::new(channel_type.clone()),
            channel_type,
            recipient: recipient.into(),
            publish_time_frames: TimeFrames::new(),
            payload: Value::Null,
            work: WorkState::new(schedule_time),
            result: None,
        }
    }

    /// Set the payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Set the publish windows.
    pub fn with_publish_time_frames(mut self, frames: TimeFrames) -> Self {
        self.publish_time_frames = frames;
        self
    }

    /// Set the deadline/defer policy.
    pub fn with_configuration(mut self, configuration: JobConfiguration) -> Self {
        self.configuration = configuration;
        self
    }

    /// Current state.
    pub fn state(&self) -> JobInstanceState {
        self.work.state
    }

    /// Whether the notification is waiting and due at `now`.
    pub fn is_ready(&self, now: EpochMillis) -> bool {
        self.work.is_new() && self.work.schedule_time <= now
    }

    /// Record a successful publish.
    pub fn mark_sent(&mut self, result: Value) {
        self.result = Some(result);
        self.work.mark_done();
    }
}

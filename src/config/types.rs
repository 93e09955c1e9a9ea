//! Configuration type definitions.
//!
//! This module contains the YAML configuration structures: scheduler tuning,
//! notification dispatch settings and optional trigger definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use crate::core::retry::BackoffPolicy;
use crate::core::time_frame::TimeFrames;

/// Top-level configuration (cadence.yaml).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Job scheduler settings.
    pub job: JobSchedulerConfig,
    /// Notification scheduler settings.
    pub notification: NotificationSchedulerConfig,
    /// Bound on graceful shutdown, in seconds.
    pub shutdown_timeout_secs: u64,
    /// Triggers installed at startup.
    pub triggers: Vec<TriggerConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            job: JobSchedulerConfig::default(),
            notification: NotificationSchedulerConfig::default(),
            shutdown_timeout_secs: 30,
            triggers: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    /// Bound on graceful shutdown.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Job scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSchedulerConfig {
    /// Page size when loading undone triggers and instances.
    pub process_count: usize,
    /// Timeout of each run-loop transaction, in seconds.
    pub transaction_timeout_secs: u64,
}

impl Default for JobSchedulerConfig {
    fn default() -> Self {
        Self {
            process_count: 100,
            transaction_timeout_secs: 60,
        }
    }
}

impl JobSchedulerConfig {
    /// Set the page size.
    pub fn with_process_count(mut self, count: usize) -> Self {
        self.process_count = count;
        self
    }

    /// Timeout of each run-loop transaction.
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout_secs)
    }
}

/// Notification scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSchedulerConfig {
    /// Notifications dispatched per batch.
    pub process_count: usize,
    /// Cooldown applied to rate-limited notifications, in seconds.
    pub rate_limit_defer_secs: u64,
    /// First backoff delay after a failed batch, in milliseconds.
    pub backoff_base_millis: u64,
    /// Largest backoff delay, in milliseconds.
    pub backoff_max_millis: u64,
    /// Timeout of each batch transaction, in seconds.
    pub transaction_timeout_secs: u64,
    /// Channel type this loop is restricted to.
    pub channel: Option<String>,
}

impl Default for NotificationSchedulerConfig {
    fn default() -> Self {
        Self {
            process_count: 10,
            rate_limit_defer_secs: 10,
            backoff_base_millis: 1_000,
            backoff_max_millis: 10_000,
            transaction_timeout_secs: 60,
            channel: None,
        }
    }
}

impl NotificationSchedulerConfig {
    /// Restrict the loop to one channel type.
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Set the batch size.
    pub fn with_process_count(mut self, count: usize) -> Self {
        self.process_count = count;
        self
    }

    /// Set the backoff policy.
    pub fn with_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.backoff_base_millis = policy.base.as_millis() as u64;
        self.backoff_max_millis = policy.max.as_millis() as u64;
        self
    }

    /// Cooldown applied to rate-limited notifications.
    pub fn rate_limit_defer(&self) -> Duration {
        Duration::from_secs(self.rate_limit_defer_secs)
    }

    /// Backoff applied after failed batches.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.backoff_base_millis),
            Duration::from_millis(self.backoff_max_millis),
        )
    }

    /// Timeout of each batch transaction.
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout_secs)
    }
}

/// Trigger definition from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Fixed trigger id; allocated by the store when absent.
    pub id: Option<u64>,
    /// Job name selecting the processor.
    pub job: String,
    /// When the trigger fires.
    pub schedule: TriggerScheduleConfig,
    /// Job parameters.
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    /// Whether firings may overlap unfinished instances.
    #[serde(default = "default_true")]
    pub allow_overlap: bool,
    /// Whether exceeding the defer limit drops instances.
    #[serde(default)]
    pub dropable: bool,
    /// Deferrals tolerated before dropping.
    #[serde(default)]
    pub maximum_defer_count: u32,
    /// Instant after which instances must not run.
    pub deadline: Option<DateTime<Utc>>,
    /// Windows in which instances may run.
    #[serde(default)]
    pub execution_time_frames: TimeFrames,
}

fn default_true() -> bool {
    true
}

/// Schedule configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TriggerScheduleConfig {
    /// Simple cron expression string.
    Simple(String),
    /// Cron expression with timezone.
    Cron {
        /// Cron expression or shortcut.
        cron: String,
        /// Timezone for the schedule.
        timezone: Option<String>,
    },
    /// A single firing.
    Once {
        /// When the trigger fires.
        once: DateTime<Utc>,
    },
    /// Fixed-rate firing.
    Every {
        /// Period, e.g. `"30s"` or `"1h30m"`.
        every: String,
        /// First firing; now when absent.
        start: Option<DateTime<Utc>>,
        /// Maximum number of firings.
        limit: Option<u32>,
    },
}

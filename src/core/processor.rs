//! Processor traits and error types.
//!
//! Processors carry the business logic the scheduler runs:
//! - [`JobTriggerProcessor`]: runs on every trigger firing, may emit instances
//! - [`JobInstanceProcessor`]: processes an instance chunk by chunk
//! - [`NotificationProcessor`]: publishes a notification on its channel
//!
//! Processors are looked up by job name ([`JobProcessors`]) or channel type
//! ([`NotificationChannels`]).

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinError;

use super::context::{ContextError, JobProcessingContext, TriggerProcessingContext};
use super::notification::Notification;
use crate::storage::StorageError;

/// Errors raised by business logic inside a run loop.
#[derive(Debug, Error)]
pub enum ProcessingError {
    /// Processing failed with a message.
    #[error("processing failed: {0}")]
    Failed(String),

    /// No processor is registered for the job.
    #[error("no processor registered for job '{0}'")]
    UnknownJob(String),

    /// Error reading the processing context.
    #[error("context error: {0}")]
    Context(#[from] ContextError),

    /// Storage port failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The processor panicked.
    #[error("processor panicked: {0}")]
    Panicked(String),

    /// Generic error wrapper.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl From<JoinError> for ProcessingError {
    fn from(error: JoinError) -> Self {
        if !error.is_panic() {
            return ProcessingError::Failed(error.to_string());
        }
        let payload = error.into_panic();
        let message = payload
            .downcast_ref::<&str>()
            .map(|message| message.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        ProcessingError::Panicked(message)
    }
}

/// Errors a notification channel can report.
#[derive(Debug, Error)]
pub enum NotificationError {
    /// The channel is throttling; try again later.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited {
        /// Channel-provided cooldown, if any.
        retry_after: Option<Duration>,
    },

    /// Publishing failed permanently.
    #[error("publish failed: {0}")]
    Failed(String),
}

/// Business logic run on each trigger firing.
#[async_trait]
pub trait JobTriggerProcessor: Send + Sync {
    /// Process one firing. Instances emitted on the context are created after success.
    async fn process(&self, ctx: &mut TriggerProcessingContext) -> Result<(), ProcessingError>;
}

/// Business logic processing a job instance.
///
/// # Example
///
/// ```ignore
/// use cadence::{JobInstanceProcessor, JobProcessingContext, ProcessingError};
/// use async_trait::async_trait;
/// use serde_json::{json, Value};
///
/// struct Paginated;
///
/// #[async_trait]
/// impl JobInstanceProcessor for Paginated {
///     async fn process(&self, ctx: &mut JobProcessingContext) -> Result<Option<Value>, ProcessingError> {
///         let page: u64 = ctx.cursor()?.unwrap_or(0);
///         // handle one page ...
///         Ok(if page < 10 { Some(json!(page + 1)) } else { None })
///     }
/// }
/// ```
#[async_trait]
pub trait JobInstanceProcessor: Send + Sync {
    /// Process one chunk.
    ///
    /// # Returns
    /// * `Ok(Some(cursor))` - more chunks remain; `cursor` is handed back as `last_processed`
    /// * `Ok(None)` - the instance is complete
    /// * `Err(ProcessingError)` - the instance failed
    async fn process(&self, ctx: &mut JobProcessingContext) -> Result<Option<Value>, ProcessingError>;
}

/// Channel-specific publisher for notifications.
#[async_trait]
pub trait NotificationProcessor: Send + Sync {
    /// Publish the notification, returning what the channel reported.
    async fn send(&self, notification: &Notification) -> Result<Value, NotificationError>;
}

/// Registry of trigger and instance processors keyed by job name.
#[derive(Clone, Default)]
pub struct JobProcessors {
    triggers: HashMap<String, Arc<dyn JobTriggerProcessor>>,
    instances: HashMap<String, Arc<dyn JobInstanceProcessor>>,
}

impl JobProcessors {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a trigger processor.
    pub fn with_trigger_processor(
        mut self,
        job: impl Into<String>,
        processor: Arc<dyn JobTriggerProcessor>,
    ) -> Self {
        self.triggers.insert(job.into(), processor);
        self
    }

    /// Register an instance processor.
    pub fn with_instance_processor(
        mut self,
        job: impl Into<String>,
        processor: Arc<dyn JobInstanceProcessor>,
    ) -> Self {
        self.instances.insert(job.into(), processor);
        self
    }

    /// Look up the trigger processor for a job.
    pub fn trigger(&self, job: &str) -> Result<Arc<dyn JobTriggerProcessor>, ProcessingError> {
        self.triggers
            .get(job)
            .cloned()
            .ok_or_else(|| ProcessingError::UnknownJob(job.to_string()))
    }

    /// Look up the instance processor for a job.
    pub fn instance(&self, job: &str) -> Result<Arc<dyn JobInstanceProcessor>, ProcessingError> {
        self.instances
            .get(job)
            .cloned()
            .ok_or_else(|| ProcessingError::UnknownJob(job.to_string()))
    }
}

/// Registry of notification processors keyed by channel type.
#[derive(Clone, Default)]
pub struct NotificationChannels {
    channels: HashMap<String, Arc<dyn NotificationProcessor>>,
}

impl NotificationChannels {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel.
    pub fn with_channel(
        mut self,
        channel_type: impl Into<String>,
        processor: Arc<dyn NotificationProcessor>,
    ) -> Self {
        self.channels.insert(channel_type.into(), processor);
        self
    }

    /// Look up the processor for a channel.
    pub fn get(&self, channel_type: &str) -> Option<Arc<dyn NotificationProcessor>> {
        self.channels.get(channel_type).cloned()
    }
}

/// Trigger processor that emits one instance per firing, inheriting the trigger configuration.
pub struct SpawnInstanceProcessor;

#[async_trait]
impl JobTriggerProcessor for SpawnInstanceProcessor {
    async fn process(&self, ctx: &mut TriggerProcessingContext) -> Result<(), ProcessingError> {
        ctx.emit_default_instance();
        Ok(())
    }
}

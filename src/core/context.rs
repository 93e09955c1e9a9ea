//! Execution contexts handed to the run loops and processors.
//!
//! - [`ScheduleContext`]: per-actor cursor of the last scheduled/actual/completed execution
//! - [`JobProcessingContext`]: what an instance processor sees for one chunk
//! - [`TriggerProcessingContext`]: what a trigger processor sees for one firing

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

use super::job::{JobConfiguration, NewJobInstance};
use super::types::{EpochMillis, InstanceId, Partition, TriggerId};

/// Errors that can occur when reading context values.
#[derive(Debug, Error)]
pub enum ContextError {
    /// Key was not found in the parameters.
    #[error("parameter not found: {0}")]
    KeyNotFound(String),

    /// Failed to deserialize a value.
    #[error("deserialization error for key '{key}': {message}")]
    DeserializationError { key: String, message: String },
}

/// Cursor over the executions of one trigger or instance.
///
/// Owned by exactly one actor; never shared. All values are epoch millis and
/// zero means "never".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleContext {
    /// When the last execution was due.
    pub last_scheduled_execution_time: EpochMillis,
    /// When the last execution actually started.
    pub last_actual_execution_time: EpochMillis,
    /// When the last execution finished.
    pub last_completion_time: EpochMillis,
    /// Executions started so far.
    #[serde(default)]
    pub execution_count: u32,
}

impl ScheduleContext {
    /// Create a context for work that has not run yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context resuming after a persisted execution time.
    pub fn resumed(last_execution_time: Option<EpochMillis>) -> Self {
        let last = last_execution_time.unwrap_or(0);
        Self {
            last_scheduled_execution_time: last,
            last_actual_execution_time: last,
            last_completion_time: last,
            execution_count: 0,
        }
    }

    /// Carry over the number of executions already made.
    pub fn with_execution_count(mut self, count: u32) -> Self {
        self.execution_count = count;
        self
    }

    /// Record the start of an execution that was due at `scheduled`.
    pub fn started(&mut self, scheduled: EpochMillis, now: EpochMillis) {
        self.last_scheduled_execution_time = scheduled;
        self.last_actual_execution_time = now;
        self.execution_count = self.execution_count.saturating_add(1);
    }

    /// Record the end of the current execution.
    pub fn completed(&mut self, now: EpochMillis) {
        self.last_completion_time = now;
    }
}

fn decode<T: DeserializeOwned>(key: &str, value: &Value) -> Result<T, ContextError> {
    serde_json::from_value(value.clone()).map_err(|e| ContextError::DeserializationError {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Context for processing one chunk of a job instance.
#[derive(Debug, Clone)]
pub struct JobProcessingContext {
    /// Instance being processed.
    pub instance_id: InstanceId,
    /// Trigger that produced the instance, if any.
    pub trigger_id: Option<TriggerId>,
    /// Cursor returned by the previous chunk, `None` on the first chunk.
    pub last_processed: Option<Value>,
    /// Number of partitions the cluster is split into.
    pub partition_count: u32,
    /// Partition of the node running this chunk.
    pub partition_id: u32,
    /// Schedule cursor of the owning actor.
    pub schedule: ScheduleContext,
    parameters: HashMap<String, Value>,
}

impl JobProcessingContext {
    /// Create a context for an instance.
    pub fn new(
        instance_id: InstanceId,
        trigger_id: Option<TriggerId>,
        parameters: HashMap<String, Value>,
        last_processed: Option<Value>,
    ) -> Self {
        Self {
            instance_id,
            trigger_id,
            last_processed,
            partition_count: 1,
            partition_id: 0,
            schedule: ScheduleContext::default(),
            parameters,
        }
    }

    /// Set partition information from the current cluster view.
    pub fn with_partition(mut self, partition: Partition) -> Self {
        self.partition_count = partition.count;
        self.partition_id = partition.id;
        self
    }

    /// Get a typed parameter.
    pub fn parameter<T: DeserializeOwned>(&self, key: &str) -> Result<T, ContextError> {
        let value = self
            .parameters
            .get(key)
            .ok_or_else(|| ContextError::KeyNotFound(key.to_string()))?;
        decode(key, value)
    }

    /// All parameters.
    pub fn parameters(&self) -> &HashMap<String, Value> {
        &self.parameters
    }

    /// Decode the cursor of the previous chunk.
    pub fn cursor<T: DeserializeOwned>(&self) -> Result<Option<T>, ContextError> {
        self.last_processed
            .as_ref()
            .map(|value| decode("last_processed", value))
            .transpose()
    }
}

/// Context for one firing of a job trigger.
#[derive(Debug, Clone)]
pub struct TriggerProcessingContext {
    /// Trigger being fired.
    pub trigger_id: TriggerId,
    /// Schedule cursor of the owning actor.
    pub schedule: ScheduleContext,
    configuration: JobConfiguration,
    emitted: Vec<NewJobInstance>,
}

impl TriggerProcessingContext {
    /// Create a context for a trigger firing.
    pub fn new(
        trigger_id: TriggerId,
        configuration: JobConfiguration,
        schedule: ScheduleContext,
    ) -> Self {
        Self {
            trigger_id,
            schedule,
            configuration,
            emitted: Vec::new(),
        }
    }

    /// Configuration of the trigger.
    pub fn configuration(&self) -> &JobConfiguration {
        &self.configuration
    }

    /// Get a typed trigger parameter.
    pub fn parameter<T: DeserializeOwned>(&self, key: &str) -> Result<T, ContextError> {
        let value = self
            .configuration
            .parameters
            .get(key)
            .ok_or_else(|| ContextError::KeyNotFound(key.to_string()))?;
        decode(key, value)
    }

    /// Request a new job instance due at the scheduled time of this firing.
    pub fn emit_instance(&mut self, configuration: JobConfiguration) {
        let schedule_time = self.schedule.last_scheduled_execution_time;
        self.emitted.push(NewJobInstance {
            trigger_id: Some(self.trigger_id),
            configuration,
            schedule_time,
        });
    }

    /// Request a new job instance that inherits the trigger configuration.
    pub fn emit_default_instance(&mut self) {
        let mut configuration = self.configuration.clone();
        configuration.done = false;
        self.emit_instance(configuration);
    }

    /// Instances requested during this firing.
    pub fn take_emitted(&mut self) -> Vec<NewJobInstance> {
        std::mem::take(&mut self.emitted)
    }
}

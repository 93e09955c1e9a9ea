//! Job triggers, job instances and their state transitions.
//!
//! A [`JobTrigger`] fires on a schedule and may produce [`JobInstance`]s. An
//! instance is processed in chunks until it reaches a terminal state. The
//! deferral/drop/deadline bookkeeping lives in [`WorkState`], which notifications
//! share with instances.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::schedule::ScheduleSpec;
use super::time_frame::{TimeFrame, TimeFrames};
use super::types::{EpochMillis, InstanceId, TriggerId};

/// Configuration shared by triggers, instances and notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfiguration {
    /// Name of the job; selects the processor.
    pub job: String,
    /// Whether the owning trigger has finished for good.
    #[serde(default)]
    pub done: bool,
    /// Whether a trigger may fire while instances of a previous firing are unfinished.
    #[serde(default = "default_true")]
    pub allow_overlap: bool,
    /// Whether exceeding the defer limit drops the work.
    #[serde(default)]
    pub dropable: bool,
    /// Number of deferrals tolerated before a dropable item is dropped.
    #[serde(default)]
    pub maximum_defer_count: u32,
    /// Instant after which the work must not run.
    #[serde(default)]
    pub deadline: Option<EpochMillis>,
    /// Windows in which the work may run (always, when empty).
    #[serde(default)]
    pub execution_time_frames: TimeFrames,
    /// Free-form job parameters.
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
}

fn default_true() -> bool {
    true
}

impl JobConfiguration {
    /// Create a configuration for the named job.
    pub fn new(job: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            done: false,
            allow_overlap: true,
            dropable: false,
            maximum_defer_count: 0,
            deadline: None,
            execution_time_frames: TimeFrames::new(),
            parameters: HashMap::new(),
        }
    }

    /// Set the deadline.
    pub fn with_deadline(mut self, deadline: EpochMillis) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Add an execution time frame.
    pub fn with_time_frame(mut self, frame: TimeFrame) -> Self {
        self.execution_time_frames.insert(frame);
        self
    }

    /// Set whether the work may be dropped.
    pub fn with_dropable(mut self, dropable: bool) -> Self {
        self.dropable = dropable;
        self
    }

    /// Set the tolerated number of deferrals.
    pub fn with_maximum_defer_count(mut self, count: u32) -> Self {
        self.maximum_defer_count = count;
        self
    }

    /// Set whether firings may overlap.
    pub fn with_allow_overlap(mut self, allow: bool) -> Self {
        self.allow_overlap = allow;
        self
    }

    /// Add a parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Whether the deadline has passed at `now`.
    pub fn deadline_passed(&self, now: EpochMillis) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Decide what to do with a unit of work at `now`, given its time frames.
    pub fn admission(&self, frames: &TimeFrames, now: DateTime<Utc>) -> Admission {
        if self.deadline_passed(now.timestamp_millis()) {
            return Admission::DeadlineReached;
        }
        if frames.contains(now) {
            return Admission::Run;
        }
        match frames.next_activation(now) {
            Some(next) => Admission::Defer(next.timestamp_millis()),
            None => Admission::Drop,
        }
    }
}

/// Outcome of the deadline/time-frame policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The deadline passed; the work must not run.
    DeadlineReached,
    /// The work may run now.
    Run,
    /// The work may run at the given time.
    Defer(EpochMillis),
    /// No time frame will ever open again.
    Drop,
}

/// State of an instance or notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobInstanceState {
    /// Waiting to run (possibly deferred).
    New,
    /// Completed successfully.
    Done,
    /// Processing failed.
    Failed,
    /// Dropped by the defer policy or because no time frame opens again.
    Dropped,
    /// The deadline passed before the work could run.
    DeadlineReached,
}

impl JobInstanceState {
    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobInstanceState::New)
    }
}

/// Result of deferring a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deferral {
    /// Rescheduled to the given time.
    Deferred(EpochMillis),
    /// The defer limit was exceeded on a dropable item.
    Dropped,
}

/// Mutable lifecycle fields shared by instances and notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkState {
    /// Current state.
    pub state: JobInstanceState,
    /// Number of times the work has been deferred.
    pub defer_count: u32,
    /// When the work is due next.
    pub schedule_time: EpochMillis,
    /// When the work last started running.
    #[serde(default)]
    pub last_execution_time: Option<EpochMillis>,
    /// Last processing error.
    #[serde(default)]
    pub error: Option<String>,
}

impl WorkState {
    /// Fresh state due at `schedule_time`.
    pub fn new(schedule_time: EpochMillis) -> Self {
        Self {
            state: JobInstanceState::New,
            defer_count: 0,
            schedule_time,
            last_execution_time: None,
            error: None,
        }
    }

    /// Whether the work is still waiting to run.
    pub fn is_new(&self) -> bool {
        self.state == JobInstanceState::New
    }

    /// Mark as successfully completed.
    pub fn mark_done(&mut self) {
        self.state = JobInstanceState::Done;
    }

    /// Mark as failed.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.state = JobInstanceState::Failed;
        self.error = Some(error.into());
    }

    /// Mark as dropped.
    pub fn mark_dropped(&mut self) {
        self.state = JobInstanceState::Dropped;
    }

    /// Mark as having missed its deadline.
    pub fn mark_deadline_reached(&mut self) {
        self.state = JobInstanceState::DeadlineReached;
    }

    /// Defer to `until`, counting the deferral.
    ///
    /// A dropable item whose defer count exceeds the configured maximum is dropped instead.
    pub fn mark_deferred(&mut self, until: EpochMillis, config: &JobConfiguration) -> Deferral {
        self.defer_count += 1;
        if config.dropable && self.defer_count > config.maximum_defer_count {
            self.mark_dropped();
            return Deferral::Dropped;
        }
        self.schedule_time = until;
        Deferral::Deferred(until)
    }

    /// Move the due time without counting a deferral.
    pub fn reschedule(&mut self, at: EpochMillis) {
        self.schedule_time = at;
    }
}

/// A recurring definition that fires on a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTrigger {
    /// Trigger identifier.
    pub id: TriggerId,
    /// Job configuration.
    pub configuration: JobConfiguration,
    /// When the trigger fires.
    pub schedule: ScheduleSpec,
    /// When the trigger last fired.
    #[serde(default)]
    pub last_execution_time: Option<EpochMillis>,
    /// Error of the last failed firing.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Firings made so far, failed and skipped ones included.
    #[serde(default)]
    pub execution_count: u32,
}

impl JobTrigger {
    /// Create a trigger.
    pub fn new(id: TriggerId, configuration: JobConfiguration, schedule: ScheduleSpec) -> Self {
        Self {
            id,
            configuration,
            schedule,
            last_execution_time: None,
            last_error: None,
            execution_count: 0,
        }
    }

    /// Whether the trigger has finished for good.
    pub fn is_done(&self) -> bool {
        self.configuration.done
    }
}

/// Request to create a job instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJobInstance {
    /// Trigger producing the instance, if any.
    pub trigger_id: Option<TriggerId>,
    /// Instance configuration.
    pub configuration: JobConfiguration,
    /// When the instance is due.
    pub schedule_time: EpochMillis,
}

/// One unit of job work, processed in chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInstance {
    /// Instance identifier.
    pub id: InstanceId,
    /// Trigger that produced the instance, if any.
    #[serde(default)]
    pub trigger_id: Option<TriggerId>,
    /// Lifecycle fields.
    #[serde(flatten)]
    pub work: WorkState,
    /// Cursor of the last processed chunk.
    #[serde(default)]
    pub last_processed: Option<Value>,
    /// Job configuration.
    pub configuration: JobConfiguration,
}

impl JobInstance {
    /// Create an instance in state `NEW`.
    pub fn new(id: InstanceId, configuration: JobConfiguration, schedule_time: EpochMillis) -> Self {
        Self {
            id,
            trigger_id: None,
            work: WorkState::new(schedule_time),
            last_processed: None,
            configuration,
        }
    }

    /// Create an instance from a creation request.
    pub fn from_request(id: InstanceId, request: NewJobInstance) -> Self {
        Self {
            trigger_id: request.trigger_id,
            ..Self::new(id, request.configuration, request.schedule_time)
        }
    }

    /// Current state.
    pub fn state(&self) -> JobInstanceState {
        self.work.state
    }
}

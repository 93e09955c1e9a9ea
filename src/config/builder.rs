//! Trigger builder from YAML configuration.
//!
//! This module converts TriggerConfig into job triggers the scheduler can run.

use chrono::{DateTime, Utc};

use super::error::ConfigError;
use super::types::{TriggerConfig, TriggerScheduleConfig};
use crate::core::job::{JobConfiguration, JobTrigger};
use crate::core::schedule::{Schedule, ScheduleSpec, parse_duration};
use crate::core::types::TriggerId;

/// Builder for creating triggers from YAML configuration.
pub struct TriggerConfigBuilder;

impl TriggerConfigBuilder {
    /// Build a trigger with the given id.
    pub fn build(
        config: &TriggerConfig,
        id: TriggerId,
        now: DateTime<Utc>,
    ) -> Result<JobTrigger, ConfigError> {
        let schedule = Self::schedule(config, now)?;
        Ok(JobTrigger::new(id, Self::configuration(config), schedule))
    }

    /// Job configuration described by the trigger.
    pub fn configuration(config: &TriggerConfig) -> JobConfiguration {
        let mut configuration = JobConfiguration::new(&config.job)
            .with_allow_overlap(config.allow_overlap)
            .with_dropable(config.dropable)
            .with_maximum_defer_count(config.maximum_defer_count);
        configuration.deadline = config.deadline.map(|deadline| deadline.timestamp_millis());
        configuration.execution_time_frames = config.execution_time_frames.clone();
        configuration.parameters = config.parameters.clone();
        configuration
    }

    /// Schedule described by the trigger. Interval schedules without a start begin at `now`.
    pub fn schedule(
        config: &TriggerConfig,
        now: DateTime<Utc>,
    ) -> Result<ScheduleSpec, ConfigError> {
        let invalid = |source| ConfigError::InvalidSchedule {
            job: config.job.clone(),
            source,
        };
        match &config.schedule {
            TriggerScheduleConfig::Simple(expression) => {
                ScheduleSpec::cron(expression.as_str()).map_err(invalid)
            }
            TriggerScheduleConfig::Cron { cron, timezone } => {
                let tz = timezone.as_deref().unwrap_or("UTC");
                Schedule::with_timezone(cron.as_str(), tz)
                    .map(ScheduleSpec::Cron)
                    .map_err(invalid)
            }
            TriggerScheduleConfig::Once { once } => Ok(ScheduleSpec::once(once.timestamp_millis())),
            TriggerScheduleConfig::Every {
                every,
                start,
                limit,
            } => {
                let every = parse_duration(every).map_err(invalid)?;
                let start = start.unwrap_or(now).timestamp_millis();
                Ok(ScheduleSpec::interval(start, every, *limit))
            }
        }
    }
}

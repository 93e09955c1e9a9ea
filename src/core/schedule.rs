//! Trigger schedules and the schedule port.
//!
//! [`JobSchedule`] is the port the run loops consume: given the cursor of the
//! previous execution it yields the next due time in epoch millis. A schedule
//! signals that it is exhausted by returning exactly
//! [`ScheduleContext::last_scheduled_execution_time`].
//!
//! [`ScheduleSpec`] is the serializable set of built-in schedules:
//! - cron expressions (5/6 fields, `@daily`-style shortcuts, `@every 5m`), timezone aware
//! - a single execution at a fixed instant
//! - a fixed-rate interval with an optional execution limit

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use super::context::ScheduleContext;
use super::types::{EpochMillis, to_datetime};

/// Errors that can occur when parsing or using schedules.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// Invalid cron expression.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// Invalid interval expression.
    #[error("invalid interval expression: {0}")]
    InvalidInterval(String),

    /// Invalid timezone.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// No more occurrences.
    #[error("no more occurrences")]
    NoMoreOccurrences,
}

/// Port computing the next due time of a trigger.
pub trait JobSchedule: Send + Sync {
    /// Next due time after the execution described by `ctx`.
    ///
    /// Returns `ctx.last_scheduled_execution_time` when no further execution exists.
    fn next_epoch_schedule(&self, ctx: &ScheduleContext) -> EpochMillis;
}

/// A cron or `@every` schedule in a given timezone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "CronRepr", into = "CronRepr")]
pub struct Schedule {
    expression: String,
    timezone: Tz,
    kind: CronKind,
}

#[derive(Debug, Clone)]
enum CronKind {
    Cron(Box<CronSchedule>),
    Every(Duration),
}

#[derive(Serialize, Deserialize)]
struct CronRepr {
    expression: String,
    #[serde(default = "default_timezone")]
    timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl TryFrom<CronRepr> for Schedule {
    type Error = ScheduleError;

    fn try_from(repr: CronRepr) -> Result<Self, Self::Error> {
        Schedule::with_timezone(repr.expression, repr.timezone)
    }
}

impl From<Schedule> for CronRepr {
    fn from(schedule: Schedule) -> Self {
        CronRepr {
            expression: schedule.expression,
            timezone: schedule.timezone.name().to_string(),
        }
    }
}

impl Schedule {
    /// Create a UTC schedule from a cron expression.
    ///
    /// Supports:
    /// - Standard 5-field cron: `minute hour day month weekday`
    /// - Extended 6-field cron: `second minute hour day month weekday`
    /// - Shortcuts: `@yearly`, `@monthly`, `@weekly`, `@daily`, `@hourly`
    /// - Intervals: `@every 5m`, `@every 1h30m`
    pub fn new(expression: impl Into<String>) -> Result<Self, ScheduleError> {
        Self::with_timezone(expression, "UTC")
    }

    /// Create a schedule evaluated in a specific timezone.
    pub fn with_timezone(
        expression: impl Into<String>,
        timezone: impl AsRef<str>,
    ) -> Result<Self, ScheduleError> {
        let expression = expression.into();
        let timezone: Tz = timezone
            .as_ref()
            .parse()
            .map_err(|_| ScheduleError::InvalidTimezone(timezone.as_ref().to_string()))?;
        let kind = Self::parse_expression(&expression)?;

        Ok(Self {
            expression,
            timezone,
            kind,
        })
    }

    fn parse_expression(expression: &str) -> Result<CronKind, ScheduleError> {
        let trimmed = expression.trim();
        if trimmed.starts_with('@') {
            return Self::parse_shortcut(trimmed);
        }
        Self::parse_cron(trimmed)
    }

    fn parse_shortcut(expression: &str) -> Result<CronKind, ScheduleError> {
        match expression.to_lowercase().as_str() {
            "@yearly" | "@annually" => Self::parse_cron("0 0 1 1 *"),
            "@monthly" => Self::parse_cron("0 0 1 * *"),
            "@weekly" => Self::parse_cron("0 0 * * SUN"),
            "@daily" | "@midnight" => Self::parse_cron("0 0 * * *"),
            "@hourly" => Self::parse_cron("0 * * * *"),
            s if s.starts_with("@every ") => parse_duration(s[7..].trim()).map(CronKind::Every),
            _ => Err(ScheduleError::InvalidCron(format!(
                "unknown shortcut: {}",
                expression
            ))),
        }
    }

    fn parse_cron(expression: &str) -> Result<CronKind, ScheduleError> {
        let fields = expression.split_whitespace().count();
        let cron_expr = match fields {
            5 => format!("0 {}", expression),
            6 => expression.to_string(),
            n => {
                return Err(ScheduleError::InvalidCron(format!(
                    "expected 5 or 6 fields, got {}",
                    n
                )));
            }
        };

        let schedule = CronSchedule::from_str(&cron_expr)
            .map_err(|e| ScheduleError::InvalidCron(e.to_string()))?;
        Ok(CronKind::Cron(Box::new(schedule)))
    }

    /// Get the next occurrence strictly after the given time.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        match &self.kind {
            CronKind::Cron(schedule) => schedule
                .after(&after.with_timezone(&self.timezone))
                .next()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or(ScheduleError::NoMoreOccurrences),
            CronKind::Every(every) => chrono::Duration::from_std(*every)
                .ok()
                .and_then(|every| after.checked_add_signed(every))
                .ok_or(ScheduleError::NoMoreOccurrences),
        }
    }

    /// Get the next N occurrences after the given time.
    pub fn next_n_after(
        &self,
        after: DateTime<Utc>,
        n: usize,
    ) -> Result<Vec<DateTime<Utc>>, ScheduleError> {
        let mut results = Vec::with_capacity(n);
        let mut current = after;
        for _ in 0..n {
            current = self.next_after(current)?;
            results.push(current);
        }
        Ok(results)
    }

    /// Get the original expression string.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Get the timezone name.
    pub fn timezone(&self) -> &str {
        self.timezone.name()
    }
}

impl JobSchedule for Schedule {
    fn next_epoch_schedule(&self, ctx: &ScheduleContext) -> EpochMillis {
        // Anchor on whatever happened last so a late completion never causes a burst.
        let reference = ctx
            .last_scheduled_execution_time
            .max(ctx.last_completion_time)
            .max(ctx.last_actual_execution_time);
        let reference = if reference == 0 {
            Utc::now()
        } else {
            to_datetime(reference)
        };
        match self.next_after(reference) {
            Ok(next) => next.timestamp_millis(),
            Err(_) => ctx.last_scheduled_execution_time,
        }
    }
}

/// Built-in schedules attached to job triggers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// Cron or `@every` expression.
    Cron(Schedule),
    /// Exactly one execution at the given instant.
    Once {
        /// Due time in epoch millis.
        at: EpochMillis,
    },
    /// Fixed-rate execution starting at `start`.
    Interval {
        /// First due time in epoch millis.
        start: EpochMillis,
        /// Period in milliseconds.
        every_millis: u64,
        /// Maximum number of firings (unbounded when absent). Counted from
        /// [`ScheduleContext::execution_count`], so missed slots do not use it up.
        #[serde(default)]
        limit: Option<u32>,
    },
}

impl ScheduleSpec {
    /// Parse a cron/`@every` expression in UTC.
    pub fn cron(expression: impl Into<String>) -> Result<Self, ScheduleError> {
        Schedule::new(expression).map(ScheduleSpec::Cron)
    }

    /// A schedule firing once.
    pub fn once(at: EpochMillis) -> Self {
        ScheduleSpec::Once { at }
    }

    /// A fixed-rate schedule.
    pub fn interval(start: EpochMillis, every: Duration, limit: Option<u32>) -> Self {
        ScheduleSpec::Interval {
            start,
            every_millis: every.as_millis().max(1) as u64,
            limit,
        }
    }
}

impl JobSchedule for ScheduleSpec {
    fn next_epoch_schedule(&self, ctx: &ScheduleContext) -> EpochMillis {
        match self {
            ScheduleSpec::Cron(schedule) => schedule.next_epoch_schedule(ctx),
            ScheduleSpec::Once { at } => {
                if ctx.last_actual_execution_time > 0 {
                    ctx.last_scheduled_execution_time
                } else {
                    *at
                }
            }
            ScheduleSpec::Interval {
                start,
                every_millis,
                limit,
            } => {
                if limit.is_some_and(|limit| ctx.execution_count >= limit) {
                    return ctx.last_scheduled_execution_time;
                }
                if ctx.last_actual_execution_time == 0 {
                    return *start;
                }
                let every = (*every_millis).max(1) as i64;
                let reference = ctx
                    .last_scheduled_execution_time
                    .max(ctx.last_completion_time);
                let index = if reference < *start {
                    0
                } else {
                    (reference - start) / every + 1
                };
                start + index * every
            }
        }
    }
}

/// Parse a duration string like "5m", "1h", "1h30m", "30s".
pub fn parse_duration(s: &str) -> Result<Duration, ScheduleError> {
    let mut total_secs: u64 = 0;
    let mut current_num = String::new();

    for c in s.chars() {
        if c.is_ascii_digit() {
            current_num.push(c);
            continue;
        }
        let num: u64 = current_num
            .parse()
            .map_err(|_| ScheduleError::InvalidInterval(s.to_string()))?;
        current_num.clear();

        total_secs += match c {
            's' => num,
            'm' => num * 60,
            'h' => num * 3600,
            'd' => num * 86400,
            _ => return Err(ScheduleError::InvalidInterval(s.to_string())),
        };
    }

    if total_secs == 0 || !current_num.is_empty() {
        return Err(ScheduleError::InvalidInterval(s.to_string()));
    }

    Ok(Duration::from_secs(total_secs))
}

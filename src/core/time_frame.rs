//! Calendar windows gating when work may execute.
//!
//! A [`TimeFrame`] is a set of optional bounds (year range, month range, weekday,
//! time-of-day range). A point in time is contained when it satisfies every bound
//! that is set. Month and time-of-day ranges wrap when the start is after the end,
//! so `Nov..Feb` and `22:00..06:00` work as expected. All evaluation happens in UTC.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Upper bound on calendar steps when searching for the next activation.
const MAX_SEARCH_STEPS: usize = 4096;

/// A recurring calendar/time-of-day window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeFrame {
    /// First year (inclusive).
    pub start_year: Option<i32>,
    /// Last year (inclusive).
    pub end_year: Option<i32>,
    /// First month, 1-12 (inclusive).
    pub start_month: Option<u32>,
    /// Last month, 1-12 (inclusive).
    pub end_month: Option<u32>,
    /// Day of the week.
    pub week_day: Option<Weekday>,
    /// Start of the daily window (inclusive).
    pub start_time: Option<NaiveTime>,
    /// End of the daily window (exclusive).
    pub end_time: Option<NaiveTime>,
}

impl TimeFrame {
    /// Create an unbounded time frame, which contains every instant.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to a year range.
    pub fn with_years(mut self, start: Option<i32>, end: Option<i32>) -> Self {
        self.start_year = start;
        self.end_year = end;
        self
    }

    /// Restrict to a month range.
    pub fn with_months(mut self, start: Option<u32>, end: Option<u32>) -> Self {
        self.start_month = start;
        self.end_month = end;
        self
    }

    /// Restrict to a single weekday.
    pub fn with_week_day(mut self, day: Weekday) -> Self {
        self.week_day = Some(day);
        self
    }

    /// Restrict to a daily time window.
    pub fn with_times(mut self, start: Option<NaiveTime>, end: Option<NaiveTime>) -> Self {
        self.start_time = start;
        self.end_time = end;
        self
    }

    /// Check whether the instant satisfies every bound that is set.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.year_matches(at.year())
            && self.month_matches(at.month())
            && self.week_day.is_none_or(|day| at.weekday() == day)
            && self.first_time_at_or_after(at.time()) == Some(at.time())
    }

    /// Earliest instant at or after `after` that the frame contains.
    ///
    /// Returns `None` when the frame can never become active again.
    pub fn next_activation(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.contains(after) {
            return Some(after);
        }
        if self.time_window_is_empty() || !self.months_are_valid() {
            return None;
        }

        let mut day = after.date_naive();
        let mut earliest = after.time();

        for _ in 0..MAX_SEARCH_STEPS {
            let year = day.year();
            if self.end_year.is_some_and(|end| year > end) {
                return None;
            }
            if let Some(start) = self.start_year.filter(|start| year < *start) {
                day = NaiveDate::from_ymd_opt(start, 1, 1)?;
                earliest = NaiveTime::MIN;
                continue;
            }
            if !self.month_matches(day.month()) {
                day = first_of_next_month(day)?;
                earliest = NaiveTime::MIN;
                continue;
            }
            if self.week_day.is_none_or(|wd| day.weekday() == wd) {
                if let Some(time) = self.first_time_at_or_after(earliest) {
                    return Some(day.and_time(time).and_utc());
                }
            }
            day = day.succ_opt()?;
            earliest = NaiveTime::MIN;
        }

        None
    }

    fn year_matches(&self, year: i32) -> bool {
        self.start_year.is_none_or(|start| year >= start)
            && self.end_year.is_none_or(|end| year <= end)
    }

    fn month_matches(&self, month: u32) -> bool {
        match (self.start_month, self.end_month) {
            (Some(start), Some(end)) if start <= end => (start..=end).contains(&month),
            (Some(start), Some(end)) => month >= start || month <= end,
            (Some(start), None) => month >= start,
            (None, Some(end)) => month <= end,
            (None, None) => true,
        }
    }

    fn months_are_valid(&self) -> bool {
        let valid = |m: Option<u32>| m.is_none_or(|m| (1..=12).contains(&m));
        valid(self.start_month) && valid(self.end_month)
    }

    fn time_window_is_empty(&self) -> bool {
        matches!((self.start_time, self.end_time), (Some(s), Some(e)) if s == e)
            || self.end_time == Some(NaiveTime::MIN) && self.start_time.is_none()
    }

    /// First time of day at or after `time` inside the daily window.
    fn first_time_at_or_after(&self, time: NaiveTime) -> Option<NaiveTime> {
        match (self.start_time, self.end_time) {
            (None, None) => Some(time),
            (Some(start), None) => Some(time.max(start)),
            (None, Some(end)) => (time < end).then_some(time),
            (Some(start), Some(end)) if start < end => (time < end).then(|| time.max(start)),
            (Some(start), Some(end)) if start > end => {
                if time < end {
                    Some(time)
                } else {
                    Some(time.max(start))
                }
            }
            _ => None,
        }
    }
}

/// A set of time frames; satisfied when any member matches or the set is empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeFrames(Vec<TimeFrame>);

impl TimeFrames {
    /// Create an empty set, which always matches.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a frame, ignoring exact duplicates.
    pub fn with(mut self, frame: TimeFrame) -> Self {
        self.insert(frame);
        self
    }

    /// Insert a frame, ignoring exact duplicates.
    pub fn insert(&mut self, frame: TimeFrame) {
        if !self.0.contains(&frame) {
            self.0.push(frame);
        }
    }

    /// Whether the set has no frames.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the frames.
    pub fn iter(&self) -> impl Iterator<Item = &TimeFrame> {
        self.0.iter()
    }

    /// Check whether the instant is inside any frame (or the set is empty).
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.0.is_empty() || self.0.iter().any(|frame| frame.contains(at))
    }

    /// Nearest instant at or after `after` at which some frame is active.
    pub fn next_activation(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.0.is_empty() {
            return Some(after);
        }
        self.0
            .iter()
            .filter_map(|frame| frame.next_activation(after))
            .min()
    }
}

impl FromIterator<TimeFrame> for TimeFrames {
    fn from_iter<I: IntoIterator<Item = TimeFrame>>(iter: I) -> Self {
        let mut frames = TimeFrames::new();
        for frame in iter {
            frames.insert(frame);
        }
        frames
    }
}

fn first_of_next_month(day: NaiveDate) -> Option<NaiveDate> {
    if day.month() == 12 {
        NaiveDate::from_ymd_opt(day.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(day.year(), day.month() + 1, 1)
    }
}

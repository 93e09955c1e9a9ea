//! Core identifier types for the scheduler.
//!
//! These types provide type-safe identifiers for triggers, instances and
//! notifications, plus the partition arithmetic that maps ids onto cluster nodes.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Milliseconds since the Unix epoch.
pub type EpochMillis = i64;

/// Unique identifier for a job trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriggerId(u64);

/// Unique identifier for a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(u64);

/// Unique identifier for a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NotificationId(u64);

macro_rules! numeric_id {
    ($ty:ident) => {
        impl $ty {
            /// Create an identifier from its raw value.
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            /// Get the raw value.
            pub const fn value(&self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $ty {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

numeric_id!(TriggerId);
numeric_id!(InstanceId);
numeric_id!(NotificationId);

/// The slice of the id space owned by one cluster node.
///
/// An id belongs to the partition iff `count == 1` or `id % count == id_of_partition`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
    /// Position of the owning node.
    pub id: u32,
    /// Number of partitions (cluster size).
    pub count: u32,
}

impl Partition {
    /// The partition covering every id.
    pub const ALL: Partition = Partition { id: 0, count: 1 };

    /// Create a partition. A zero count is treated as a single partition.
    pub fn new(id: u32, count: u32) -> Self {
        Self {
            id,
            count: count.max(1),
        }
    }

    /// Check whether an id falls into this partition.
    pub fn owns(&self, id: u64) -> bool {
        self.count <= 1 || id % u64::from(self.count) == u64::from(self.id)
    }
}

impl Default for Partition {
    fn default() -> Self {
        Self::ALL
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.id, self.count)
    }
}

/// Current wall-clock time in epoch millis.
pub fn now_millis() -> EpochMillis {
    Utc::now().timestamp_millis()
}

/// Convert epoch millis into a UTC timestamp, clamping values chrono cannot represent.
pub fn to_datetime(millis: EpochMillis) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Delay from `now` until `at`, zero when `at` already passed.
pub fn delay_until(at: EpochMillis, now: EpochMillis) -> std::time::Duration {
    std::time::Duration::from_millis(at.saturating_sub(now).max(0) as u64)
}

/// `now + delay` in epoch millis, saturating instead of overflowing.
pub fn millis_after(now: EpochMillis, delay: std::time::Duration) -> EpochMillis {
    now.saturating_add(EpochMillis::try_from(delay.as_millis()).unwrap_or(EpochMillis::MAX))
}

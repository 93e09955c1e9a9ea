//! Schedulers binding persisted work to actors.
//!
//! - [`JobScheduler`]: one actor per trigger and per `NEW` instance in this
//!   node's partition, rebalanced on every membership change
//! - [`NotificationScheduler`]: one suspended actor per channel key that
//!   drains ready notifications in batches

mod handlers;
mod job;
mod notification;
mod types;

pub use job::{JobScheduler, JobSchedulerBuilder};
pub use notification::{EarliestSchedule, NotificationScheduler, NotificationSchedulerBuilder};
pub use types::SchedulerError;

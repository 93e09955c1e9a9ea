//! Domain model: identifiers, schedules, time frames, work items and processors.

pub mod context;
pub mod job;
pub mod notification;
pub mod processor;
pub mod retry;
pub mod schedule;
pub mod time_frame;
pub mod types;

//! Configuration loading and parsing.
//!
//! This module provides YAML-based configuration for the schedulers and the
//! triggers installed at startup.

mod builder;
mod error;
mod types;
mod yaml;

pub use builder::TriggerConfigBuilder;
pub use error::ConfigError;
pub use types::{
    JobSchedulerConfig, NotificationSchedulerConfig, SchedulerConfig, TriggerConfig,
    TriggerScheduleConfig,
};
pub use yaml::YamlLoader;

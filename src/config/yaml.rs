//! YAML configuration parsing.
//!
//! Parses scheduler settings and trigger definitions from YAML files.

use std::collections::HashSet;
use std::path::Path;

use super::error::ConfigError;
use super::types::{SchedulerConfig, TriggerConfig, TriggerScheduleConfig};
use crate::core::schedule::parse_duration;

/// YAML configuration loader.
pub struct YamlLoader;

impl YamlLoader {
    /// Load configuration from a file.
    pub fn load_config(path: impl AsRef<Path>) -> Result<SchedulerConfig, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse_config(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn parse_config(yaml: &str) -> Result<SchedulerConfig, ConfigError> {
        let config: SchedulerConfig = if yaml.trim().is_empty() {
            SchedulerConfig::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        Self::validate_config(&config)?;
        Ok(config)
    }

    /// Validate a configuration.
    fn validate_config(config: &SchedulerConfig) -> Result<(), ConfigError> {
        if config.job.process_count == 0 {
            return Err(ConfigError::InvalidConfig(
                "job.process_count cannot be zero".into(),
            ));
        }
        if config.notification.process_count == 0 {
            return Err(ConfigError::InvalidConfig(
                "notification.process_count cannot be zero".into(),
            ));
        }
        if config.notification.backoff_base_millis > config.notification.backoff_max_millis {
            return Err(ConfigError::InvalidConfig(format!(
                "notification.backoff_base_millis ({}) exceeds backoff_max_millis ({})",
                config.notification.backoff_base_millis, config.notification.backoff_max_millis
            )));
        }
        if config.job.transaction_timeout_secs == 0
            || config.notification.transaction_timeout_secs == 0
        {
            return Err(ConfigError::InvalidConfig(
                "transaction_timeout_secs cannot be zero".into(),
            ));
        }

        let mut ids = HashSet::new();
        for trigger in &config.triggers {
            Self::validate_trigger(trigger)?;
            if let Some(id) = trigger.id
                && !ids.insert(id)
            {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate trigger id: {}",
                    id
                )));
            }
        }

        Ok(())
    }

    /// Validate a trigger definition.
    fn validate_trigger(trigger: &TriggerConfig) -> Result<(), ConfigError> {
        if trigger.job.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "trigger job name cannot be empty".into(),
            ));
        }
        if let TriggerScheduleConfig::Every { every, limit, .. } = &trigger.schedule {
            parse_duration(every).map_err(|source| ConfigError::InvalidSchedule {
                job: trigger.job.clone(),
                source,
            })?;
            if *limit == Some(0) {
                return Err(ConfigError::InvalidConfig(format!(
                    "trigger '{}' has a zero firing limit",
                    trigger.job
                )));
            }
        }
        Ok(())
    }
}

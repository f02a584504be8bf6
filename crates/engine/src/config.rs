//! Engine configuration.
//!
//! Defaults are usable as-is; `from_env` overlays `LOGFLOW_*` variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use logflow_core::PartitionId;
use logflow_logstream::DEFAULT_MAX_FRAGMENT_SIZE;
use logflow_logstream::batch::framed_length;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub partition_id: PartitionId,
    /// Byte ceiling of one appended batch.
    pub max_fragment_size: usize,
    /// Processed commands between two snapshots; `0` disables snapshots.
    pub snapshot_period: u64,
    #[serde(with = "millis")]
    pub job_timeout_check_interval: Duration,
    #[serde(with = "millis")]
    pub job_backoff_check_interval: Duration,
    /// How long the partition loop waits for requests before running due sweeps.
    #[serde(with = "millis")]
    pub tick_interval: Duration,
    /// Thread name of the partition runner.
    pub name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            partition_id: PartitionId::new(1),
            max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
            snapshot_period: 1000,
            job_timeout_check_interval: Duration::from_secs(1),
            job_backoff_check_interval: Duration::from_secs(1),
            tick_interval: Duration::from_millis(100),
            name: "logflow-partition".to_string(),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `LOGFLOW_PARTITION_ID`, `LOGFLOW_MAX_FRAGMENT_SIZE`,
    /// `LOGFLOW_SNAPSHOT_PERIOD`, `LOGFLOW_JOB_TIMEOUT_CHECK_INTERVAL_MS`,
    /// `LOGFLOW_JOB_BACKOFF_CHECK_INTERVAL_MS` and `LOGFLOW_TICK_INTERVAL_MS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`EngineConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = lookup("LOGFLOW_PARTITION_ID") {
            config.partition_id = PartitionId::new(parse("LOGFLOW_PARTITION_ID", &v)?);
        }
        if let Some(v) = lookup("LOGFLOW_MAX_FRAGMENT_SIZE") {
            config.max_fragment_size = parse("LOGFLOW_MAX_FRAGMENT_SIZE", &v)?;
        }
        if let Some(v) = lookup("LOGFLOW_SNAPSHOT_PERIOD") {
            config.snapshot_period = parse("LOGFLOW_SNAPSHOT_PERIOD", &v)?;
        }
        if let Some(v) = lookup("LOGFLOW_JOB_TIMEOUT_CHECK_INTERVAL_MS") {
            config.job_timeout_check_interval =
                Duration::from_millis(parse("LOGFLOW_JOB_TIMEOUT_CHECK_INTERVAL_MS", &v)?);
        }
        if let Some(v) = lookup("LOGFLOW_JOB_BACKOFF_CHECK_INTERVAL_MS") {
            config.job_backoff_check_interval =
                Duration::from_millis(parse("LOGFLOW_JOB_BACKOFF_CHECK_INTERVAL_MS", &v)?);
        }
        if let Some(v) = lookup("LOGFLOW_TICK_INTERVAL_MS") {
            config.tick_interval = Duration::from_millis(parse("LOGFLOW_TICK_INTERVAL_MS", &v)?);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_fragment_size <= framed_length(0) {
            return Err(ConfigError::Invalid(format!(
                "max_fragment_size must exceed one record header ({} bytes)",
                framed_length(0)
            )));
        }
        if self.job_timeout_check_interval.is_zero()
            || self.job_backoff_check_interval.is_zero()
            || self.tick_interval.is_zero()
        {
            return Err(ConfigError::Invalid("intervals must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn with_partition_id(mut self, partition_id: PartitionId) -> Self {
        self.partition_id = partition_id;
        self
    }

    pub fn with_max_fragment_size(mut self, max_fragment_size: usize) -> Self {
        self.max_fragment_size = max_fragment_size;
        self
    }

    pub fn with_snapshot_period(mut self, snapshot_period: u64) -> Self {
        self.snapshot_period = snapshot_period;
        self
    }

    pub fn with_job_timeout_check_interval(mut self, interval: Duration) -> Self {
        self.job_timeout_check_interval = interval;
        self
    }

    pub fn with_job_backoff_check_interval(mut self, interval: Duration) -> Self {
        self.job_backoff_check_interval = interval;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

fn parse<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        name,
        value: value.to_string(),
    })
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_fragment_size, 4 * 1024 * 1024);
        assert_eq!(config.snapshot_period, 1000);
    }

    #[test]
    fn env_overrides_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("LOGFLOW_PARTITION_ID", "3"),
            ("LOGFLOW_SNAPSHOT_PERIOD", "0"),
            ("LOGFLOW_TICK_INTERVAL_MS", "25"),
        ]))
        .unwrap();

        assert_eq!(config.partition_id, PartitionId::new(3));
        assert_eq!(config.snapshot_period, 0);
        assert_eq!(config.tick_interval, Duration::from_millis(25));
        assert_eq!(config.job_timeout_check_interval, Duration::from_secs(1));
    }

    #[test]
    fn invalid_values_are_reported() {
        let err = EngineConfig::from_lookup(lookup(&[("LOGFLOW_MAX_FRAGMENT_SIZE", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "LOGFLOW_MAX_FRAGMENT_SIZE", .. }));

        let err =
            EngineConfig::from_lookup(lookup(&[("LOGFLOW_MAX_FRAGMENT_SIZE", "8")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = EngineConfig::from_lookup(lookup(&[("LOGFLOW_JOB_TIMEOUT_CHECK_INTERVAL_MS", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn config_deserializes_with_millisecond_intervals() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"partition_id": 2, "tick_interval": 50}"#).unwrap();
        assert_eq!(config.partition_id, PartitionId::new(2));
        assert_eq!(config.tick_interval, Duration::from_millis(50));
        assert_eq!(config.snapshot_period, 1000);
    }
}

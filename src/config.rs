//! Manager configuration.
//!
//! Every knob has a documented default so an empty TOML document (or
//! `ManagerConfig::default()`) yields a working manager.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::validate::{Validate, ValidationResult};

/// What a second `provision` for an in-flight key does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionPolicy {
    /// Wait for the in-flight attempt and share its outcome.
    Wait,
    /// Fail immediately with `ProvisionInProgress`.
    #[default]
    Fail,
}

/// Configuration for a [`SandboxManager`](crate::manager::SandboxManager).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// How long a terminal sandbox stays queryable before eviction.
    #[serde(default = "default_grace_period", rename = "grace_period_secs", with = "secs")]
    pub grace_period: Duration,

    /// Deadline for a sandbox to go from `Provisioning` to `Running`.
    #[serde(
        default = "default_provision_timeout",
        rename = "provision_timeout_secs",
        with = "secs"
    )]
    pub provision_timeout: Duration,

    /// Tear down `Running` sandboxes with no exec activity for this long.
    #[serde(default, rename = "idle_timeout_secs", with = "opt_secs")]
    pub idle_timeout: Option<Duration>,

    /// Consecutive failed status queries before a sandbox is marked failed.
    #[serde(default = "default_query_failure_threshold")]
    pub query_failure_threshold: u32,

    #[serde(default)]
    pub provision_policy: ProvisionPolicy,

    /// Capacity of the live event channel per subscriber.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Maximum number of events kept for history replay.
    #[serde(default = "default_event_history_limit")]
    pub event_history_limit: usize,

    /// How long events of an evicted sandbox stay replayable.
    #[serde(
        default = "default_event_retention",
        rename = "event_retention_secs",
        with = "secs"
    )]
    pub event_retention: Duration,

    /// Base interval between watchdog sweeps.
    #[serde(
        default = "default_watchdog_interval",
        rename = "watchdog_interval_secs",
        with = "secs"
    )]
    pub watchdog_interval: Duration,

    /// Upper bound for the watchdog's backoff while the backend is down.
    #[serde(
        default = "default_watchdog_max_backoff",
        rename = "watchdog_max_backoff_secs",
        with = "secs"
    )]
    pub watchdog_max_backoff: Duration,
}

fn default_grace_period() -> Duration {
    Duration::from_secs(30)
}

fn default_provision_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_query_failure_threshold() -> u32 {
    3
}

fn default_event_buffer() -> usize {
    256
}

fn default_event_history_limit() -> usize {
    10_000
}

fn default_event_retention() -> Duration {
    Duration::from_secs(3600)
}

fn default_watchdog_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_watchdog_max_backoff() -> Duration {
    Duration::from_secs(120)
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            grace_period: default_grace_period(),
            provision_timeout: default_provision_timeout(),
            idle_timeout: None,
            query_failure_threshold: default_query_failure_threshold(),
            provision_policy: ProvisionPolicy::default(),
            event_buffer: default_event_buffer(),
            event_history_limit: default_event_history_limit(),
            event_retention: default_event_retention(),
            watchdog_interval: default_watchdog_interval(),
            watchdog_max_backoff: default_watchdog_max_backoff(),
        }
    }
}

impl ManagerConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: ManagerConfig = toml::from_str(source)
            .map_err(|e| Error::InvalidConfig(format!("failed to parse manager config: {}", e)))?;
        config.validate().into_result()?;
        Ok(config)
    }

    /// Reads a TOML file from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&source)
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_provision_timeout(mut self, timeout: Duration) -> Self {
        self.provision_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn with_query_failure_threshold(mut self, threshold: u32) -> Self {
        self.query_failure_threshold = threshold;
        self
    }

    pub fn with_provision_policy(mut self, policy: ProvisionPolicy) -> Self {
        self.provision_policy = policy;
        self
    }

    pub fn with_event_retention(mut self, retention: Duration) -> Self {
        self.event_retention = retention;
        self
    }
}

impl Validate for ManagerConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.query_failure_threshold == 0 {
            result.add_error("query_failure_threshold must be at least 1");
        }
        if self.event_buffer == 0 {
            result.add_error("event_buffer must be at least 1");
        }
        if self.event_history_limit == 0 {
            result.add_error("event_history_limit must be at least 1");
        }
        if self.provision_timeout.is_zero() {
            result.add_error("provision_timeout must be positive");
        }
        if self.watchdog_interval.is_zero() {
            result.add_error("watchdog_interval must be positive");
        }
        if self.watchdog_max_backoff < self.watchdog_interval {
            result.add_error("watchdog_max_backoff must not be shorter than watchdog_interval");
        }

        if let Some(idle) = self.idle_timeout {
            if idle < Duration::from_secs(10) {
                result.add_warning("idle_timeout less than 10 seconds may stop sandboxes mid-task");
            }
        }
        if self.query_failure_threshold == 1 {
            result.add_warning("query_failure_threshold of 1 fails sandboxes on any transient error");
        }

        result
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manager_config_has_sensible_defaults() {
        let config = ManagerConfig::default();

        assert_eq!(config.grace_period, Duration::from_secs(30));
        assert_eq!(config.provision_timeout, Duration::from_secs(300));
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.query_failure_threshold, 3);
        assert_eq!(config.provision_policy, ProvisionPolicy::Fail);
        assert!(config.validate().is_valid());
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let config = ManagerConfig::from_toml_str("").unwrap();
        assert_eq!(config, ManagerConfig::default());
    }

    #[test]
    fn toml_overrides_are_applied() {
        let config = ManagerConfig::from_toml_str(
            r#"
            grace_period_secs = 5
            idle_timeout_secs = 600
            query_failure_threshold = 5
            provision_policy = "wait"
            "#,
        )
        .unwrap();

        assert_eq!(config.grace_period, Duration::from_secs(5));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(600)));
        assert_eq!(config.query_failure_threshold, 5);
        assert_eq!(config.provision_policy, ProvisionPolicy::Wait);
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let err = ManagerConfig::from_toml_str("query_failure_threshold = 0").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(msg) if msg.contains("threshold")));
    }

    #[test]
    fn malformed_toml_is_invalid_config() {
        let err = ManagerConfig::from_toml_str("grace_period_secs = \"soon\"").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn short_idle_timeout_warns() {
        let config = ManagerConfig::default().with_idle_timeout(Duration::from_secs(1));
        let result = config.validate();
        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.contains("idle_timeout")));
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("manager.toml");
        std::fs::write(&path, "provision_timeout_secs = 42\n").unwrap();

        let config = ManagerConfig::from_file(&path).unwrap();
        assert_eq!(config.provision_timeout, Duration::from_secs(42));
    }
}

//! Checker configuration
//!
//! Layered: defaults, then an optional TOML file, then `SEGCOORD_*`
//! environment variables, then command line flags.

use crate::balance::BalancerKind;
use segcoord_metadata::TargetConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Checker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckerConfig {
    /// Interval between check passes in milliseconds
    pub check_interval_ms: u64,

    /// Interval between next-target refreshes in milliseconds
    pub target_refresh_interval_ms: u64,

    /// Upper bound on one recovery-info call in milliseconds
    pub recovery_info_timeout_ms: u64,

    /// Placement strategy for lacking segments
    pub balancer: BalancerKind,

    /// Capacity of the controller → executor task channel
    pub task_channel_capacity: usize,

    /// Prometheus exporter port, 0 disables it
    pub metrics_port: u16,

    /// Default tracing filter when RUST_LOG is unset
    pub log_level: String,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 1_000,
            target_refresh_interval_ms: 5_000,
            recovery_info_timeout_ms: 10_000,
            balancer: BalancerKind::default(),
            task_channel_capacity: 1_024,
            metrics_port: 0,
            log_level: "info".to_string(),
        }
    }
}

impl CheckerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: CheckerConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with fallback to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load config, using defaults");
                Self::default()
            }
        }
    }

    /// Defaults overridden by the environment
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `SEGCOORD_*` overrides; unparsable values are ignored
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |key: &str| lookup(key).and_then(|v| v.parse::<u64>().ok());

        if let Some(ms) = parsed("SEGCOORD_CHECK_INTERVAL_MS") {
            self.check_interval_ms = ms;
        }
        if let Some(ms) = parsed("SEGCOORD_TARGET_REFRESH_INTERVAL_MS") {
            self.target_refresh_interval_ms = ms;
        }
        if let Some(ms) = parsed("SEGCOORD_RECOVERY_INFO_TIMEOUT_MS") {
            self.recovery_info_timeout_ms = ms;
        }
        if let Some(kind) = lookup("SEGCOORD_BALANCER").and_then(|v| v.parse().ok()) {
            self.balancer = kind;
        }
        if let Some(capacity) = parsed("SEGCOORD_TASK_CHANNEL_CAPACITY") {
            self.task_channel_capacity = capacity as usize;
        }
        if let Some(port) = lookup("SEGCOORD_METRICS_PORT").and_then(|v| v.parse().ok()) {
            self.metrics_port = port;
        }
        if let Some(level) = lookup("SEGCOORD_LOG_LEVEL") {
            self.log_level = level;
        }

        self
    }

    /// Override config with CLI arguments
    pub fn with_overrides(
        mut self,
        check_interval_ms: Option<u64>,
        balancer: Option<BalancerKind>,
        metrics_port: Option<u16>,
    ) -> Self {
        if let Some(ms) = check_interval_ms {
            self.check_interval_ms = ms;
        }
        if let Some(kind) = balancer {
            self.balancer = kind;
        }
        if let Some(port) = metrics_port {
            self.metrics_port = port;
        }
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.check_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "check_interval_ms cannot be 0".to_string(),
            ));
        }
        if self.target_refresh_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "target_refresh_interval_ms cannot be 0".to_string(),
            ));
        }
        if self.recovery_info_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "recovery_info_timeout_ms cannot be 0".to_string(),
            ));
        }
        if self.task_channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "task_channel_capacity cannot be 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn target_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.target_refresh_interval_ms)
    }

    pub fn target_config(&self) -> TargetConfig {
        TargetConfig {
            recovery_info_timeout: Duration::from_millis(self.recovery_info_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = CheckerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.balancer, BalancerKind::ScoreBased);
        assert_eq!(config.metrics_port, 0);
    }

    #[test]
    fn test_from_file_fills_missing_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "check_interval_ms = 250\nbalancer = \"round_robin\"\nmetrics_port = 9100"
        )
        .unwrap();

        let config = CheckerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.check_interval(), Duration::from_millis(250));
        assert_eq!(config.balancer, BalancerKind::RoundRobin);
        assert_eq!(config.metrics_port, 9100);
        assert_eq!(config.task_channel_capacity, 1_024);
    }

    #[test]
    fn test_from_file_rejects_zero_interval() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "check_interval_ms = 0").unwrap();

        let err = CheckerConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_from_file_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "balancer = \"sideways\"").unwrap();

        let err = CheckerConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_load_or_default_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = CheckerConfig::load_or_default(dir.path().join("absent.toml"));
        assert_eq!(config, CheckerConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("SEGCOORD_CHECK_INTERVAL_MS", "50"),
            ("SEGCOORD_BALANCER", "round-robin"),
            ("SEGCOORD_TASK_CHANNEL_CAPACITY", "not-a-number"),
            ("SEGCOORD_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();

        let config = CheckerConfig::default()
            .with_overrides_from(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.check_interval_ms, 50);
        assert_eq!(config.balancer, BalancerKind::RoundRobin);
        assert_eq!(config.task_channel_capacity, 1_024);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_cli_overrides_win() {
        let config = CheckerConfig::default().with_overrides(Some(10), None, Some(9000));
        assert_eq!(config.check_interval_ms, 10);
        assert_eq!(config.metrics_port, 9000);
        assert_eq!(config.balancer, BalancerKind::ScoreBased);
    }

    #[test]
    fn test_target_config_timeout() {
        let config = CheckerConfig {
            recovery_info_timeout_ms: 1_500,
            ..Default::default()
        };
        assert_eq!(
            config.target_config().recovery_info_timeout,
            Duration::from_millis(1_500)
        );
    }
}

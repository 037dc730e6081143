//! Engine configuration
//!
//! Loaded from a YAML file:
//!
//! ```yaml
//! timeouts:
//!   create: 10m
//!   delete: 1h 30m
//! poll:
//!   min_poll_interval: 5s
//!   not_found_checks: 30
//! retry:
//!   initial_delay: 500ms
//!   max_delay: 10s
//!   jitter: true
//! ```
//!
//! The file is looked up in this order:
//! 1. `SETTLE_CONFIG_PATH` (direct path)
//! 2. `<config dir>/settle/config.yaml` (e.g. `~/.config/settle/config.yaml`)
//!
//! A missing file means "all defaults". Per-operation timeouts can then be
//! overridden with `SETTLE_TIMEOUT_CREATE`, `SETTLE_TIMEOUT_READ`,
//! `SETTLE_TIMEOUT_UPDATE` and `SETTLE_TIMEOUT_DELETE`.

use crate::error::{Error, Result};
use crate::retry::RetryConfig;
use crate::waiter::DEFAULT_NOT_FOUND_CHECKS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "SETTLE_CONFIG_PATH";
const CONFIG_DIR: &str = "settle";
const CONFIG_FILE: &str = "config.yaml";

/// Per-operation time budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    #[serde(with = "humantime_serde")]
    pub create: Duration,

    /// Also bounds the not-found retry window right after a create
    #[serde(with = "humantime_serde")]
    pub read: Duration,

    #[serde(with = "humantime_serde")]
    pub update: Duration,

    #[serde(with = "humantime_serde")]
    pub delete: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            create: Duration::from_secs(10 * 60),
            read: Duration::from_secs(2 * 60),
            update: Duration::from_secs(10 * 60),
            delete: Duration::from_secs(10 * 60),
        }
    }
}

/// Polling defaults applied to every wait
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Floor for the interval between refreshes
    #[serde(with = "humantime_serde")]
    pub min_poll_interval: Duration,

    /// Not-found observations tolerated while waiting for a resource to appear
    pub not_found_checks: u32,

    /// Refresh once more when a wait times out
    pub final_probe: bool,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            min_poll_interval: Duration::ZERO,
            not_found_checks: DEFAULT_NOT_FOUND_CHECKS,
            final_probe: false,
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub timeouts: Timeouts,
    pub poll: PollConfig,
    pub retry: RetryConfig,
}

impl EngineConfig {
    /// `<config dir>/settle/config.yaml`, if the platform has a config dir
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_yaml(&content)?;
        tracing::debug!("Loaded engine config from {}", path.display());
        Ok(config)
    }

    /// Resolve the config file, load it and apply environment overrides
    pub fn load() -> Result<Self> {
        let path = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.is_empty() => {
                let path = PathBuf::from(path);
                if !path.exists() {
                    return Err(Error::InvalidConfig(format!(
                        "{} points to a missing file: {}",
                        CONFIG_PATH_ENV,
                        path.display()
                    )));
                }
                Some(path)
            }
            _ => Self::default_path().filter(|p| p.exists()),
        };

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                tracing::debug!("No engine config file found, using defaults");
                Self::default()
            }
        };

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SETTLE_TIMEOUT_*` overrides
    pub fn apply_env(&mut self) -> Result<()> {
        let slots = [
            ("SETTLE_TIMEOUT_CREATE", &mut self.timeouts.create),
            ("SETTLE_TIMEOUT_READ", &mut self.timeouts.read),
            ("SETTLE_TIMEOUT_UPDATE", &mut self.timeouts.update),
            ("SETTLE_TIMEOUT_DELETE", &mut self.timeouts.delete),
        ];

        for (var, slot) in slots {
            if let Ok(value) = std::env::var(var) {
                *slot = parse_env_duration(&value)
                    .map_err(|e| Error::InvalidConfig(format!("{}: {}", var, e)))?;
                tracing::debug!("{} overrides timeout: {:?}", var, slot);
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let timeouts = [
            ("create", self.timeouts.create),
            ("read", self.timeouts.read),
            ("update", self.timeouts.update),
            ("delete", self.timeouts.delete),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, t)| t.is_zero()) {
            return Err(Error::InvalidConfig(format!(
                "{} timeout must be greater than zero",
                name
            )));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::InvalidConfig(format!(
                "retry backoff_multiplier must be at least 1.0, got {}",
                self.retry.backoff_multiplier
            )));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(Error::InvalidConfig(
                "retry initial_delay exceeds max_delay".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse an env override: humantime (`"1h 30m"`, `"90s"`), or bare seconds
fn parse_env_duration(value: &str) -> std::result::Result<Duration, String> {
    let value = value.trim();
    if let Ok(d) = humantime_serde::re::humantime::parse_duration(value) {
        return Ok(d);
    }
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    Err(format!("invalid duration '{}'", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    #[test]
    fn test_parse_env_duration() {
        assert_eq!(parse_env_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_env_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_env_duration("1h 30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_env_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_env_duration("45").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_env_duration(" 2h ").unwrap(), Duration::from_secs(7200));
    }

    #[test]
    fn test_parse_env_duration_rejects_garbage() {
        for bad in ["", "m", "10x", "ten minutes", "-5s", "9999999999999999h"] {
            assert!(parse_env_duration(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_from_yaml_rejects_overflowing_duration() {
        let err = EngineConfig::from_yaml("timeouts:\n  create: 9999999999999999h\n").unwrap_err();
        assert!(matches!(err, Error::Yaml(_)));
    }

    #[test]
    fn test_from_yaml_partial() {
        let config = EngineConfig::from_yaml(
            r#"
timeouts:
  create: 20m
  delete: 1h
  update: 1h 30m
poll:
  min_poll_interval: 5s
retry:
  max_attempts: 4
  jitter: true
"#,
        )
        .unwrap();

        assert_eq!(config.timeouts.create, Duration::from_secs(1200));
        assert_eq!(config.timeouts.delete, Duration::from_secs(3600));
        assert_eq!(config.timeouts.update, Duration::from_secs(5400));
        assert_eq!(config.timeouts.read, Timeouts::default().read);
        assert_eq!(config.poll.min_poll_interval, Duration::from_secs(5));
        assert_eq!(config.poll.not_found_checks, DEFAULT_NOT_FOUND_CHECKS);
        assert_eq!(config.retry.max_attempts, 4);
        assert!(config.retry.jitter);
        assert_eq!(config.retry.max_delay, RetryConfig::default().max_delay);
    }

    #[test]
    fn test_from_yaml_rejects_zero_timeout() {
        let err = EngineConfig::from_yaml("timeouts:\n  update: 0s\n").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(ref msg) if msg.contains("update")));
    }

    #[test]
    fn test_from_yaml_rejects_bad_duration() {
        let err = EngineConfig::from_yaml("timeouts:\n  create: soon\n").unwrap_err();
        assert!(matches!(err, Error::Yaml(_)));
    }

    #[test]
    fn test_yaml_roundtrip_uses_readable_durations() {
        let yaml = serde_yaml::to_string(&EngineConfig::default()).unwrap();
        assert!(yaml.contains("10m"));
        assert_eq!(EngineConfig::from_yaml(&yaml).unwrap(), EngineConfig::default());
    }

    #[test]
    #[serial]
    fn test_load_from_env_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("engine.yaml");
        fs::write(&config_path, "timeouts:\n  create: 30m\n").unwrap();

        temp_env::with_vars(
            [
                (CONFIG_PATH_ENV, Some(config_path.to_str().unwrap())),
                ("SETTLE_TIMEOUT_DELETE", Some("45s")),
                ("SETTLE_TIMEOUT_CREATE", None),
            ],
            || {
                let config = EngineConfig::load().unwrap();
                assert_eq!(config.timeouts.create, Duration::from_secs(1800));
                assert_eq!(config.timeouts.delete, Duration::from_secs(45));
            },
        );
    }

    #[test]
    #[serial]
    fn test_env_timeout_overrides_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("engine.yaml");
        fs::write(&config_path, "timeouts:\n  create: 30m\n").unwrap();

        temp_env::with_vars(
            [
                (CONFIG_PATH_ENV, Some(config_path.to_str().unwrap())),
                ("SETTLE_TIMEOUT_CREATE", Some("5m")),
            ],
            || {
                let config = EngineConfig::load().unwrap();
                assert_eq!(config.timeouts.create, Duration::from_secs(300));
            },
        );
    }

    #[test]
    #[serial]
    fn test_load_invalid_env_timeout() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("engine.yaml");
        fs::write(&config_path, "{}\n").unwrap();

        temp_env::with_vars(
            [
                (CONFIG_PATH_ENV, Some(config_path.to_str().unwrap())),
                ("SETTLE_TIMEOUT_READ", Some("whenever")),
            ],
            || {
                let err = EngineConfig::load().unwrap_err();
                assert!(err.to_string().contains("SETTLE_TIMEOUT_READ"));
            },
        );
    }

    #[test]
    #[serial]
    fn test_load_overflowing_env_timeout() {
        temp_env::with_vars(
            [
                (CONFIG_PATH_ENV, None),
                ("SETTLE_TIMEOUT_CREATE", Some("9999999999999999h")),
            ],
            || {
                let mut config = EngineConfig::default();
                let err = config.apply_env().unwrap_err();
                assert!(
                    matches!(err, Error::InvalidConfig(ref msg) if msg.contains("SETTLE_TIMEOUT_CREATE"))
                );
            },
        );
    }

    #[test]
    #[serial]
    fn test_load_missing_env_path() {
        temp_env::with_var(CONFIG_PATH_ENV, Some("/nonexistent/settle.yaml"), || {
            let err = EngineConfig::load().unwrap_err();
            assert!(matches!(err, Error::InvalidConfig(_)));
        });
    }
}

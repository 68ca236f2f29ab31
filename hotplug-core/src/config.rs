//! Daemon configuration.
//!
//! Loaded from `<home>/.hotplug/config.yaml`. Every field has a default, so an
//! absent file or an empty mapping yields a working configuration.
//!
//! ```yaml
//! children_max: 16
//! event_timeout_secs: 180
//! retry_interval_ms: 200
//! rules_program: /usr/lib/hotplug/run-rules
//! log_format: json
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_EVENT_TIMEOUT_SECS: u64 = 180;
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 200;
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 180;
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Output format of the daemon log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Size of the worker pool.
    pub children_max: usize,
    /// Hard deadline for one worker execution.
    pub event_timeout_secs: u64,
    /// Soft deadline; defaults to a third of `event_timeout_secs`.
    pub timeout_warning_secs: Option<u64>,
    /// Re-scan period of an event deferred by a device lock.
    pub retry_interval_ms: u64,
    /// Ceiling after which a deferred event runs regardless of the lock.
    pub lock_timeout_secs: u64,
    /// How long shutdown waits for running workers before killing them.
    pub shutdown_timeout_secs: u64,
    /// External rule program run once per event. `None` runs no rules.
    pub rules_program: Option<PathBuf>,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            children_max: default_children_max(),
            event_timeout_secs: DEFAULT_EVENT_TIMEOUT_SECS,
            timeout_warning_secs: None,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            rules_program: None,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

/// Home directory the daemon and its clients resolve their paths against.
pub fn home_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

impl DaemonConfig {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load_at(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.children_max == 0 {
            return Err(ConfigError::Invalid("children_max must be at least 1".into()));
        }
        if self.event_timeout_secs == 0 {
            return Err(ConfigError::Invalid("event_timeout_secs must be positive".into()));
        }
        if self.retry_interval_ms == 0 {
            return Err(ConfigError::Invalid("retry_interval_ms must be positive".into()));
        }
        if self.lock_timeout_secs == 0 {
            return Err(ConfigError::Invalid("lock_timeout_secs must be positive".into()));
        }
        if let Some(warn) = self.timeout_warning_secs {
            if warn == 0 || warn >= self.event_timeout_secs {
                return Err(ConfigError::Invalid(format!(
                    "timeout_warning_secs ({warn}) must be between 1 and event_timeout_secs ({})",
                    self.event_timeout_secs
                )));
            }
        }
        Ok(())
    }

    pub fn event_timeout(&self) -> Duration {
        Duration::from_secs(self.event_timeout_secs)
    }

    pub fn timeout_warning(&self) -> Duration {
        match self.timeout_warning_secs {
            Some(secs) => Duration::from_secs(secs),
            None => (self.event_timeout() / 3).max(Duration::from_secs(1)),
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Eight workers plus two per CPU, capped at 64.
fn default_children_max() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (8 + 2 * cpus).min(64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let config = DaemonConfig::load_at(&dir.path().join("config.yaml")).expect("load");
        assert_eq!(config, DaemonConfig::default());
        assert!(config.children_max >= 10);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "children_max: 3\nlog_format: json\n").expect("write");

        let config = DaemonConfig::load_at(&path).expect("load");
        assert_eq!(config.children_max, 3);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.retry_interval(), Duration::from_millis(200));
        assert_eq!(config.timeout_warning(), Duration::from_secs(60));
    }

    #[rstest]
    #[case(1, 1)]
    #[case(2, 1)]
    #[case(3, 1)]
    #[case(180, 60)]
    fn default_warning_is_a_third_of_the_kill_timeout_but_never_zero(
        #[case] event_timeout_secs: u64,
        #[case] expected_secs: u64,
    ) {
        let config = DaemonConfig {
            event_timeout_secs,
            ..DaemonConfig::default()
        };
        assert_eq!(config.timeout_warning(), Duration::from_secs(expected_secs));
    }

    #[rstest]
    #[case("children_max: 0\n")]
    #[case("event_timeout_secs: 0\n")]
    #[case("retry_interval_ms: 0\n")]
    #[case("event_timeout_secs: 10\ntimeout_warning_secs: 10\n")]
    fn invalid_values_are_rejected(#[case] yaml: &str) {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, yaml).expect("write");

        let err = DaemonConfig::load_at(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "got: {err}");
    }

    #[test]
    fn malformed_yaml_reports_path() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "children_max: [unclosed").expect("write");

        let err = DaemonConfig::load_at(&path).unwrap_err();
        assert!(err.to_string().contains("config.yaml"), "got: {err}");
    }
}

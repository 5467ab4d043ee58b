//! Runtime configuration.
//!
//! Loaded from TOML; every field is optional:
//!
//! ```toml
//! workers = 4
//! queue_capacity = 256
//! overload = "block"
//! submit_timeout_ms = 50
//! cache_capacity_bytes = 268435456
//! default_deadline_ms = 30000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::cache::DEFAULT_CACHE_CAPACITY;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// TOML is malformed or has unknown keys.
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// A worker thread could not be started.
    #[error("cannot start worker thread: {0}")]
    Spawn(std::io::Error),
}

/// Result type for configuration.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// What `submit` does when the job queue is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverloadMode {
    /// Resolve with `Overloaded` immediately.
    #[default]
    FailFast,
    /// Wait up to `submit_timeout_ms` for room.
    Block,
}

/// Backpressure policy resolved from the config.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverloadPolicy {
    /// Resolve with `Overloaded` immediately.
    FailFast,
    /// Wait up to `timeout` for room, then `Overloaded`.
    Block {
        /// Longest wait.
        timeout: Duration,
    },
}

/// Scheduler and cache settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Worker threads. Capped by the engine session count.
    pub workers: usize,
    /// Jobs that may wait for a worker.
    pub queue_capacity: usize,
    /// Behavior on a full queue.
    pub overload: OverloadMode,
    /// Longest `submit` wait under `overload = "block"`.
    pub submit_timeout_ms: u64,
    /// Cache budget in bytes.
    pub cache_capacity_bytes: usize,
    /// Deadline for requests that do not set one.
    pub default_deadline_ms: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 64,
            overload: OverloadMode::FailFast,
            submit_timeout_ms: 100,
            cache_capacity_bytes: DEFAULT_CACHE_CAPACITY,
            default_deadline_ms: None,
        }
    }
}

impl RuntimeConfig {
    /// Settings for a host generating whole city blocks.
    #[must_use]
    pub const fn production() -> Self {
        Self {
            workers: 8,
            queue_capacity: 1024,
            overload: OverloadMode::Block,
            submit_timeout_ms: 250,
            cache_capacity_bytes: 1024 * 1024 * 1024,
            default_deadline_ms: Some(60_000),
        }
    }

    /// Parses and validates TOML.
    ///
    /// # Errors
    ///
    /// `Parse` on malformed TOML, `Invalid` on out-of-range values.
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// `Io` if the file cannot be read, otherwise as [`Self::from_toml_str`].
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::info!(path = %path.display(), workers = config.workers, "runtime config loaded");
        Ok(config)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// `Invalid` naming the first bad field.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.workers == 0 {
            return Err(invalid("workers", "must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity", "must be at least 1"));
        }
        if self.overload == OverloadMode::Block && self.submit_timeout_ms == 0 {
            return Err(invalid("submit_timeout_ms", "must be positive when overload = \"block\""));
        }
        if self.default_deadline_ms == Some(0) {
            return Err(invalid("default_deadline_ms", "must be positive"));
        }
        Ok(())
    }

    /// Backpressure policy.
    #[must_use]
    pub const fn overload_policy(&self) -> OverloadPolicy {
        match self.overload {
            OverloadMode::FailFast => OverloadPolicy::FailFast,
            OverloadMode::Block => OverloadPolicy::Block {
                timeout: Duration::from_millis(self.submit_timeout_ms),
            },
        }
    }

    /// Default request deadline.
    #[must_use]
    pub fn default_deadline(&self) -> Option<Duration> {
        self.default_deadline_ms.map(Duration::from_millis)
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        RuntimeConfig::default().validate().unwrap();
        RuntimeConfig::production().validate().unwrap();
    }

    #[test]
    fn test_partial_toml() {
        let config = RuntimeConfig::from_toml_str("workers = 3\noverload = \"block\"\nsubmit_timeout_ms = 20").unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.queue_capacity, RuntimeConfig::default().queue_capacity);
        assert_eq!(
            config.overload_policy(),
            OverloadPolicy::Block {
                timeout: Duration::from_millis(20)
            }
        );
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            RuntimeConfig::from_toml_str("workers = 0"),
            Err(ConfigError::Invalid { field: "workers", .. })
        ));
        assert!(matches!(
            RuntimeConfig::from_toml_str("threads = 4"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            RuntimeConfig::from_toml_str("overload = \"block\"\nsubmit_timeout_ms = 0"),
            Err(ConfigError::Invalid { field: "submit_timeout_ms", .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            RuntimeConfig::from_file("/nonexistent/lotgen.toml"),
            Err(ConfigError::Io { .. })
        ));
    }
}

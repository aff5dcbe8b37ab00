//! Configuration for the conversation engine.
//!
//! Configuration is optionally loaded from a TOML file; every field has a
//! default, so an empty file is valid.

use convo_sync_core::TypingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long a send waits for the channel ack before falling back to
    /// REST, in milliseconds (default: 10000).
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// How long a peer's typing indicator lasts without a refresh, in
    /// milliseconds (default: 3000).
    #[serde(default = "default_typing_ttl_ms")]
    pub typing_ttl_ms: u64,
    /// Re-broadcast interval for the local typing state (default: 3000).
    #[serde(default = "default_typing_rebroadcast_ms")]
    pub typing_rebroadcast_ms: u64,
    /// Local inactivity after which typing stops on its own (default: 5000).
    #[serde(default = "default_typing_idle_ms")]
    pub typing_idle_ms: u64,
    /// History page size (default: 20).
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Reactions held for messages not loaded yet (default: 256).
    #[serde(default = "default_max_parked_reactions")]
    pub max_parked_reactions: usize,
    /// Commands held while not ready, sends excluded (default: 128).
    #[serde(default = "default_command_queue_limit")]
    pub command_queue_limit: usize,
    /// How long close waits for queued channel invocations to drain before
    /// abandoning them, in milliseconds (default: 2000).
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
    /// Confirmed sends remembered for late delivery queries and duplicate
    /// acks (default: 512).
    #[serde(default = "default_confirmed_send_memory")]
    pub confirmed_send_memory: usize,
}

// Default value functions
fn default_send_timeout_ms() -> u64 {
    10_000
}

fn default_typing_ttl_ms() -> u64 {
    3_000
}

fn default_typing_rebroadcast_ms() -> u64 {
    3_000
}

fn default_typing_idle_ms() -> u64 {
    5_000
}

fn default_page_size() -> usize {
    20
}

fn default_max_parked_reactions() -> usize {
    256
}

fn default_command_queue_limit() -> usize {
    128
}

fn default_close_timeout_ms() -> u64 {
    2_000
}

fn default_confirmed_send_memory() -> usize {
    512
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: default_send_timeout_ms(),
            typing_ttl_ms: default_typing_ttl_ms(),
            typing_rebroadcast_ms: default_typing_rebroadcast_ms(),
            typing_idle_ms: default_typing_idle_ms(),
            page_size: default_page_size(),
            max_parked_reactions: default_max_parked_reactions(),
            command_queue_limit: default_command_queue_limit(),
            close_timeout_ms: default_close_timeout_ms(),
            confirmed_send_memory: default_confirmed_send_memory(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("send_timeout_ms", self.send_timeout_ms),
            ("typing_ttl_ms", self.typing_ttl_ms),
            ("typing_rebroadcast_ms", self.typing_rebroadcast_ms),
            ("typing_idle_ms", self.typing_idle_ms),
            ("page_size", self.page_size as u64),
            ("close_timeout_ms", self.close_timeout_ms),
            ("confirmed_send_memory", self.confirmed_send_memory as u64),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
        }
        Ok(())
    }

    /// Set the send timeout.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the peer typing TTL and the matching rebroadcast interval.
    pub fn with_typing_ttl(mut self, ttl: Duration) -> Self {
        self.typing_ttl_ms = ttl.as_millis() as u64;
        self.typing_rebroadcast_ms = self.typing_ttl_ms;
        self
    }

    /// Set the history page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the command queue bound.
    pub fn with_command_queue_limit(mut self, limit: usize) -> Self {
        self.command_queue_limit = limit;
        self
    }

    /// Set how long close waits for queued invocations.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Close drain timeout as a [`Duration`].
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Send timeout as a [`Duration`].
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Typing timings for the core coordinator.
    pub fn typing(&self) -> TypingConfig {
        TypingConfig {
            ttl: Duration::from_millis(self.typing_ttl_ms),
            rebroadcast: Duration::from_millis(self.typing_rebroadcast_ms),
            idle: Duration::from_millis(self.typing_idle_ms),
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.send_timeout_ms, 10_000);
        assert_eq!(config.page_size, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
send_timeout_ms = 2500
page_size = 50
typing_ttl_ms = 4000
"#;

        let config: EngineConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.send_timeout(), Duration::from_millis(2500));
        assert_eq!(config.page_size, 50);
        assert_eq!(config.typing().ttl, Duration::from_secs(4));
        // Untouched fields keep their defaults
        assert_eq!(config.typing_rebroadcast_ms, 3_000);
        assert_eq!(config.command_queue_limit, 128);
    }

    #[test]
    fn config_missing_fields_use_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn zero_page_size_rejected() {
        let config = EngineConfig::default().with_page_size(0);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "page_size", .. }));
    }

    #[test]
    fn from_file_reads_and_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "send_timeout_ms = 0").unwrap();

        let err = EngineConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("send_timeout_ms"));
    }

    #[test]
    fn from_file_reports_path() {
        let err = EngineConfig::from_file(Path::new("/nonexistent/engine.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
        assert!(err.to_string().contains("/nonexistent/engine.toml"));
    }

    #[test]
    fn builders() {
        let config = EngineConfig::default()
            .with_send_timeout(Duration::from_secs(1))
            .with_typing_ttl(Duration::from_secs(2))
            .with_command_queue_limit(4);
        assert_eq!(config.send_timeout_ms, 1000);
        assert_eq!(config.typing_rebroadcast_ms, 2000);
        assert_eq!(config.command_queue_limit, 4);
    }

    #[test]
    fn close_timeout_defaults_and_rejects_zero() {
        let config: EngineConfig = toml::from_str("close_timeout_ms = 500").unwrap();
        assert_eq!(config.close_timeout(), Duration::from_millis(500));
        assert_eq!(config.confirmed_send_memory, 512);

        let err = EngineConfig::default()
            .with_close_timeout(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "close_timeout_ms", .. }));
    }
}

//! Engine configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;
use crate::recovery::RetryPolicy;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the local store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// API base URL, endpoints are appended to it
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Bearer token attached to every request
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_ms: default_request_timeout(),
            auth_token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Full refresh interval in seconds
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// Failures kept in the sync status
    #[serde(default = "default_status_error_limit")]
    pub status_error_limit: usize,

    /// Finished drains kept in the sync history
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Event bus buffer per subscriber
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval(),
            status_error_limit: default_status_error_limit(),
            history_limit: default_history_limit(),
            event_capacity: default_event_capacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Recovery tick interval in seconds
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: u32,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Failures after which an operation waits for an operator
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Automatic retries for unclassified failures
    #[serde(default = "default_unknown_retry_limit")]
    pub unknown_retry_limit: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            base_delay_ms: default_base_delay(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay(),
            max_attempts: default_max_attempts(),
            unknown_retry_limit: default_unknown_retry_limit(),
        }
    }
}

// Defaults
fn default_data_dir() -> PathBuf { PathBuf::from("./menu-sync-data") }
fn default_base_url() -> String { "http://localhost:5000/api".to_string() }
fn default_request_timeout() -> u64 { 10_000 }
fn default_refresh_interval() -> u64 { 300 }
fn default_status_error_limit() -> usize { 20 }
fn default_history_limit() -> usize { 50 }
fn default_event_capacity() -> usize { 256 }
fn default_tick_interval() -> u64 { 30 }
fn default_base_delay() -> u64 { 1_000 }
fn default_backoff_factor() -> u32 { 2 }
fn default_max_delay() -> u64 { 60_000 }
fn default_max_attempts() -> u32 { 5 }
fn default_unknown_retry_limit() -> u32 { 2 }

impl Config {
    /// Load from a TOML file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            info!(path = %path.display(), "Config file not found, using defaults");
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("server.base_url is empty".into()));
        }
        if self.server.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("server.request_timeout_ms must be positive".into()));
        }
        if self.sync.refresh_interval_secs == 0 || self.recovery.tick_interval_secs == 0 {
            return Err(ConfigError::Invalid("intervals must be positive".into()));
        }
        if self.recovery.max_attempts == 0 {
            return Err(ConfigError::Invalid("recovery.max_attempts must be positive".into()));
        }
        if self.recovery.base_delay_ms > self.recovery.max_delay_ms {
            return Err(ConfigError::Invalid(
                "recovery.base_delay_ms exceeds recovery.max_delay_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.server.request_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.sync.refresh_interval_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.recovery.tick_interval_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay_ms: self.recovery.base_delay_ms,
            factor: self.recovery.backoff_factor,
            max_delay_ms: self.recovery.max_delay_ms,
            max_attempts: self.recovery.max_attempts,
            unknown_retry_limit: self.recovery.unknown_retry_limit,
        }
    }
}

//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/eventship/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/eventship/` (~/.config/eventship/)
//! - Data: `$XDG_DATA_HOME/eventship/` (~/.local/share/eventship/)
//! - State/Logs: `$XDG_STATE_HOME/eventship/` (~/.local/state/eventship/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Write key and data plane location
    #[serde(default)]
    pub client: ClientConfig,

    /// Flush policy and batch size limits
    #[serde(default)]
    pub queue: QueueConfig,

    /// Retry delay policy for failed uploads
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Storage location overrides
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Data plane connection settings
#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    /// Source write key issued by the data plane
    pub write_key: Option<String>,

    /// Data plane base URL (e.g., `https://dataplane.example.com`)
    pub data_plane_url: Option<String>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            write_key: None,
            data_plane_url: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ClientConfig {
    /// Check if both the write key and the data plane URL are present
    pub fn is_ready(&self) -> bool {
        self.write_key.is_some() && self.data_plane_url.is_some()
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        self.checked_write_key()?;

        match self.data_plane_url.as_deref() {
            None => Err(Error::Config(
                "client.data_plane_url is required".to_string(),
            )),
            Some(url) if !(url.starts_with("http://") || url.starts_with("https://")) => {
                Err(Error::Config(format!(
                    "client.data_plane_url must be an http(s) URL, got {:?}",
                    url
                )))
            }
            Some(_) => Ok(()),
        }
    }

    /// The write key, if present and usable as a directory name
    pub fn checked_write_key(&self) -> Result<&str> {
        match self.write_key.as_deref() {
            None => Err(Error::Config("client.write_key is required".to_string())),
            Some(key) if key.trim().is_empty() => Err(Error::Config(
                "client.write_key must not be empty".to_string(),
            )),
            Some(key) if key.contains(['/', '\\']) => Err(Error::Config(
                "client.write_key must not contain path separators".to_string(),
            )),
            Some(key) if key.contains(',') => Err(Error::Config(
                "client.write_key must not contain commas".to_string(),
            )),
            Some(key) => Ok(key),
        }
    }

    /// Request timeout as a `Duration`
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_request_timeout() -> u64 {
    30
}

/// Flush policy and batch size settings
///
/// Out-of-range policy values are not rejected here; each flush policy
/// falls back to its own default when handed an unusable value.
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Number of events that triggers a flush (1..=100)
    #[serde(default = "default_flush_at")]
    pub flush_at: u32,

    /// Interval between time-based flushes in milliseconds
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Flush once when the queue starts
    #[serde(default = "default_true")]
    pub startup_flush: bool,

    /// Largest accepted serialized event in bytes
    #[serde(default = "default_max_event_bytes")]
    pub max_event_bytes: usize,

    /// Size at which the open batch is closed before the next append
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            flush_at: default_flush_at(),
            flush_interval_ms: default_flush_interval_ms(),
            startup_flush: true,
            max_event_bytes: default_max_event_bytes(),
            max_batch_bytes: default_max_batch_bytes(),
        }
    }
}

impl QueueConfig {
    /// Validate size limits
    pub fn validate(&self) -> Result<()> {
        if self.max_event_bytes == 0 {
            return Err(Error::Config(
                "queue.max_event_bytes must be greater than 0".to_string(),
            ));
        }
        if self.max_batch_bytes < self.max_event_bytes {
            return Err(Error::Config(
                "queue.max_batch_bytes must be at least queue.max_event_bytes".to_string(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn default_flush_at() -> u32 {
    30
}

pub(crate) fn default_flush_interval_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_max_event_bytes() -> usize {
    32 * 1024
}

fn default_max_batch_bytes() -> usize {
    500 * 1024
}

/// Exponential backoff settings for retryable upload failures
#[derive(Debug, Deserialize, Clone)]
pub struct BackoffConfig {
    /// First retry delay in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Growth factor applied per attempt
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Upper bound on a single delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Add random jitter in `[0, delay)` to each delay
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: true,
        }
    }
}

pub(crate) fn default_base_delay_ms() -> u64 {
    3_000
}

pub(crate) fn default_multiplier() -> f64 {
    2.0
}

pub(crate) fn default_max_delay_ms() -> u64 {
    30 * 60 * 1_000
}

/// Storage location overrides
#[derive(Debug, Deserialize, Default, Clone)]
pub struct StorageConfig {
    /// Root directory for batch files (defaults to the XDG data dir)
    pub directory: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.queue.validate()?;
        Ok(config)
    }

    /// Root directory holding one storage directory per write key
    pub fn storage_root(&self) -> PathBuf {
        self.storage
            .directory
            .clone()
            .unwrap_or_else(Self::data_dir)
    }

    /// Storage directory for a write key
    ///
    /// `$XDG_DATA_HOME/eventship/<write_key>/` unless `[storage] directory` is set
    pub fn storage_dir(&self, write_key: &str) -> PathBuf {
        self.storage_root().join(write_key)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/eventship/config.toml` (~/.config/eventship/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("eventship").join("config.toml")
    }

    /// Returns the data directory path (batch storage root)
    ///
    /// `$XDG_DATA_HOME/eventship/` (~/.local/share/eventship/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("eventship")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/eventship/` (~/.local/state/eventship/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("eventship")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/eventship/eventship.log` (~/.local/state/eventship/eventship.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("eventship.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}

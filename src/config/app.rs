//! Application configuration structures.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::collector::backoff::{
    DEFAULT_BASE_DELAY, DEFAULT_JITTER, DEFAULT_MAX_DELAY, DEFAULT_MAX_RETRIES,
    DEFAULT_MAX_RETRY_AFTER,
};
use crate::collector::{BackoffPolicy, FleetUpConfig};
use crate::storage::{DEFAULT_FILE_PREFIX, DEFAULT_STATE_FILE, FileRotation, StorageBuilder};

use super::validation::{ConfigError, expand_env_vars, parse_interval, require, validate_http_url};

// =============================================================================
// Constants
// =============================================================================

/// Default collection interval (5 minutes).
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);

/// Minimum collection interval (1 second).
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Default data directory.
pub const DEFAULT_DATA_DIR: &str = "data";

fn default_interval() -> Duration {
    DEFAULT_INTERVAL
}

fn default_run_immediately() -> bool {
    true
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_base_delay() -> Duration {
    DEFAULT_BASE_DELAY
}

fn default_max_delay() -> Duration {
    DEFAULT_MAX_DELAY
}

fn default_jitter() -> f64 {
    DEFAULT_JITTER
}

fn default_max_retry_after() -> Duration {
    DEFAULT_MAX_RETRY_AFTER
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_DIR)
}

fn default_file_prefix() -> String {
    DEFAULT_FILE_PREFIX.to_string()
}

/// Interval as integer seconds or a humantime string.
mod interval_serde {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        humantime_serde::serialize(value, serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => parse_interval(&text).map_err(serde::de::Error::custom),
        }
    }
}

// =============================================================================
// Collection Configuration
// =============================================================================

/// Retry settings for a single fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first failed attempt (default: 5).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry (default: 1s).
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    /// Cap of the exponential delay (default: 60s).
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Symmetric jitter ratio in `[0, 1)` (default: 0.2).
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Longest server `Retry-After` honoured as-is (default: 15m).
    #[serde(default = "default_max_retry_after", with = "humantime_serde")]
    pub max_retry_after: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: DEFAULT_JITTER,
            max_retry_after: DEFAULT_MAX_RETRY_AFTER,
        }
    }
}

impl RetryConfig {
    /// Build the backoff policy described by these settings.
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.base_delay, self.max_delay, self.max_retries)
            .with_jitter(self.jitter)
            .with_max_retry_after(self.max_retry_after)
    }
}

/// Scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Time between cycle starts (default: 300s). Integer seconds or `5m`.
    #[serde(default = "default_interval", with = "interval_serde")]
    pub interval: Duration,

    /// Run the first cycle at startup instead of one interval later (default: true).
    #[serde(default = "default_run_immediately")]
    pub run_immediately: bool,

    /// Fetch retry settings.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            run_immediately: true,
            retry: RetryConfig::default(),
        }
    }
}

// =============================================================================
// Storage Configuration
// =============================================================================

/// Dataset and cursor locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding dataset files (default: "data").
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Dataset file name prefix (default: "gps_data").
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,

    /// `daily` (default) for one file per UTC day, `none` for a single file.
    #[serde(default)]
    pub rotation: FileRotation,

    /// Cursor state file (default: `<data_dir>/collector_state.json`).
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            file_prefix: default_file_prefix(),
            rotation: FileRotation::default(),
            state_file: None,
        }
    }
}

impl StorageConfig {
    /// Effective cursor state file path.
    pub fn state_path(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join(DEFAULT_STATE_FILE))
    }

    /// Storage builder for these settings.
    pub fn builder(&self) -> StorageBuilder {
        StorageBuilder::new(&self.data_dir)
            .file_prefix(&self.file_prefix)
            .rotation(self.rotation)
            .state_file(self.state_path())
    }
}

// =============================================================================
// Log Configuration
// =============================================================================

/// Log verbosity.
///
/// Accepts the conventional names case-insensitively; `WARNING` and
/// `CRITICAL` map onto `warn` and `error` filters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, EnumString, Display, AsRefStr)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    #[strum(to_string = "WARNING", serialize = "WARN")]
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error | Self::Critical => "error",
        }
    }
}

impl Serialize for LogLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_ref())
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse()
            .map_err(|_| serde::de::Error::custom(format!("unknown log level '{raw}'")))
    }
}

/// Log output format.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    /// Verbosity (default: INFO). `RUST_LOG` takes precedence when set.
    #[serde(default)]
    pub level: LogLevel,

    /// Output format (default: text).
    #[serde(default)]
    pub format: LogFormat,
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// FleetUp API connection.
    #[serde(default)]
    pub api: FleetUpConfig,

    /// Scheduling and retry.
    #[serde(default)]
    pub collection: CollectionConfig,

    /// Dataset and cursor storage.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging.
    #[serde(default)]
    pub log: LogConfig,
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config = Self::from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a YAML file without validating it, expanding
    /// `${VAR}` / `${VAR:-default}` references first.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse YAML text, expanding environment references.
    ///
    /// # Errors
    /// Returns `ConfigError::ParseError` on malformed YAML.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(content);
        if expanded.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(&expanded)?)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require("api.account_id (FLEETUP_ACCOUNT_ID)", &self.api.account_id)?;
        require("api.secret_key (FLEETUP_SECRET_KEY)", &self.api.secret_key)?;
        require("api.api_key (FLEETUP_API_KEY)", &self.api.api_key)?;
        require("api.base_url (FLEETUP_BASE_URL)", &self.api.base_url)?;
        validate_http_url("api.base_url", &self.api.base_url)?;

        if self.api.request_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "api.request_timeout must be positive".to_string(),
            ));
        }

        if self.collection.interval < MIN_INTERVAL {
            return Err(ConfigError::ValidationError(format!(
                "collection.interval must be at least {}s, got {:?}",
                MIN_INTERVAL.as_secs(),
                self.collection.interval
            )));
        }

        let retry = &self.collection.retry;
        if !(retry.jitter.is_finite() && (0.0..1.0).contains(&retry.jitter)) {
            return Err(ConfigError::ValidationError(format!(
                "collection.retry.jitter must be in [0, 1), got {}",
                retry.jitter
            )));
        }
        if retry.base_delay > retry.max_delay {
            return Err(ConfigError::ValidationError(format!(
                "collection.retry.base_delay ({:?}) exceeds max_delay ({:?})",
                retry.base_delay, retry.max_delay
            )));
        }

        let prefix = &self.storage.file_prefix;
        require("storage.file_prefix", prefix)?;
        if prefix.contains(['/', '\\']) {
            return Err(ConfigError::ValidationError(format!(
                "storage.file_prefix must be a plain file name, got '{prefix}'"
            )));
        }

        Ok(())
    }
}

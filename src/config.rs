//! Configuration module for the GPS collector.
//!
//! Provides YAML-based configuration loading and validation for:
//! - FleetUp API credentials and endpoint
//! - Collection interval and retry policy
//! - Dataset and cursor storage locations
//! - Log level and format
//!
//! String values may reference environment variables as `${VAR}` or
//! `${VAR:-default}`. Command-line flags and environment variables override
//! file values before validation (see the binary).

mod app;
mod validation;

pub use app::{
    AppConfig, CollectionConfig, LogConfig, LogFormat, LogLevel, RetryConfig, StorageConfig,
};
pub use validation::{ConfigError, expand_env_vars, parse_duration, parse_interval};

// Re-export constants
pub use app::{DEFAULT_DATA_DIR, DEFAULT_INTERVAL, MIN_INTERVAL};

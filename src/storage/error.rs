//! Storage-specific error types.
//!
//! Dataset and cursor operations return [`StorageError`] on failure. A
//! [`DataError`] describes a single malformed location record; it never fails
//! a whole batch.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem operation failed (disk full, permission denied, ...).
    #[error("io error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// CSV encoding or decoding failed.
    #[error("csv error on '{}': {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Existing dataset file was written with a different column layout.
    #[error("dataset file '{}' has unexpected header: {found}", path.display())]
    SchemaMismatch { path: PathBuf, found: String },
}

impl StorageError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn csv(path: &Path, source: csv::Error) -> Self {
        Self::Csv {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A location record that cannot be stored.
#[derive(Debug, Clone, Error)]
pub enum DataError {
    /// Payload could not be decoded into a record at all.
    #[error("malformed record ({reason}): {payload}")]
    Malformed { reason: String, payload: String },

    /// Record decoded but violates a field constraint.
    #[error("invalid record for vehicle '{vehicle_id}' at {timestamp}: {reason}")]
    Invalid {
        vehicle_id: String,
        timestamp: DateTime<Utc>,
        reason: String,
    },
}

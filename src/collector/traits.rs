//! Core collector traits and types.

use std::time::Duration;

use thiserror::Error;

use crate::storage::{Cursor, DataError, LocationRecord, StorageError};

/// Errors returned by a [`LocationSource`] fetch.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Network failure, timeout or 5xx; worth retrying.
    #[error("transient fetch error: {message}")]
    Transient { message: String },

    /// Rate limited (HTTP 429); honour `retry_after` when the server sent one.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Rejected credentials or a non-retryable request; stops the service.
    #[error("fatal fetch error: {message}")]
    Fatal { message: String },
}

impl FetchError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Classification consumed by the backoff policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient { .. } => ErrorKind::Transient,
            Self::RateLimited { retry_after, .. } => ErrorKind::RateLimited {
                retry_after: *retry_after,
            },
            Self::Fatal { .. } => ErrorKind::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

/// Retry-relevant classification of a fetch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    RateLimited { retry_after: Option<Duration> },
    Fatal,
}

/// Errors that end the collection loop.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// The location source reported a non-retryable failure.
    #[error("fatal API error: {0}")]
    Fatal(FetchError),

    /// Storage could not be initialised.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Collector configuration is unusable.
    #[error("config error: {0}")]
    Config(String),
}

/// One page of fetched locations.
///
/// `records` are ordered by timestamp ascending. `rejected` holds entries the
/// source could not decode; they are logged and dropped by the cycle.
#[derive(Debug, Default)]
pub struct LocationPage {
    pub records: Vec<LocationRecord>,
    pub rejected: Vec<DataError>,
    /// Pagination token for the next fetch, if the source supports one.
    pub next_cursor: Option<Cursor>,
}

impl LocationPage {
    pub fn new(records: Vec<LocationRecord>) -> Self {
        Self {
            records,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.rejected.is_empty()
    }
}

/// A remote source of vehicle locations.
///
/// Implementations own their credentials and authentication. A fetch
/// returning an empty page is a normal outcome, not an error.
#[async_trait::async_trait]
pub trait LocationSource: Send + Sync {
    /// Identifier used in logs.
    fn name(&self) -> &str;

    /// Fetch locations collected after `cursor` (everything available if `None`).
    async fn fetch_locations(&self, cursor: Option<&Cursor>) -> Result<LocationPage, FetchError>;
}

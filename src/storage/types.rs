//! Core data types for the storage layer.
//!
//! - [`LocationRecord`]: One vehicle position observation
//! - [`DedupKey`]: `(vehicle id, timestamp)` identity of an observation
//! - [`Cursor`]: Resume position of the collection loop
//! - [`WriteReport`]: Outcome of a dataset append
//! - [`FileRotation`]: How records are spread across dataset files

use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::storage::DataError;

/// Column header of every dataset file, in order.
pub const DATASET_HEADER: [&str; 6] = [
    "vehicle_id",
    "timestamp",
    "latitude",
    "longitude",
    "speed",
    "heading",
];

/// A single vehicle location observation.
///
/// Records are immutable once built. The timestamp is always truncated to
/// whole seconds so that two observations of the same instant share a
/// [`DedupKey`].
///
/// # Example
///
/// ```
/// use gps_collector::LocationRecord;
/// use chrono::{TimeZone, Utc};
///
/// let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
/// let record = LocationRecord::new("truck-7", ts, 52.52, 13.405).with_speed(48.0);
/// assert_eq!(record.vehicle_id(), "truck-7");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    vehicle_id: String,
    timestamp: DateTime<Utc>,
    latitude: f64,
    longitude: f64,
    speed: Option<f64>,
    heading: Option<f64>,
}

impl LocationRecord {
    /// Create a record without speed or heading.
    pub fn new(
        vehicle_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        latitude: f64,
        longitude: f64,
    ) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            timestamp: timestamp.trunc_subsecs(0),
            latitude,
            longitude,
            speed: None,
            heading: None,
        }
    }

    /// Set the ground speed.
    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    /// Set the heading in degrees.
    pub fn with_heading(mut self, heading: f64) -> Self {
        self.heading = Some(heading);
        self
    }

    pub fn vehicle_id(&self) -> &str {
        &self.vehicle_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    pub fn speed(&self) -> Option<f64> {
        self.speed
    }

    pub fn heading(&self) -> Option<f64> {
        self.heading
    }

    /// Deduplication key of this observation.
    pub fn key(&self) -> DedupKey {
        DedupKey {
            vehicle_id: self.vehicle_id.clone(),
            timestamp: self.timestamp.timestamp(),
        }
    }

    /// Check field constraints (WGS84 ranges, finite numbers, non-empty id
    /// without control characters).
    ///
    /// # Errors
    /// Returns `DataError::Invalid` describing the first violated constraint.
    pub fn validate(&self) -> Result<(), DataError> {
        let reason = if self.vehicle_id.trim().is_empty() {
            Some("vehicle id is empty".to_string())
        } else if self.vehicle_id.chars().any(char::is_control) {
            Some(format!("vehicle id {:?} contains control characters", self.vehicle_id))
        } else if !self.latitude.is_finite() || self.latitude.abs() > 90.0 {
            Some(format!("latitude {} out of range", self.latitude))
        } else if !self.longitude.is_finite() || self.longitude.abs() > 180.0 {
            Some(format!("longitude {} out of range", self.longitude))
        } else if self.speed.is_some_and(|s| !s.is_finite()) {
            Some("speed is not a finite number".to_string())
        } else if self.heading.is_some_and(|h| !h.is_finite()) {
            Some("heading is not a finite number".to_string())
        } else {
            None
        };

        match reason {
            Some(reason) => Err(DataError::Invalid {
                vehicle_id: self.vehicle_id.clone(),
                timestamp: self.timestamp,
                reason,
            }),
            None => Ok(()),
        }
    }
}

/// Natural identity of an observation: vehicle id plus timestamp in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    vehicle_id: String,
    timestamp: i64,
}

/// Position marker for resuming collection.
///
/// `Token` is an opaque pagination token handed out by the API. `Since`
/// is the time-window fallback: fetch everything since the start of the
/// last successful cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Cursor {
    Token { value: String },
    Since { at: DateTime<Utc> },
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token { value } => write!(f, "token:{value}"),
            Self::Since { at } => write!(f, "since:{}", at.to_rfc3339()),
        }
    }
}

/// Outcome of appending one batch to the dataset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteReport {
    /// Records appended to storage.
    pub written: usize,
    /// Records skipped because their key was already stored.
    pub duplicates: usize,
}

/// Dataset file layout.
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
pub enum FileRotation {
    /// Single `<prefix>.csv` file.
    None,
    /// One `<prefix>_<YYYYMMDD>.csv` file per UTC day of the record timestamp.
    #[default]
    Daily,
}

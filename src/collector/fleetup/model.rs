//! FleetUp wire types and per-entry record parsing.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::storage::{DataError, LocationRecord};

/// Epoch values above this are taken as milliseconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Longest payload excerpt kept in a [`DataError::Malformed`].
const PAYLOAD_EXCERPT_LEN: usize = 200;

/// Naive timestamp layout used by some FleetUp accounts (taken as UTC).
const NAIVE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Response of `GET token`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TokenResponse {
    pub token: String,
    /// Expiry as epoch seconds (or milliseconds).
    pub expire_time: i64,
}

impl TokenResponse {
    pub(crate) fn expires_at(&self) -> Option<DateTime<Utc>> {
        from_epoch(self.expire_time)
    }
}

/// Response of `POST gpsdata/device-last-location`.
///
/// Entries stay raw so that one bad entry cannot fail the whole batch.
#[derive(Debug, Deserialize)]
pub(crate) struct LocationsResponse {
    #[serde(default)]
    pub data: Option<Vec<Value>>,
}

/// One entry of the `data` array.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceLocation {
    #[serde(default)]
    dev_id: Option<Value>,
    #[serde(default, deserialize_with = "lenient_f64")]
    lat: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    lng: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    speed: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    direction: Option<f64>,
    #[serde(default, alias = "gpsDate", alias = "utcTime", alias = "timestamp")]
    gps_time: Option<Value>,
}

/// Parse one `data` entry.
///
/// Entries without a GPS time are stamped with `received_at`.
pub(crate) fn parse_entry(
    entry: Value,
    received_at: DateTime<Utc>,
) -> Result<LocationRecord, DataError> {
    let location: DeviceLocation =
        serde_json::from_value(entry.clone()).map_err(|e| DataError::Malformed {
            reason: e.to_string(),
            payload: excerpt(&entry),
        })?;

    let malformed = |reason: &str| DataError::Malformed {
        reason: reason.to_string(),
        payload: excerpt(&entry),
    };

    let vehicle_id = match location.dev_id {
        Some(Value::String(id)) if !id.trim().is_empty() => id.trim().to_string(),
        Some(Value::Number(id)) => id.to_string(),
        _ => return Err(malformed("missing devId")),
    };
    let latitude = location.lat.ok_or_else(|| malformed("missing lat"))?;
    let longitude = location.lng.ok_or_else(|| malformed("missing lng"))?;
    let timestamp = match location.gps_time {
        None | Some(Value::Null) => received_at,
        Some(value) => parse_time(&value).ok_or_else(|| malformed("unparseable gpsTime"))?,
    };

    let mut record = LocationRecord::new(vehicle_id, timestamp, latitude, longitude);
    if let Some(speed) = location.speed {
        record = record.with_speed(speed);
    }
    if let Some(heading) = location.direction {
        record = record.with_heading(heading);
    }
    Ok(record)
}

/// Epoch seconds/milliseconds, RFC 3339, or `YYYY-MM-DD HH:MM:SS` (UTC).
fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(from_epoch),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(epoch) = s.parse::<i64>() {
                return from_epoch(epoch);
            }
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Some(ts.with_timezone(&Utc));
            }
            NaiveDateTime::parse_from_str(s, NAIVE_TIME_FORMAT)
                .ok()
                .map(|naive| naive.and_utc())
        }
        _ => None,
    }
}

fn from_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value.abs() >= EPOCH_MILLIS_THRESHOLD {
        Utc.timestamp_millis_opt(value).single()
    } else {
        Utc.timestamp_opt(value, 0).single()
    }
}

fn excerpt(entry: &Value) -> String {
    let text = entry.to_string();
    match text.char_indices().nth(PAYLOAD_EXCERPT_LEN) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text,
    }
}

/// Accept a JSON number, a numeric string, or null.
fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid number '{s}'"))),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected number, found {other}"
        ))),
    }
}

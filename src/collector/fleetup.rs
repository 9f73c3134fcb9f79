//! FleetUp location source.
//!
//! Authenticates with an account id, secret and API key, caches the issued
//! token until it expires, and polls the device-last-location endpoint.

mod client;
mod model;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use client::FleetUpClient;

/// Default per-request timeout (30 seconds).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

/// Connection settings for the FleetUp API.
#[derive(Clone, Serialize, Deserialize)]
pub struct FleetUpConfig {
    /// FleetUp account identifier (`acctId`).
    #[serde(default)]
    pub account_id: String,
    /// Account secret used for the token handshake.
    #[serde(default)]
    pub secret_key: String,
    /// Value of the `x-api-key` header.
    #[serde(default)]
    pub api_key: String,
    /// API root, e.g. `https://api.fleetup.net/v1/`.
    #[serde(default)]
    pub base_url: String,
    /// Per-request timeout (default: 30s).
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for FleetUpConfig {
    fn default() -> Self {
        Self::new("", "", "", "")
    }
}

impl FleetUpConfig {
    pub fn new(
        account_id: impl Into<String>,
        secret_key: impl Into<String>,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            secret_key: secret_key.into(),
            api_key: api_key.into(),
            base_url: base_url.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Set the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl std::fmt::Debug for FleetUpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetUpConfig")
            .field("account_id", &self.account_id)
            .field("secret_key", &"<redacted>")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

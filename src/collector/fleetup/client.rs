//! FleetUp HTTP client implementing [`LocationSource`].

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use url::Url;

use super::FleetUpConfig;
use super::model::{LocationsResponse, TokenResponse, parse_entry};
use crate::collector::{CollectorError, FetchError, LocationPage, LocationSource};
use crate::storage::{Cursor, LocationRecord};

/// Header carrying the API key on every request.
const API_KEY_HEADER: &str = "x-api-key";

/// Header carrying the session token on data requests.
const TOKEN_HEADER: &str = "token";

/// Response bodies are logged up to this many characters.
const LOG_BODY_LIMIT: usize = 500;

/// A token is refreshed this many seconds before it expires.
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 30;

/// API endpoints, relative to the base URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Token,
    Locations,
}

impl Endpoint {
    fn path(self) -> &'static str {
        match self {
            Self::Token => "token",
            Self::Locations => "gpsdata/device-last-location",
        }
    }
}

#[derive(Debug, Clone)]
struct AuthToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl AuthToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now + chrono::Duration::seconds(TOKEN_EXPIRY_MARGIN_SECS) < self.expires_at
    }
}

/// FleetUp API client.
///
/// Holds the cached session token; the scheduler is its only caller, so
/// token refreshes never race.
pub struct FleetUpClient {
    config: FleetUpConfig,
    base_url: Url,
    client: Client,
    token: Mutex<Option<AuthToken>>,
}

impl FleetUpClient {
    /// Create a new client.
    ///
    /// # Errors
    /// Returns `CollectorError::Config` if the base URL is invalid or the HTTP
    /// client cannot be built.
    pub fn new(config: FleetUpConfig) -> Result<Self, CollectorError> {
        let base_url = normalize_base_url(&config.base_url)?;
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| CollectorError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            config,
            base_url,
            client,
            token: Mutex::new(None),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, endpoint: Endpoint) -> Result<Url, FetchError> {
        self.base_url
            .join(endpoint.path())
            .map_err(|e| FetchError::fatal(format!("invalid endpoint URL: {e}")))
    }

    fn cached_token(&self) -> Option<AuthToken> {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store_token(&self, token: Option<AuthToken>) {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = token;
    }

    /// Return a fresh session token, requesting a new one when needed.
    async fn session_token(&self) -> Result<String, FetchError> {
        if let Some(token) = self.cached_token()
            && token.is_fresh(Utc::now())
        {
            return Ok(token.value);
        }

        tracing::info!("FleetUp token missing or expired, requesting a new one");
        self.refresh_token().await
    }

    async fn refresh_token(&self) -> Result<String, FetchError> {
        let url = self.endpoint(Endpoint::Token)?;
        let response = self
            .client
            .get(url.clone())
            .query(&[
                ("acctId", self.config.account_id.as_str()),
                ("secret", self.config.secret_key.as_str()),
            ])
            .header(API_KEY_HEADER, &self.config.api_key)
            .send()
            .await
            .map_err(|e| transport_error(Endpoint::Token, &e))?;

        let body = self.read_body(Endpoint::Token, "GET", &url, response).await?;
        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| FetchError::transient(format!("invalid token response: {e}")))?;
        if parsed.token.is_empty() {
            return Err(FetchError::fatal("token endpoint returned an empty token"));
        }
        let expires_at = parsed
            .expires_at()
            .ok_or_else(|| FetchError::transient("token response has an invalid expireTime"))?;

        tracing::info!(expires_at = %expires_at, "Refreshed FleetUp token");
        let value = parsed.token;
        self.store_token(Some(AuthToken {
            value: value.clone(),
            expires_at,
        }));
        Ok(value)
    }

    /// Read the body, log the exchange and map non-success statuses.
    async fn read_body(
        &self,
        endpoint: Endpoint,
        method: &str,
        url: &Url,
        response: Response,
    ) -> Result<String, FetchError> {
        let status = response.status();
        let retry_after = retry_after(response.headers(), Utc::now());
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(endpoint, &e))?;

        if tracing::enabled!(tracing::Level::DEBUG) {
            let logged = match endpoint {
                Endpoint::Token => "<redacted>".to_string(),
                Endpoint::Locations => truncate(&body, LOG_BODY_LIMIT),
            };
            tracing::debug!(
                method,
                url = %without_query(url),
                status = status.as_u16(),
                body = %logged,
                "FleetUp API exchange"
            );
        }

        if status.is_success() {
            return Ok(body);
        }

        if endpoint == Endpoint::Locations && status == StatusCode::UNAUTHORIZED {
            self.store_token(None);
        }
        Err(classify_status(endpoint, status, retry_after))
    }
}

impl std::fmt::Debug for FleetUpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetUpClient")
            .field("config", &self.config)
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl LocationSource for FleetUpClient {
    fn name(&self) -> &str {
        "fleetup"
    }

    /// The endpoint reports each device's latest position and has no
    /// pagination, so the cursor is ignored and `next_cursor` is `None`.
    async fn fetch_locations(&self, _cursor: Option<&Cursor>) -> Result<LocationPage, FetchError> {
        let token = self.session_token().await?;
        let url = self.endpoint(Endpoint::Locations)?;
        let response = self
            .client
            .post(url.clone())
            .header(API_KEY_HEADER, &self.config.api_key)
            .header(TOKEN_HEADER, &token)
            .json(&serde_json::json!({ "acctId": self.config.account_id }))
            .send()
            .await
            .map_err(|e| transport_error(Endpoint::Locations, &e))?;

        let body = self
            .read_body(Endpoint::Locations, "POST", &url, response)
            .await?;
        let received_at = Utc::now();
        let parsed: LocationsResponse = serde_json::from_str(&body)
            .map_err(|e| FetchError::transient(format!("invalid locations response: {e}")))?;

        let mut page = LocationPage::default();
        for entry in parsed.data.unwrap_or_default() {
            match parse_entry(entry, received_at) {
                Ok(record) => page.records.push(record),
                Err(e) => page.rejected.push(e),
            }
        }
        page.records.sort_by_key(LocationRecord::timestamp);

        tracing::debug!(
            records = page.records.len(),
            rejected = page.rejected.len(),
            "Fetched device locations"
        );
        Ok(page)
    }
}

/// Parse the base URL and make sure relative joins land below it.
fn normalize_base_url(raw: &str) -> Result<Url, CollectorError> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| CollectorError::Config(format!("Invalid FleetUp base URL '{raw}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(CollectorError::Config(format!(
            "FleetUp base URL must be http(s), got '{}'",
            url.scheme()
        )));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn transport_error(endpoint: Endpoint, error: &reqwest::Error) -> FetchError {
    let message = format!("{} request failed: {error}", endpoint.path());
    if error.is_builder() {
        FetchError::fatal(message)
    } else {
        FetchError::transient(message)
    }
}

fn classify_status(
    endpoint: Endpoint,
    status: StatusCode,
    retry_after: Option<Duration>,
) -> FetchError {
    let message = format!("{} returned {status}", endpoint.path());
    match (endpoint, status.as_u16()) {
        (_, 429) => FetchError::rate_limited(message, retry_after),
        (_, 408) | (_, 500..=599) => FetchError::transient(message),
        (Endpoint::Locations, 401) => FetchError::transient(format!("{message}, token discarded")),
        (Endpoint::Token, 401 | 403) => FetchError::fatal(format!("{message}, credentials rejected")),
        _ => FetchError::fatal(message),
    }
}

/// `Retry-After` as delta-seconds or an HTTP date.
fn retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

fn without_query(url: &Url) -> Url {
    let mut url = url.clone();
    url.set_query(None);
    url
}

fn truncate(body: &str, limit: usize) -> String {
    match body.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}...", &body[..cut]),
        None => body.to_string(),
    }
}

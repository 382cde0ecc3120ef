use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult, GeocodeError};

const MAX_BACKOFF_EXPONENT: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// One raw provider call, no retries and no pacing.
#[async_trait]
pub trait GeocodeProvider: Send + Sync {
    async fn lookup(&self, query: &str) -> Result<Coordinates, GeocodeError>;
}

/// Minimum spacing between consecutive provider calls for a whole run.
pub struct RateLimiter {
    min_interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_tick: AsyncMutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub async fn wait(&self) {
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.max_attempts, config.backoff_base())
    }

    /// Delay after the `attempt`-th failure (1-based): base, 2x, 4x, ...
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        self.base_backoff
            .checked_mul(1_u32 << exponent)
            .unwrap_or(Duration::MAX)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(250))
    }
}

#[derive(Clone)]
pub struct GeocodingClient {
    provider: Arc<dyn GeocodeProvider>,
    region_suffix: String,
    retry: RetryPolicy,
}

impl GeocodingClient {
    pub fn new(
        provider: Arc<dyn GeocodeProvider>,
        region_suffix: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            region_suffix: region_suffix.into().trim().to_string(),
            retry,
        }
    }

    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        let api_key = config.geocoding_api_key.clone().ok_or_else(|| {
            AppError::Config("GEOCODING_API_KEY (or GMAPS_KEY) must be set to geocode".into())
        })?;
        let provider = HttpGeocoder::new(&config.geocoding_endpoint, api_key, config.http_timeout())?;
        Ok(Self::new(
            Arc::new(provider),
            config.region_suffix.clone(),
            RetryPolicy::from_config(config),
        ))
    }

    pub fn qualified_query(&self, query: &str) -> String {
        let query = query.trim();
        if self.region_suffix.is_empty() {
            query.to_string()
        } else {
            format!("{query}, {}", self.region_suffix)
        }
    }

    /// Geocodes `query` with the region suffix applied. Every attempt waits on
    /// the caller's `limiter`; only transient failures are retried.
    pub async fn geocode(
        &self,
        query: &str,
        limiter: &RateLimiter,
    ) -> Result<Coordinates, GeocodeError> {
        let qualified = self.qualified_query(query);
        let mut attempt = 0;
        loop {
            attempt += 1;
            limiter.wait().await;
            match self.provider.lookup(&qualified).await {
                Ok(coordinates) => {
                    debug!(query = %qualified, attempt, "geocoded");
                    return Ok(coordinates);
                }
                Err(err) if err.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff_delay(attempt);
                    warn!(
                        %err,
                        attempt,
                        query = %qualified,
                        "geocode attempt failed; retrying after {:?}",
                        delay
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Google Geocoding API (JSON flavour).
pub struct HttpGeocoder {
    http: Client,
    endpoint: Url,
    api_key: SecretString,
}

impl HttpGeocoder {
    pub fn new(endpoint: &str, api_key: SecretString, timeout: Duration) -> AppResult<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|err| AppError::Config(format!("invalid geocoding endpoint: {err}")))?;
        let http = Client::builder()
            .user_agent(concat!("listing-geocoder/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint,
            api_key,
        })
    }
}

#[async_trait]
impl GeocodeProvider for HttpGeocoder {
    async fn lookup(&self, query: &str) -> Result<Coordinates, GeocodeError> {
        #[derive(Deserialize)]
        struct Response {
            status: String,
            #[serde(default)]
            results: Vec<ResponseResult>,
            error_message: Option<String>,
        }

        #[derive(Deserialize)]
        struct ResponseResult {
            geometry: ResponseGeometry,
        }

        #[derive(Deserialize)]
        struct ResponseGeometry {
            location: ResponseLocation,
        }

        #[derive(Deserialize)]
        struct ResponseLocation {
            lat: f64,
            lng: f64,
        }

        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("address", query)
            .append_pair("key", self.api_key.expose_secret());

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| GeocodeError::Transient(format!("request failed: {}", err.without_url())))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, query));
        }

        let parsed: Response = response.json().await.map_err(|err| {
            GeocodeError::Transient(format!("undecodable response: {}", err.without_url()))
        })?;
        let detail = parsed.error_message.unwrap_or_else(|| parsed.status.clone());

        match parsed.status.as_str() {
            "OK" => parsed
                .results
                .into_iter()
                .next()
                .map(|result| Coordinates {
                    latitude: result.geometry.location.lat,
                    longitude: result.geometry.location.lng,
                })
                .ok_or_else(|| GeocodeError::NotFound(query.to_string())),
            "ZERO_RESULTS" | "INVALID_REQUEST" => Err(GeocodeError::NotFound(query.to_string())),
            "REQUEST_DENIED" | "OVER_DAILY_LIMIT" => Err(GeocodeError::Auth(detail)),
            _ => Err(GeocodeError::Transient(detail)),
        }
    }
}

fn classify_status(status: StatusCode, query: &str) -> GeocodeError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            GeocodeError::Auth(format!("provider responded {status}"))
        }
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            GeocodeError::Transient(format!("provider responded {status}"))
        }
        s if s.is_server_error() => GeocodeError::Transient(format!("provider responded {s}")),
        _ => GeocodeError::NotFound(query.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    struct ScriptedProvider {
        responses: Mutex<Vec<Result<Coordinates, GeocodeError>>>,
        queries: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        // Responses are served front to back.
        fn new(mut responses: Vec<Result<Coordinates, GeocodeError>>) -> Arc<Self> {
            responses.reverse();
            Arc::new(Self {
                responses: Mutex::new(responses),
                queries: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.queries.lock().len()
        }
    }

    #[async_trait]
    impl GeocodeProvider for ScriptedProvider {
        async fn lookup(&self, query: &str) -> Result<Coordinates, GeocodeError> {
            self.queries.lock().push(query.to_string());
            self.responses
                .lock()
                .pop()
                .unwrap_or_else(|| Err(GeocodeError::NotFound(query.to_string())))
        }
    }

    fn point() -> Coordinates {
        Coordinates {
            latitude: 40.71,
            longitude: -74.0,
        }
    }

    fn client(provider: Arc<ScriptedProvider>, attempts: u32) -> GeocodingClient {
        GeocodingClient::new(provider, "New York, NY", RetryPolicy::new(attempts, Duration::ZERO))
    }

    #[tokio::test]
    async fn appends_region_suffix() {
        let provider = ScriptedProvider::new(vec![Ok(point())]);
        let client = client(provider.clone(), 3);
        let limiter = RateLimiter::new(Duration::ZERO);

        client.geocode(" 123 MAIN ST ", &limiter).await.unwrap();
        assert_eq!(provider.queries.lock()[0], "123 MAIN ST, New York, NY");

        let bare = GeocodingClient::new(provider.clone(), "  ", RetryPolicy::default());
        assert_eq!(bare.qualified_query("1 A ST"), "1 A ST");
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let provider = ScriptedProvider::new(vec![
            Err(GeocodeError::Transient("503".into())),
            Ok(point()),
        ]);
        let client = client(provider.clone(), 3);
        let limiter = RateLimiter::new(Duration::ZERO);

        let result = client.geocode("1 A ST", &limiter).await.unwrap();
        assert_eq!(result, point());
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let provider = ScriptedProvider::new(vec![
            Err(GeocodeError::Transient("timeout".into())),
            Err(GeocodeError::Transient("timeout".into())),
            Err(GeocodeError::Transient("timeout".into())),
            Ok(point()),
        ]);
        let client = client(provider.clone(), 3);
        let limiter = RateLimiter::new(Duration::ZERO);

        let err = client.geocode("1 A ST", &limiter).await.unwrap_err();
        assert!(matches!(err, GeocodeError::Transient(_)));
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn does_not_retry_not_found_or_auth() {
        let provider = ScriptedProvider::new(vec![
            Err(GeocodeError::NotFound("1 A ST".into())),
            Err(GeocodeError::Auth("denied".into())),
        ]);
        let client = client(provider.clone(), 3);
        let limiter = RateLimiter::new(Duration::ZERO);

        let first = client.geocode("1 A ST", &limiter).await.unwrap_err();
        assert!(matches!(first, GeocodeError::NotFound(_)));
        assert_eq!(provider.calls(), 1);

        let second = client.geocode("2 B ST", &limiter).await.unwrap_err();
        assert!(matches!(second, GeocodeError::Auth(_)));
        assert_eq!(provider.calls(), 2);
    }

    #[test]
    fn backoff_is_deterministic_and_capped() {
        let policy = RetryPolicy::new(3, Duration::from_millis(250));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(250));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(500));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(1000));
        assert_eq!(policy.backoff_delay(40), Duration::from_millis(250 * 64));
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[test]
    fn huge_backoff_saturates_instead_of_overflowing() {
        let base = Duration::from_secs(u64::MAX / 2 + 1);
        let policy = RetryPolicy::new(3, base);
        assert_eq!(policy.backoff_delay(1), base);
        assert_eq!(policy.backoff_delay(2), Duration::MAX);
        assert_eq!(policy.backoff_delay(40), Duration::MAX);
    }

    #[tokio::test]
    async fn rate_limiter_spaces_consecutive_calls() {
        let limiter = RateLimiter::new(Duration::from_millis(30));
        let started = Instant::now();
        limiter.wait().await;
        limiter.wait().await;
        limiter.wait().await;
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn classifies_http_statuses() {
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, "q"),
            GeocodeError::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, "q"),
            GeocodeError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "q"),
            GeocodeError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "q"),
            GeocodeError::NotFound(_)
        ));
    }
}

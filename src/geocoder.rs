use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{AdminMetadata, Candidate, Coordinates};
use crate::normalize::first_segment;

pub const GOOGLE: &str = "google";
pub const NOMINATIM: &str = "nominatim";

#[async_trait]
pub trait GeocodeProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` is a definitive miss; `Err` is retried.
    async fn geocode(&self, query: &str) -> AppResult<Option<Candidate>>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_step: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.geocoder_max_retries.max(1),
            backoff_step: Duration::from_millis(config.geocoder_backoff_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step: Duration::from_millis(500),
        }
    }
}

/// One provider call as seen by the audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderAttempt {
    pub provider: String,
    pub query: String,
    pub tries: u32,
    pub candidate: Option<Candidate>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExternalOutcome {
    pub winner: Option<Candidate>,
    pub attempts: Vec<ProviderAttempt>,
}

/// Primary provider first, then the rate-limited secondary, then the
/// secondary again with only the leading segment of the query.
pub struct ExternalGeocoder {
    primary: Option<Arc<dyn GeocodeProvider>>,
    secondary: Option<Arc<dyn GeocodeProvider>>,
    limiter: RateLimiter,
    policy: RetryPolicy,
    jitter_rng: Mutex<StdRng>,
}

impl ExternalGeocoder {
    pub fn new(
        primary: Option<Arc<dyn GeocodeProvider>>,
        secondary: Option<Arc<dyn GeocodeProvider>>,
        qps: u32,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            primary,
            secondary,
            limiter: RateLimiter::new(qps),
            policy,
            jitter_rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        let timeout = Duration::from_secs(config.geocoder_timeout_secs);
        let primary = match config.google_api_key.clone() {
            Some(key) => Some(Arc::new(GoogleGeocoder::new(
                config.google_endpoint.clone(),
                key,
                timeout,
            )?) as Arc<dyn GeocodeProvider>),
            None => {
                debug!(target: "geocoder", "no google api key configured; primary provider disabled");
                None
            }
        };
        let secondary: Arc<dyn GeocodeProvider> = Arc::new(NominatimGeocoder::new(
            config.nominatim_endpoint.clone(),
            &config.user_agent,
            timeout,
        )?);
        Ok(Self::new(
            primary,
            Some(secondary),
            config.geocoder_rate_limit_qps,
            RetryPolicy::from_config(config),
        ))
    }

    pub fn disabled() -> Self {
        Self::new(None, None, 1, RetryPolicy::default())
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.jitter_rng = Mutex::new(rng);
        self
    }

    pub fn provider_names(&self) -> Vec<&'static str> {
        self.primary
            .iter()
            .chain(self.secondary.iter())
            .map(|provider| provider.name())
            .collect()
    }

    pub async fn geocode(&self, normalized: &str) -> ExternalOutcome {
        let mut outcome = ExternalOutcome::default();

        if let Some(primary) = &self.primary {
            let attempt = self.call_with_retry(primary.as_ref(), normalized, false).await;
            if let Some(winner) = record(&mut outcome, attempt) {
                outcome.winner = Some(winner);
                return outcome;
            }
        }

        let Some(secondary) = &self.secondary else {
            return outcome;
        };
        let attempt = self.call_with_retry(secondary.as_ref(), normalized, true).await;
        if let Some(winner) = record(&mut outcome, attempt) {
            outcome.winner = Some(winner);
            return outcome;
        }

        if let Some(city) = first_segment(normalized).filter(|city| *city != normalized) {
            debug!(target: "geocoder", query = normalized, city, "retrying with city-level query");
            let attempt = self.call_with_retry(secondary.as_ref(), city, true).await;
            if let Some(winner) = record(&mut outcome, attempt) {
                outcome.winner = Some(winner);
            }
        }
        outcome
    }

    async fn call_with_retry(
        &self,
        provider: &dyn GeocodeProvider,
        query: &str,
        rate_limited: bool,
    ) -> ProviderAttempt {
        let mut tries = 0;
        loop {
            tries += 1;
            if rate_limited {
                self.limiter.acquire().await;
            }
            match provider.geocode(query).await {
                Ok(candidate) => {
                    return ProviderAttempt {
                        provider: provider.name().to_string(),
                        query: query.to_string(),
                        tries,
                        candidate,
                        error: None,
                    }
                }
                Err(err) if tries < self.policy.max_attempts => {
                    let delay = self.backoff_delay(tries);
                    warn!(
                        target: "geocoder",
                        provider = provider.name(),
                        ?err,
                        tries,
                        "geocode request failed; retrying after {:?}",
                        delay
                    );
                    sleep(delay).await;
                }
                Err(err) => {
                    warn!(
                        target: "geocoder",
                        provider = provider.name(),
                        ?err,
                        tries,
                        "geocode request failed; giving up on provider"
                    );
                    return ProviderAttempt {
                        provider: provider.name().to_string(),
                        query: query.to_string(),
                        tries,
                        candidate: None,
                        error: Some(err.to_string()),
                    };
                }
            }
        }
    }

    fn backoff_delay(&self, tries: u32) -> Duration {
        let step = self.policy.backoff_step;
        let base = step * tries;
        let jitter_cap = step.as_millis() as u64 / 4;
        if jitter_cap == 0 {
            return base;
        }
        let jitter_ms = self.jitter_rng.lock().gen_range(0..=jitter_cap);
        base + Duration::from_millis(jitter_ms)
    }
}

fn record(outcome: &mut ExternalOutcome, attempt: ProviderAttempt) -> Option<Candidate> {
    let winner = attempt.candidate.clone();
    outcome.attempts.push(attempt);
    winner
}

/// Token bucket holding at most one second of allowance.
pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    bucket: AsyncMutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

impl RateLimiter {
    pub fn new(qps: u32) -> Self {
        let rate = f64::from(qps.max(1));
        Self {
            rate,
            capacity: rate,
            bucket: AsyncMutex::new(Bucket {
                tokens: rate,
                refilled_at: Instant::now(),
            }),
        }
    }

    pub fn qps(&self) -> u32 {
        self.rate as u32
    }

    pub async fn acquire(&self) {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        if bucket.tokens < 1.0 {
            let missing = 1.0 - bucket.tokens;
            sleep(Duration::from_secs_f64(missing / self.rate)).await;
            self.refill(&mut bucket);
        }
        bucket.tokens = (bucket.tokens - 1.0).max(0.0);
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity);
        bucket.refilled_at = now;
    }
}

fn http_client(timeout: Duration, user_agent: Option<&str>) -> AppResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if let Some(agent) = user_agent {
        builder = builder.user_agent(agent);
    }
    Ok(builder.build()?)
}

pub struct GoogleGeocoder {
    http: reqwest::Client,
    endpoint: String,
    api_key: SecretString,
}

impl GoogleGeocoder {
    pub fn new(endpoint: String, api_key: SecretString, timeout: Duration) -> AppResult<Self> {
        Ok(Self {
            http: http_client(timeout, None)?,
            endpoint,
            api_key,
        })
    }
}

fn google_confidence(location_type: Option<&str>) -> f64 {
    match location_type {
        Some("ROOFTOP") => 0.95,
        Some("RANGE_INTERPOLATED") => 0.85,
        Some("GEOMETRIC_CENTER") => 0.75,
        _ => 0.6,
    }
}

#[async_trait]
impl GeocodeProvider for GoogleGeocoder {
    fn name(&self) -> &'static str {
        GOOGLE
    }

    async fn geocode(&self, query: &str) -> AppResult<Option<Candidate>> {
        #[derive(Deserialize)]
        struct Response {
            status: String,
            #[serde(default)]
            results: Vec<ResponseResult>,
            error_message: Option<String>,
        }

        #[derive(Deserialize)]
        struct ResponseResult {
            formatted_address: Option<String>,
            geometry: Geometry,
            #[serde(default)]
            address_components: Vec<AddressComponent>,
        }

        #[derive(Deserialize)]
        struct Geometry {
            location: Location,
            location_type: Option<String>,
        }

        #[derive(Deserialize)]
        struct Location {
            lat: f64,
            lng: f64,
        }

        #[derive(Deserialize)]
        struct AddressComponent {
            long_name: String,
            #[serde(default)]
            types: Vec<String>,
        }

        let response = self
            .http
            .get(&self.endpoint)
            .query(&[("address", query), ("key", self.api_key.expose_secret())])
            .send()
            .await?
            .error_for_status()?;
        let parsed: Response = response.json().await?;

        match parsed.status.as_str() {
            "OK" => {}
            "ZERO_RESULTS" => return Ok(None),
            other => {
                return Err(AppError::provider(
                    GOOGLE,
                    format!(
                        "status {other}: {}",
                        parsed.error_message.unwrap_or_default()
                    ),
                ))
            }
        }

        let Some(result) = parsed.results.into_iter().next() else {
            return Ok(None);
        };
        let coordinates = Coordinates::new(result.geometry.location.lat, result.geometry.location.lng);
        if !coordinates.is_valid() {
            return Err(AppError::provider(GOOGLE, "response carried invalid coordinates"));
        }

        let component = |kind: &str| {
            result
                .address_components
                .iter()
                .find(|c| c.types.iter().any(|t| t == kind))
                .map(|c| c.long_name.clone())
        };
        let admin = AdminMetadata {
            country: component("country"),
            admin1: component("administrative_area_level_1"),
            admin2: component("administrative_area_level_2"),
        };

        Ok(Some(
            Candidate::new(
                coordinates,
                google_confidence(result.geometry.location_type.as_deref()),
                GOOGLE,
            )
            .with_display_name(result.formatted_address.clone())
            .with_admin(admin),
        ))
    }
}

pub struct NominatimGeocoder {
    http: reqwest::Client,
    endpoint: String,
}

impl NominatimGeocoder {
    pub fn new(endpoint: String, user_agent: &str, timeout: Duration) -> AppResult<Self> {
        Ok(Self {
            http: http_client(timeout, Some(user_agent))?,
            endpoint,
        })
    }
}

fn nominatim_confidence(importance: Option<f64>) -> f64 {
    importance
        .map(|value| (0.5 + 0.4 * value).clamp(0.5, 0.9))
        .unwrap_or(0.6)
}

#[async_trait]
impl GeocodeProvider for NominatimGeocoder {
    fn name(&self) -> &'static str {
        NOMINATIM
    }

    async fn geocode(&self, query: &str) -> AppResult<Option<Candidate>> {
        #[derive(Deserialize)]
        struct Place {
            lat: String,
            lon: String,
            display_name: Option<String>,
            importance: Option<f64>,
            address: Option<Address>,
        }

        #[derive(Deserialize)]
        struct Address {
            country: Option<String>,
            state: Option<String>,
            county: Option<String>,
        }

        let response = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("q", query),
                ("format", "jsonv2"),
                ("limit", "1"),
                ("addressdetails", "1"),
            ])
            .send()
            .await?
            .error_for_status()?;
        let places: Vec<Place> = response.json().await?;

        let Some(place) = places.into_iter().next() else {
            return Ok(None);
        };
        let lat = place
            .lat
            .parse::<f64>()
            .map_err(|err| AppError::provider(NOMINATIM, format!("bad latitude: {err}")))?;
        let lng = place
            .lon
            .parse::<f64>()
            .map_err(|err| AppError::provider(NOMINATIM, format!("bad longitude: {err}")))?;
        let coordinates = Coordinates::new(lat, lng);
        if !coordinates.is_valid() {
            return Err(AppError::provider(NOMINATIM, "response carried invalid coordinates"));
        }
        let admin = place
            .address
            .map(|address| AdminMetadata {
                country: address.country,
                admin1: address.state,
                admin2: address.county,
            })
            .unwrap_or_default();

        Ok(Some(
            Candidate::new(coordinates, nominatim_confidence(place.importance), NOMINATIM)
                .with_display_name(place.display_name)
                .with_admin(admin),
        ))
    }
}

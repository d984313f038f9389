//! Rate-limited retrying network access, enrichment clients and the
//! idempotent archive writer for the harvest pipeline.

mod archive;
mod enrich;

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

pub use archive::{
    ArchiveError, ArchiveSummary, ArchiveWriter, MemoryOpportunityStore, OpportunityStore,
    PgOpportunityStore, RowCountPolicy, StoreError, DEFAULT_BATCH_SIZE, MAX_BATCH_SIZE,
};
pub use enrich::{
    passes_confidence, AddressApiGeocoder, AddressContext, AddressRefinement, AddressRefiner,
    ChatCompletionRefiner, GeocodeMatch, GeocodingService, DEFAULT_GEOCODER_URL, DEFAULT_MIN_SCORE,
};

pub const CRATE_NAME: &str = "harvest-storage";

/// Enforces a minimum spacing between consecutive calls on one client.
#[derive(Debug)]
pub struct Throttle {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Sleeps `max(0, min_interval - elapsed)` then stamps the reservation.
    /// The lock is held across the sleep so concurrent callers queue up.
    pub async fn acquire(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts, the first one included.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl RetryConfig {
    /// Linear backoff: `retry_delay × attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.retry_delay.saturating_mul(attempt.max(1))
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub name: String,
    pub min_interval: Duration,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "http".to_string(),
            min_interval: Duration::from_millis(500),
            timeout: Duration::from_secs(30),
            user_agent: None,
            retry: RetryConfig::default(),
        }
    }
}

/// Why a single attempt failed. Every variant is retried by [`RateLimitedClient::execute`].
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Other(String),
}

impl AttemptError {
    pub fn status(&self) -> Option<u16> {
        match self {
            AttemptError::Status { status, .. } => Some(*status),
            AttemptError::RateLimited { .. } => Some(StatusCode::TOO_MANY_REQUESTS.as_u16()),
            AttemptError::Request(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: AttemptError,
    },
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
}

impl FetchError {
    /// HTTP status of the last attempt, when it got that far.
    pub fn last_status(&self) -> Option<u16> {
        match self {
            FetchError::Exhausted { last, .. } => last.status(),
            FetchError::Client(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

/// One instance per external dependency: owns its throttle state and retry policy.
#[derive(Debug)]
pub struct RateLimitedClient {
    name: String,
    http: reqwest::Client,
    throttle: Throttle,
    retry: RetryConfig,
}

impl RateLimitedClient {
    pub fn new(config: ClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let http = builder.build().map_err(FetchError::Client)?;
        Ok(Self {
            name: config.name,
            http,
            throttle: Throttle::new(config.min_interval),
            retry: config.retry,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn retry_config(&self) -> RetryConfig {
        self.retry
    }

    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    /// Runs `operation` under the throttle, retrying every failure up to
    /// `max_retries` attempts. A 429 with `Retry-After` waits exactly that
    /// long; anything else waits `retry_delay × attempt`.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let attempts = self.retry.max_retries.max(1);
        let mut attempt = 1;
        loop {
            self.throttle.acquire().await;
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(client = %self.name, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if attempt >= attempts => {
                    warn!(client = %self.name, attempts, error = %err, "retries exhausted");
                    return Err(FetchError::Exhausted { attempts, last: err });
                }
                Err(err) => {
                    let delay = match &err {
                        AttemptError::RateLimited {
                            retry_after: Some(wait),
                        } => *wait,
                        _ => self.retry.delay_for_attempt(attempt),
                    };
                    warn!(
                        client = %self.name,
                        attempt,
                        max_retries = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    pub async fn get_text(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let http = &self.http;
        self.execute(move || async move {
            let resp = check_status(http.get(url).send().await?)?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let body = resp.text().await?;
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        })
        .instrument(info_span!("http_fetch", client = %self.name, url))
        .await
    }

    pub async fn get_json<T>(&self, url: &str, query: &[(String, String)]) -> Result<T, FetchError>
    where
        T: DeserializeOwned,
    {
        let http = &self.http;
        self.execute(move || async move {
            let resp = check_status(http.get(url).query(query).send().await?)?;
            Ok(resp.json::<T>().await?)
        })
        .instrument(info_span!("http_fetch", client = %self.name, url))
        .await
    }

    pub async fn post_json<B, T>(
        &self,
        url: &str,
        body: &B,
        bearer: Option<&str>,
    ) -> Result<T, FetchError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let http = &self.http;
        self.execute(move || async move {
            let mut request = http.post(url).json(body);
            if let Some(token) = bearer {
                request = request.bearer_auth(token);
            }
            let resp = check_status(request.send().await?)?;
            Ok(resp.json::<T>().await?)
        })
        .instrument(info_span!("http_fetch", client = %self.name, url))
        .await
    }
}

/// Maps non-2xx responses to attempt errors, reading `Retry-After` on 429.
pub fn check_status(resp: Response) -> Result<Response, AttemptError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(AttemptError::RateLimited {
            retry_after: parse_retry_after(resp.headers()),
        });
    }
    Err(AttemptError::Status {
        status: status.as_u16(),
        url: resp.url().to_string(),
    })
}

/// `Retry-After` as delta-seconds or an HTTP date.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    (at - Utc::now()).to_std().ok()
}

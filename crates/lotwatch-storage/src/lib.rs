//! Durable item store + HTTP fetch utilities for lotwatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, RETRY_AFTER};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

mod memory;
mod postgres;
mod store;

pub use memory::MemoryItemStore;
pub use postgres::PgItemStore;
pub use store::{ItemFilter, ItemStore, StoreError};

pub const CRATE_NAME: &str = "lotwatch-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

impl RetryDisposition {
    /// Marketplaces answer overload with 429 or 5xx; everything else is final.
    pub fn for_status(status: StatusCode) -> Self {
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Self::Retryable
        } else {
            Self::NonRetryable
        }
    }

    pub fn for_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::Retryable
        } else {
            Self::NonRetryable
        }
    }
}

/// Exponential retry schedule. A server-sent `Retry-After` replaces the
/// computed delay but is still capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt: usize, retry_after: Option<Duration>) -> Duration {
        let computed = || {
            let factor = 1u32.checked_shl(attempt as u32).unwrap_or(u32::MAX);
            self.base_delay.saturating_mul(factor)
        };
        retry_after.unwrap_or_else(computed).min(self.max_delay)
    }
}

/// Only the delta-seconds form of `Retry-After` is honoured.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    /// Request rate applied to sources without their own entry in `source_rates`.
    pub default_requests_per_second: Option<f64>,
    pub source_rates: HashMap<String, f64>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 2,
            backoff: BackoffPolicy::default(),
            default_requests_per_second: None,
            source_rates: HashMap::new(),
        }
    }
}

/// Spaces requests to one source at least `min_interval` apart. Callers
/// reserve the next free slot under the lock and sleep outside it.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    /// `None` for a zero, negative or non-finite rate, meaning unpaced.
    pub fn per_second(requests_per_second: f64) -> Option<Self> {
        if !requests_per_second.is_finite() || requests_per_second <= 0.0 {
            return None;
        }
        Some(Self {
            min_interval: Duration::from_secs_f64(1.0 / requests_per_second),
            next_slot: Mutex::new(None),
        })
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub async fn wait(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = next.map_or(now, |reserved| reserved.max(now));
            *next = Some(slot + self.min_interval);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|source| FetchError::Decode {
            url: self.final_url.clone(),
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not valid json: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("fetcher is shutting down")]
    Closed,
}

/// Shared HTTP client: retry with backoff, a global and a per-source
/// concurrency cap, and optional per-source request pacing.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    default_rate: Option<f64>,
    source_rates: HashMap<String, f64>,
    pacers: Mutex<HashMap<String, Option<Arc<RequestPacer>>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/html;q=0.9, */*;q=0.8"),
        );
        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building http client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            default_rate: config.default_requests_per_second,
            source_rates: config.source_rates,
            pacers: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// The pacer shared by every request to `source_id`, if that source is paced.
    pub async fn pacer(&self, source_id: &str) -> Option<Arc<RequestPacer>> {
        let mut map = self.pacers.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| {
                self.source_rates
                    .get(source_id)
                    .copied()
                    .or(self.default_rate)
                    .and_then(RequestPacer::per_second)
                    .map(Arc::new)
            })
            .clone()
    }

    pub async fn get(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        self.send(run_id, source_id, url, |client| client.get(url))
            .await
    }

    pub async fn get_with_query<Q: Serialize + ?Sized>(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        query: &Q,
    ) -> Result<FetchedResponse, FetchError> {
        self.send(run_id, source_id, url, |client| client.get(url).query(query))
            .await
    }

    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        body: &B,
    ) -> Result<FetchedResponse, FetchError> {
        self.send(run_id, source_id, url, |client| client.post(url).json(body))
            .await
    }

    async fn send<F>(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        build: F,
    ) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.map_err(|_| FetchError::Closed)?;
        let pacer = self.pacer(source_id).await;

        let span = info_span!("http_fetch", %run_id, source_id, url);
        self.send_with_retry(pacer.as_deref(), build)
            .instrument(span)
            .await
    }

    async fn send_with_retry<F>(
        &self,
        pacer: Option<&RequestPacer>,
        build: F,
    ) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            if let Some(pacer) = pacer {
                pacer.wait().await;
            }
            let (disposition, server_delay, failure) = match build(&self.client).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        debug!(%status, bytes = body.len(), "fetched");
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }
                    (
                        RetryDisposition::for_status(status),
                        retry_after(resp.headers()),
                        FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        },
                    )
                }
                Err(err) => (RetryDisposition::for_error(&err), None, FetchError::Request(err)),
            };

            if disposition == RetryDisposition::NonRetryable || attempt >= self.backoff.max_retries {
                return Err(failure);
            }
            let delay = self.backoff.delay_for_attempt(attempt, server_delay);
            warn!(error = %failure, attempt, delay_ms = delay.as_millis() as u64, "retrying request");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

use crate::config::HttpConfig;
use rand::Rng;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tokio_retry::strategy::jitter;
use tokio_retry::RetryIf;
use tracing::{debug, warn};

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FetchError {
    /// Timeout, DNS, connection reset, truncated body.
    #[error("request error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("server error {status}: {body}")]
    Server { status: StatusCode, body: String },

    #[error("client error {status}: {body}")]
    Client { status: StatusCode, body: String },

    #[error("could not decode response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid request url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl FetchError {
    /// Connection-level faults and 5xx are worth another attempt; everything
    /// else is terminal for the request chain.
    pub fn is_retriable(&self) -> bool {
        matches!(self, FetchError::Transport(_) | FetchError::Server { .. })
    }
}

// ── Retry policy ──────────────────────────────────────────────────────────────

/// Bounded exponential backoff: `min_delay`, doubled after every failed
/// attempt, never above `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Delays slept between attempts; `max_attempts - 1` entries.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        let (min, max, with_jitter) = (self.min_delay, self.max_delay, self.jitter);
        (0..self.max_attempts.saturating_sub(1)).map(move |n| {
            let base = min.saturating_mul(1u32 << n.min(16)).min(max);
            if with_jitter { jitter(base) } else { base }
        })
    }

    pub fn is_retriable(&self, err: &FetchError) -> bool {
        err.is_retriable()
    }
}

// ── Request descriptor ────────────────────────────────────────────────────────

/// A GET request: target, headers and (possibly repeated) query parameters.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            query: Vec::new(),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn param(mut self, name: &str, value: impl ToString) -> Self {
        self.query.push((name.to_string(), value.to_string()));
        self
    }

    fn full_url(&self) -> Result<url::Url, FetchError> {
        Ok(url::Url::parse_with_params(&self.url, &self.query)?)
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

pub struct HttpClient {
    inner: reqwest::Client,
    policy: RetryPolicy,
}

impl HttpClient {
    pub fn new(config: &HttpConfig, policy: RetryPolicy) -> anyhow::Result<Self> {
        let inner = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            .build()?;

        Ok(Self { inner, policy })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Perform `req`, retrying transient failures per the policy, and decode
    /// the JSON body as `T`.
    pub async fn get_json<T: DeserializeOwned>(&self, req: &FetchRequest) -> Result<T, FetchError> {
        let url = req.full_url()?;
        let mut attempt = 0u32;

        let body = RetryIf::spawn(
            self.policy.delays(),
            || {
                attempt += 1;
                debug!("GET {} (attempt {})", req.url, attempt);
                self.send_once(url.clone(), &req.headers)
            },
            |err: &FetchError| {
                let retry = self.policy.is_retriable(err);
                if retry {
                    warn!("{} failed: {}; retrying", req.url, err);
                }
                retry
            },
        )
        .await?;

        Ok(serde_json::from_str(&body)?)
    }

    async fn send_once(&self, url: url::Url, headers: &[(String, String)]) -> Result<String, FetchError> {
        let mut builder = self.inner.get(url);
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let resp = builder.send().await?;
        let status = resp.status();
        let body = resp.text().await?;

        if status.is_server_error() {
            Err(FetchError::Server { status, body })
        } else if status.is_client_error() {
            Err(FetchError::Client { status, body })
        } else {
            Ok(body)
        }
    }
}

// ── Rate limiting ─────────────────────────────────────────────────────────────

/// Minimum spacing between consecutive requests to one provider, plus a
/// random jitter. One instance is shared by every task talking to that provider.
pub struct RateLimiter {
    interval: Duration,
    jitter_ms: u64,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(interval: Duration, jitter_ms: u64) -> Self {
        Self {
            interval,
            jitter_ms,
            next_slot: Mutex::new(None),
        }
    }

    /// Wait until this caller may send its next request.
    pub async fn wait(&self) {
        let jitter = if self.jitter_ms > 0 {
            Duration::from_millis(rand::rng().random_range(0..=self.jitter_ms))
        } else {
            Duration::ZERO
        };

        let mut slot = self.next_slot.lock().await;
        let now = Instant::now();
        if let Some(at) = *slot {
            if at > now {
                sleep(at - now).await;
            }
        }
        *slot = Some(Instant::now() + self.interval + jitter);
    }
}

//! HTTP fetch utilities and listing persistence for the scraping pipeline.

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

pub mod postgres;
pub mod store;

pub use postgres::PgListingStore;
pub use store::{ListingStore, MemoryListingStore, StoredCompany, UnresolvedLocation};

/// Hex SHA-256 of page content, used to notice when pagination stops producing new pages.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Fixed-delay retry policy: `max_attempts` tries in total, `delay` between them.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    pub fn attempts(&self) -> usize {
        self.max_attempts.max(1)
    }

    pub fn should_retry(&self, attempt_index: usize, disposition: RetryDisposition) -> bool {
        disposition == RetryDisposition::Retryable && attempt_index + 1 < self.attempts()
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed after {attempts} attempt(s): {source}")]
    Request {
        url: String,
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url} after {attempts} attempt(s)")]
    HttpStatus { status: u16, url: String, attempts: usize },
}

impl FetchError {
    pub fn attempts(&self) -> usize {
        match self {
            FetchError::Request { attempts, .. } | FetchError::HttpStatus { attempts, .. } => *attempts,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET `url` and return its body, retrying network-class failures on the fixed backoff.
    pub async fn fetch_text(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_text_inner(url).instrument(span).await
    }

    async fn fetch_text_inner(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let attempts = self.backoff.attempts();
        let mut attempt = 0;

        loop {
            let (disposition, err) = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if !status.is_success() {
                        (
                            classify_status(status),
                            FetchError::HttpStatus {
                                status: status.as_u16(),
                                url: final_url,
                                attempts: attempt + 1,
                            },
                        )
                    } else {
                        match resp.text().await {
                            Ok(body) => {
                                return Ok(FetchedResponse {
                                    status,
                                    final_url,
                                    body,
                                })
                            }
                            Err(err) => (
                                classify_reqwest_error(&err),
                                FetchError::Request {
                                    url: url.to_string(),
                                    attempts: attempt + 1,
                                    source: err,
                                },
                            ),
                        }
                    }
                }
                Err(err) => (
                    classify_reqwest_error(&err),
                    FetchError::Request {
                        url: url.to_string(),
                        attempts: attempt + 1,
                        source: err,
                    },
                ),
            };

            if !self.backoff.should_retry(attempt, disposition) {
                return Err(err);
            }
            warn!(attempt = attempt + 1, attempts, error = %err, "fetch attempt failed; retrying");
            tokio::time::sleep(self.backoff.delay).await;
            attempt += 1;
        }
    }
}

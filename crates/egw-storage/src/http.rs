use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::{StatusCode, Url};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

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
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Zero disables retries; a failed fetch surfaces immediately.
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Upper bound on in-flight requests across all hosts.
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some("Mozilla/5.0".to_string()),
            global_concurrency: 150,
            per_host_concurrency: 16,
            backoff: BackoffPolicy::default(),
        }
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
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("connection pool closed")]
    PoolClosed,
}

/// Shared HTTP client. One instance is built at startup and handed to every
/// component that talks to the network.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_host_limit: usize,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.per_host_concurrency.max(1));

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_host_limit: config.per_host_concurrency.max(1),
            per_host: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    /// Underlying client, for callers that need non-GET requests.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    async fn per_host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut map = self.per_host.lock().await;
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    /// GETs `url` under the global and per-host limits. Only http(s) urls are
    /// accepted.
    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let invalid = |reason: String| FetchError::InvalidUrl {
            url: url.to_string(),
            reason,
        };
        let parsed = Url::parse(url).map_err(|e| invalid(e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme {}", parsed.scheme())));
        }
        let host = parsed.host_str().unwrap_or_default().to_string();

        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::PoolClosed)?;
        let per_host = self.per_host_semaphore(&host).await;
        let _host = per_host.acquire().await.map_err(|_| FetchError::PoolClosed)?;

        let span = info_span!("http_fetch", host = %host, url);
        self.fetch_with_retries(parsed).instrument(span).await
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        Ok(self.fetch_bytes(url).await?.text())
    }

    /// Sleeps and returns true when another attempt is allowed.
    async fn wait_before_retry(&self, attempt: usize, disposition: RetryDisposition) -> bool {
        if attempt >= self.backoff.max_retries || disposition == RetryDisposition::NonRetryable {
            return false;
        }
        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
        true
    }

    async fn fetch_with_retries(&self, url: Url) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let err = match self.client.get(url.clone()).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();
                    return Ok(FetchedResponse {
                        status,
                        final_url,
                        body,
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    if self.wait_before_retry(attempt, classify_status(status)).await {
                        debug!(%status, attempt, "retrying after http status");
                        attempt += 1;
                        continue;
                    }
                    FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    }
                }
                Err(err) => {
                    if self.wait_before_retry(attempt, classify_reqwest_error(&err)).await {
                        debug!(error = %err, attempt, "retrying after request error");
                        attempt += 1;
                        continue;
                    }
                    FetchError::Request(err)
                }
            };
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn default_policy_does_not_retry() {
        assert_eq!(BackoffPolicy::default().max_retries, 0);
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[tokio::test]
    async fn invalid_url_is_rejected_before_any_request() {
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let err = fetcher.fetch_bytes("not a url").await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl { .. }));
        let err = fetcher.fetch_bytes("file:///etc/hosts").await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl { .. }));
    }
}

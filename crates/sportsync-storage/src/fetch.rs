//! Rate-limited outbound fetching, one independent throttle per source.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

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

/// Exponential backoff between collection attempts.
///
/// `max_attempts` counts every attempt including the first one.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub factor: u32,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            factor: 2,
            max_delay: Duration::from_secs(16),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let exponent = u32::try_from(attempt_index).unwrap_or(u32::MAX);
        let multiplier = self.factor.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(multiplier).min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error contacting {source_id}: {message}")]
    Network { source_id: String, message: String },
    #[error("request to {source_id} timed out after {timeout:?}")]
    Timeout { source_id: String, timeout: Duration },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Network { .. } | Self::Timeout { .. } => RetryDisposition::Retryable,
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }
}

/// Wire-level request execution. The production implementation is [`ReqwestTransport`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        source_id: &str,
        request: &FetchRequest,
        timeout: Duration,
    ) -> Result<FetchResponse, FetchError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);
        if let Some(user_agent) = user_agent {
            builder = builder.user_agent(user_agent.to_string());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    fn map_error(source_id: &str, timeout: Duration, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                source_id: source_id.to_string(),
                timeout,
            }
        } else {
            FetchError::Network {
                source_id: source_id.to_string(),
                message: err.to_string(),
            }
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        source_id: &str,
        request: &FetchRequest,
        timeout: Duration,
    ) -> Result<FetchResponse, FetchError> {
        let resp = self
            .client
            .get(&request.url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Self::map_error(source_id, timeout, e))?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let body = resp
            .bytes()
            .await
            .map_err(|e| Self::map_error(source_id, timeout, e))?
            .to_vec();

        Ok(FetchResponse {
            status: status.as_u16(),
            final_url,
            content_type,
            body,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub default_min_interval: Duration,
    pub source_intervals: HashMap<String, Duration>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            default_min_interval: Duration::from_secs(1),
            source_intervals: HashMap::new(),
        }
    }
}

#[derive(Debug)]
struct SourceThrottle {
    min_interval: Duration,
    last_sent: Mutex<Option<Instant>>,
}

impl SourceThrottle {
    /// Wait until `min_interval` has passed since the previous send, then record
    /// this send. Callers queue on the lock in arrival order; one cancelled while
    /// waiting leaves `last_sent` untouched, so the next caller moves up.
    async fn claim_send_slot(&self) {
        let mut last_sent = self.last_sent.lock().await;
        if let Some(previous) = *last_sent {
            tokio::time::sleep_until(previous + self.min_interval).await;
        }
        *last_sent = Some(Instant::now());
    }
}

pub struct RateLimitedClient {
    transport: Arc<dyn Transport>,
    timeout: Duration,
    default_min_interval: Duration,
    source_intervals: HashMap<String, Duration>,
    throttles: Mutex<HashMap<String, Arc<SourceThrottle>>>,
}

impl std::fmt::Debug for RateLimitedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedClient")
            .field("timeout", &self.timeout)
            .field("default_min_interval", &self.default_min_interval)
            .field("source_intervals", &self.source_intervals)
            .finish_non_exhaustive()
    }
}

impl RateLimitedClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(config.user_agent.as_deref())?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: HttpClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            timeout: config.timeout,
            default_min_interval: config.default_min_interval,
            source_intervals: config.source_intervals,
            throttles: Mutex::new(HashMap::new()),
        }
    }

    pub fn min_interval(&self, source_id: &str) -> Duration {
        self.source_intervals
            .get(source_id)
            .copied()
            .unwrap_or(self.default_min_interval)
    }

    async fn throttle_for(&self, source_id: &str) -> Arc<SourceThrottle> {
        let mut map = self.throttles.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| {
                Arc::new(SourceThrottle {
                    min_interval: self.min_interval(source_id),
                    last_sent: Mutex::new(None),
                })
            })
            .clone()
    }

    /// Send one request, first waiting out the source's minimum interval.
    pub async fn fetch(
        &self,
        run_id: Uuid,
        source_id: &str,
        request: &FetchRequest,
    ) -> Result<FetchResponse, FetchError> {
        let throttle = self.throttle_for(source_id).await;
        throttle.claim_send_slot().await;

        let span = info_span!("http_fetch", %run_id, source_id, url = %request.url);
        async {
            debug!("sending request");
            self.transport.send(source_id, request, self.timeout).await
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingTransport {
        latency: Duration,
        sends: Mutex<Vec<(String, Instant)>>,
    }

    impl RecordingTransport {
        fn with_latency(latency: Duration) -> Self {
            Self {
                latency,
                ..Default::default()
            }
        }

        async fn sends(&self) -> Vec<(String, Instant)> {
            self.sends.lock().await.clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(
            &self,
            source_id: &str,
            request: &FetchRequest,
            _timeout: Duration,
        ) -> Result<FetchResponse, FetchError> {
            self.sends
                .lock()
                .await
                .push((source_id.to_string(), Instant::now()));
            tokio::time::sleep(self.latency).await;
            Ok(FetchResponse {
                status: 200,
                final_url: request.url.clone(),
                content_type: None,
                body: b"[]".to_vec(),
            })
        }
    }

    fn client_with(intervals: &[(&str, u64)], transport: Arc<RecordingTransport>) -> RateLimitedClient {
        let mut config = HttpClientConfig::default();
        for (source, secs) in intervals {
            config
                .source_intervals
                .insert(source.to_string(), Duration::from_secs(*secs));
        }
        RateLimitedClient::with_transport(config, transport)
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(16));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_secs(16));
        assert_eq!(policy.delay_for_attempt(usize::MAX), Duration::from_secs(16));
    }

    #[test]
    fn fetch_errors_classify_retryability() {
        let network = FetchError::Network {
            source_id: "s".into(),
            message: "reset".into(),
        };
        let timeout = FetchError::Timeout {
            source_id: "s".into(),
            timeout: Duration::from_secs(30),
        };
        let missing = FetchError::HttpStatus {
            status: 404,
            url: "u".into(),
        };
        let throttled = FetchError::HttpStatus {
            status: 429,
            url: "u".into(),
        };
        assert_eq!(network.disposition(), RetryDisposition::Retryable);
        assert_eq!(timeout.disposition(), RetryDisposition::Retryable);
        assert_eq!(missing.disposition(), RetryDisposition::NonRetryable);
        assert_eq!(throttled.disposition(), RetryDisposition::Retryable);
    }

    #[tokio::test(start_paused = true)]
    async fn independent_sources_respect_their_own_intervals() {
        let transport = Arc::new(RecordingTransport::default());
        let client = Arc::new(client_with(&[("fast", 1), ("slow", 3)], transport.clone()));
        let start = Instant::now();
        let window = Duration::from_secs(10);

        let mut handles = Vec::new();
        for source in ["fast", "slow"] {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                let _ = tokio::time::timeout(window, async {
                    loop {
                        client
                            .fetch(Uuid::new_v4(), source, &FetchRequest::get("http://feed.test"))
                            .await
                            .unwrap();
                    }
                })
                .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let sends = transport.sends().await;
        let times = |source: &str| {
            sends
                .iter()
                .filter(|(s, at)| s == source && at.duration_since(start) < window)
                .map(|(_, at)| *at)
                .collect::<Vec<_>>()
        };
        let fast = times("fast");
        let slow = times("slow");
        assert!(fast.len() <= 10 && fast.len() >= 9, "fast sent {}", fast.len());
        assert!(slow.len() <= 4 && slow.len() >= 3, "slow sent {}", slow.len());
        for pair in fast.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= Duration::from_secs(1));
        }
        for pair in slow.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= Duration::from_secs(3));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slot_is_claimed_on_send_not_on_completion() {
        let transport = Arc::new(RecordingTransport::with_latency(Duration::from_secs(5)));
        let client = Arc::new(client_with(&[("feed", 1)], transport.clone()));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                client
                    .fetch(Uuid::new_v4(), "feed", &FetchRequest::get("http://feed.test"))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let offsets = transport
            .sends()
            .await
            .iter()
            .map(|(_, at)| at.duration_since(start).as_secs())
            .collect::<Vec<_>>();
        assert_eq!(offsets, vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_caller_hands_back_its_slot() {
        let transport = Arc::new(RecordingTransport::default());
        let client = client_with(&[("feed", 1)], transport.clone());
        let start = Instant::now();
        let request = FetchRequest::get("http://feed.test");

        client.fetch(Uuid::new_v4(), "feed", &request).await.unwrap();
        let cancelled = tokio::time::timeout(
            Duration::from_millis(500),
            client.fetch(Uuid::new_v4(), "feed", &request),
        )
        .await;
        assert!(cancelled.is_err());

        client.fetch(Uuid::new_v4(), "feed", &request).await.unwrap();
        let sends = transport.sends().await;
        assert_eq!(sends.len(), 2);
        assert_eq!(sends[1].1.duration_since(start), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_a_queued_caller_moves_the_next_one_up() {
        let transport = Arc::new(RecordingTransport::default());
        let client = Arc::new(client_with(&[("feed", 1)], transport.clone()));
        let start = Instant::now();
        let request = FetchRequest::get("http://feed.test");

        client.fetch(Uuid::new_v4(), "feed", &request).await.unwrap();
        let spawn_fetch = || {
            let client = Arc::clone(&client);
            let request = request.clone();
            tokio::spawn(async move { client.fetch(Uuid::new_v4(), "feed", &request).await })
        };
        let waiting = spawn_fetch();
        tokio::task::yield_now().await;
        let queued = spawn_fetch();

        tokio::time::sleep(Duration::from_millis(500)).await;
        waiting.abort();
        queued.await.unwrap().unwrap();

        let sends = transport.sends().await;
        assert_eq!(sends.len(), 2);
        assert_eq!(sends[1].1.duration_since(start), Duration::from_secs(1));
    }
}

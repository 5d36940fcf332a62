//! Run summaries delivered through an ordered chain of fallible channels.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use sportsync_core::{CollectionJob, CollectionResult, RunStatus};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Channel {
    Slack { webhook_url: String },
    Discord { webhook_url: String },
    Log,
}

impl Channel {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Slack { .. } => "slack",
            Self::Discord { .. } => "discord",
            Self::Log => "log",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyOn {
    #[default]
    All,
    Failures,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("{channel}: request failed: {message}")]
    Transport { channel: String, message: String },
    #[error("{channel}: endpoint answered {status}")]
    Rejected { channel: String, status: u16 },
}

#[async_trait]
pub trait NotifyStrategy: Send + Sync {
    fn channel(&self) -> &str;
    async fn notify(&self, subject: &str, body: &str) -> Result<(), NotifyError>;
}

#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotifyStrategy for LogNotifier {
    fn channel(&self) -> &str {
        "log"
    }

    async fn notify(&self, subject: &str, body: &str) -> Result<(), NotifyError> {
        info!(target: "sportsync::notify", subject, body, "run summary");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookFlavor {
    Slack,
    Discord,
}

/// Chat webhook delivery; Slack reads `text`, Discord reads `content`.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    flavor: WebhookFlavor,
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(flavor: WebhookFlavor, url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            flavor,
            url: url.into(),
            client,
        }
    }

    pub fn payload(&self, subject: &str, body: &str) -> serde_json::Value {
        let message = format!("*{subject}*\n{body}");
        match self.flavor {
            WebhookFlavor::Slack => json!({ "text": message }),
            WebhookFlavor::Discord => json!({ "content": message }),
        }
    }
}

#[async_trait]
impl NotifyStrategy for WebhookNotifier {
    fn channel(&self) -> &str {
        match self.flavor {
            WebhookFlavor::Slack => "slack",
            WebhookFlavor::Discord => "discord",
        }
    }

    async fn notify(&self, subject: &str, body: &str) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(&self.url)
            .timeout(Duration::from_secs(10))
            .json(&self.payload(subject, body))
            .send()
            .await
            .map_err(|e| NotifyError::Transport {
                channel: self.channel().to_string(),
                message: e.to_string(),
            })?;
        if !resp.status().is_success() {
            return Err(NotifyError::Rejected {
                channel: self.channel().to_string(),
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered_by: Option<String>,
    pub failures: Vec<String>,
}

#[derive(Clone, Default)]
pub struct NotificationChain {
    strategies: Vec<Arc<dyn NotifyStrategy>>,
    notify_on: NotifyOn,
}

impl std::fmt::Debug for NotificationChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let channels: Vec<&str> = self.strategies.iter().map(|s| s.channel()).collect();
        f.debug_struct("NotificationChain")
            .field("channels", &channels)
            .field("notify_on", &self.notify_on)
            .finish()
    }
}

impl NotificationChain {
    pub fn new(strategies: Vec<Arc<dyn NotifyStrategy>>, notify_on: NotifyOn) -> Self {
        Self {
            strategies,
            notify_on,
        }
    }

    pub fn from_channels(channels: &[Channel], notify_on: NotifyOn) -> Self {
        let client = reqwest::Client::new();
        let mut strategies: Vec<Arc<dyn NotifyStrategy>> = channels
            .iter()
            .map(|channel| -> Arc<dyn NotifyStrategy> {
                match channel {
                    Channel::Slack { webhook_url } => Arc::new(WebhookNotifier::new(
                        WebhookFlavor::Slack,
                        webhook_url,
                        client.clone(),
                    )),
                    Channel::Discord { webhook_url } => Arc::new(WebhookNotifier::new(
                        WebhookFlavor::Discord,
                        webhook_url,
                        client.clone(),
                    )),
                    Channel::Log => Arc::new(LogNotifier),
                }
            })
            .collect();
        if strategies.is_empty() {
            strategies.push(Arc::new(LogNotifier));
        }
        Self::new(strategies, notify_on)
    }

    /// Try each channel in order until one accepts the message.
    pub async fn deliver(&self, subject: &str, body: &str) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for strategy in &self.strategies {
            match strategy.notify(subject, body).await {
                Ok(()) => {
                    report.delivered_by = Some(strategy.channel().to_string());
                    break;
                }
                Err(err) => {
                    warn!(channel = strategy.channel(), error = %err, "notification channel failed");
                    report.failures.push(err.to_string());
                }
            }
        }
        if report.delivered_by.is_none() && !self.strategies.is_empty() {
            warn!(subject, "no notification channel accepted the message");
        }
        report
    }

    /// Returns `None` when the result is filtered out by `notify_on`.
    pub async fn notify_result(
        &self,
        job: &CollectionJob,
        result: &CollectionResult,
    ) -> Option<DeliveryReport> {
        if self.notify_on == NotifyOn::Failures && result.status == RunStatus::Success {
            return None;
        }
        let (subject, body) = render_summary(job, result);
        Some(self.deliver(&subject, &body).await)
    }
}

pub fn render_summary(job: &CollectionJob, result: &CollectionResult) -> (String, String) {
    let subject = format!("[sportsync] {} ({}): {}", job.name, job.job_id, result.status);
    let mut lines = vec![
        format!("run {}", result.run_id),
        format!(
            "{} {} from {} in {:.1}s",
            result.records_collected,
            job.record_type,
            job.source,
            result.elapsed().num_milliseconds() as f64 / 1000.0
        ),
    ];
    if !result.summary.is_empty() {
        let counters: Vec<String> = result
            .summary
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        lines.push(counters.join(" "));
    }
    lines.extend(result.errors.iter().map(|e| format!("- {e}")));
    (subject, lines.join("\n"))
}

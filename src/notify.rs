use crate::error::AppError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => f.write_str("warning"),
            Severity::Critical => f.write_str("critical"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub text: String,
    pub severity: Severity,
}

/// Outbound alert channel. Delivery is best-effort; callers log failures.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: &Alert) -> Result<(), AppError>;
}

/// Posts `{"text": ..., "severity": ...}` to a webhook (Slack-compatible).
pub struct WebhookNotifier {
    client: Client,
    url: url::Url,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(client: Client, url: &str) -> Result<Self, AppError> {
        let url = url::Url::parse(url)
            .map_err(|e| AppError::Config(format!("invalid webhook url '{url}': {e}")))?;
        Ok(Self {
            client,
            url,
            timeout: DEFAULT_NOTIFY_TIMEOUT,
        })
    }

    /// Bounds the whole POST, including waiting for the response.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, alert: &Alert) -> Result<(), AppError> {
        self.client
            .post(self.url.clone())
            .timeout(self.timeout)
            .json(alert)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

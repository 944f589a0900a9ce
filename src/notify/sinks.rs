//! Notification sink implementations.

use crate::models::FinalAssessment;
use crate::notify::Notifier;
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// In-process sink that forwards assessments over a channel.
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<FinalAssessment>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FinalAssessment>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, assessment: &FinalAssessment) -> Result<()> {
        self.sender
            .send(assessment.clone())
            .map_err(|_| anyhow::anyhow!("notification channel closed"))
    }
}

/// Writes one JSON document per line.
pub struct JsonlNotifier {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl JsonlNotifier {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    /// Append to a file, creating it if needed.
    pub fn append_to(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(Self::new(Box::new(file)))
    }
}

#[async_trait]
impl Notifier for JsonlNotifier {
    async fn notify(&self, assessment: &FinalAssessment) -> Result<()> {
        let line = serde_json::to_string(assessment)?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{}", line)?;
        writer.flush()?;
        Ok(())
    }
}

/// Posts the assessment JSON to an HTTP endpoint.
pub struct WebhookNotifier {
    url: String,
    timeout_seconds: u64,
    http_client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout_seconds: u64) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            url: url.to_string(),
            timeout_seconds,
            http_client,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, assessment: &FinalAssessment) -> Result<()> {
        debug!("Posting assessment {} to {}", assessment.key(), self.url);

        let response = self
            .http_client
            .post(&self.url)
            .json(assessment)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    anyhow::anyhow!("Webhook timed out after {}s", self.timeout_seconds)
                } else if e.is_connect() {
                    anyhow::anyhow!("Cannot connect to webhook at {}", self.url)
                } else {
                    anyhow::anyhow!("Failed to send notification: {}", e)
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Webhook error {}: {}", status, body));
        }

        Ok(())
    }
}

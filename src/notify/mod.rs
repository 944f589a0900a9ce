//! Delivery of finished assessments to subscribers.
//!
//! Delivery is at-least-once: subscribers must treat notifications as
//! idempotent on `(customer_id, batch_id)`.

pub mod sinks;

pub use sinks::{ChannelNotifier, JsonlNotifier, WebhookNotifier};

use crate::config::{NotifierConfig, NotifierKind};
use crate::models::FinalAssessment;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A downstream notification sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, assessment: &FinalAssessment) -> Result<()>;
}

/// Retries a sink with linear backoff.
pub struct RetryingNotifier {
    inner: Arc<dyn Notifier>,
    attempts: usize,
    backoff: Duration,
}

impl RetryingNotifier {
    pub fn new(inner: Arc<dyn Notifier>, attempts: usize, backoff: Duration) -> Self {
        Self {
            inner,
            attempts: attempts.max(1),
            backoff,
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

#[async_trait]
impl Notifier for RetryingNotifier {
    async fn notify(&self, assessment: &FinalAssessment) -> Result<()> {
        let mut last_error = None;

        for attempt in 1..=self.attempts {
            match self.inner.notify(assessment).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "Notification for {} failed (attempt {}/{}): {}",
                        assessment.key(),
                        attempt,
                        self.attempts,
                        e
                    );
                    last_error = Some(e);
                    if attempt < self.attempts {
                        tokio::time::sleep(self.backoff * attempt as u32).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no delivery attempt was made")))
    }
}

/// Build the configured sink, wrapped in retry handling.
pub fn from_config(config: &NotifierConfig) -> Result<Arc<RetryingNotifier>> {
    let sink: Arc<dyn Notifier> = match config.kind {
        NotifierKind::Stdout => {
            info!("Notifications go to stdout");
            Arc::new(JsonlNotifier::stdout())
        }
        NotifierKind::Jsonl => {
            info!("Notifications go to {}", config.path);
            Arc::new(
                JsonlNotifier::append_to(Path::new(&config.path))
                    .with_context(|| format!("Failed to open notification file {}", config.path))?,
            )
        }
        NotifierKind::Webhook => {
            info!("Notifications go to {}", config.url);
            Arc::new(WebhookNotifier::new(&config.url, config.timeout_seconds)?)
        }
    };

    Ok(Arc::new(RetryingNotifier::new(
        sink,
        config.retries,
        Duration::from_millis(200),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AssessmentStatus, RiskCategory};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) fn sample_assessment() -> FinalAssessment {
        FinalAssessment {
            customer_id: "C1".to_string(),
            batch_id: "B1".to_string(),
            captured_at: Utc::now(),
            overall_score: 0.5,
            category: RiskCategory::Medium,
            confidence: 0.75,
            per_dimension: BTreeMap::new(),
            missing_dimensions: Vec::new(),
            synthesized_at: Utc::now(),
            status: AssessmentStatus::Complete,
            pipeline_version: "v1".to_string(),
        }
    }

    struct FlakySink {
        failures_left: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Notifier for FlakySink {
        async fn notify(&self, _assessment: &FinalAssessment) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                anyhow::bail!("sink unavailable");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let sink = Arc::new(FlakySink {
            failures_left: AtomicUsize::new(2),
            calls: AtomicUsize::new(0),
        });
        let notifier = RetryingNotifier::new(sink.clone(), 3, Duration::ZERO);

        notifier.notify(&sample_assessment()).await.unwrap();
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_attempts() {
        let sink = Arc::new(FlakySink {
            failures_left: AtomicUsize::new(10),
            calls: AtomicUsize::new(0),
        });
        let notifier = RetryingNotifier::new(sink.clone(), 2, Duration::ZERO);

        let err = notifier.notify(&sample_assessment()).await.unwrap_err();
        assert!(err.to_string().contains("sink unavailable"));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_from_config_builds_jsonl_sink() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = NotifierConfig {
            kind: NotifierKind::Jsonl,
            path: dir.path().join("out.jsonl").display().to_string(),
            retries: 5,
            ..NotifierConfig::default()
        };
        let notifier = from_config(&config).unwrap();
        assert_eq!(notifier.attempts(), 5);
    }
}

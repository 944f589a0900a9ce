//! Agent worker: scores one batch along one dimension.
//!
//! Workers are stateless and know nothing of each other. A batch that
//! cannot be scored still yields a record (zero confidence, flagged
//! `insufficient_data`), because only a present record lets the batch
//! reach synthesis.

use crate::agent::scorers::Scorer;
use crate::error::StoreResult;
use crate::models::{DimensionResult, ObservationBatch};
use crate::store::{ResultLedger, UpsertOutcome};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// Worker for one analysis dimension.
#[derive(Clone)]
pub struct AgentWorker {
    dimension: String,
    scorer: Arc<dyn Scorer>,
    ledger: Arc<dyn ResultLedger>,
}

impl AgentWorker {
    pub fn new(
        dimension: impl Into<String>,
        scorer: Arc<dyn Scorer>,
        ledger: Arc<dyn ResultLedger>,
    ) -> Self {
        Self {
            dimension: dimension.into(),
            scorer,
            ledger,
        }
    }

    pub fn dimension(&self) -> &str {
        &self.dimension
    }

    /// Score a batch without touching the ledger.
    ///
    /// Never fails: empty payloads, scorer errors, panics and non-finite
    /// outputs all become zero-confidence results.
    pub fn evaluate(&self, batch: &ObservationBatch) -> DimensionResult {
        if !batch.has_payload() {
            debug!(
                "Empty payload for {} on {}, recording insufficient data",
                self.dimension,
                batch.key()
            );
            return DimensionResult::insufficient(batch, &self.dimension, None);
        }

        let scorer = Arc::clone(&self.scorer);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| scorer.score(&batch.payload)));

        match outcome {
            Ok(Ok(outcome)) if outcome.score.is_finite() && outcome.confidence.is_finite() => {
                DimensionResult::scored(batch, &self.dimension, outcome)
            }
            Ok(Ok(_)) => {
                warn!(
                    "Scorer {} returned a non-finite value for {}",
                    self.dimension,
                    batch.key()
                );
                DimensionResult::insufficient(batch, &self.dimension, Some("non-finite score"))
            }
            Ok(Err(e)) => {
                warn!("Scorer {} failed on {}: {}", self.dimension, batch.key(), e);
                DimensionResult::insufficient(batch, &self.dimension, Some(&e.to_string()))
            }
            Err(_) => {
                warn!("Scorer {} panicked on {}", self.dimension, batch.key());
                DimensionResult::insufficient(batch, &self.dimension, Some("scorer panicked"))
            }
        }
    }

    /// Score a batch and upsert the result into the ledger.
    ///
    /// Safe to re-invoke for the same batch: the ledger keeps one record
    /// per `(customer, dimension, batch)`.
    pub async fn process(&self, batch: &ObservationBatch) -> StoreResult<DimensionResult> {
        let result = self.evaluate(batch);
        let outcome = self.ledger.upsert(result.clone()).await?;

        debug!(
            "{} result for {}: score={:.3} confidence={:.3} ({:?})",
            self.dimension,
            batch.key(),
            result.score,
            result.confidence,
            outcome
        );

        if outcome == UpsertOutcome::Stale {
            debug!("A newer {} result already exists for {}", self.dimension, batch.key());
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScoreError;
    use crate::models::{BatchKey, ScoreOutcome};
    use crate::store::InMemoryResultLedger;
    use chrono::Utc;
    use serde_json::{json, Value};

    fn batch(payload: Value) -> ObservationBatch {
        ObservationBatch {
            customer_id: "C1".to_string(),
            batch_id: "B1".to_string(),
            captured_at: Utc::now(),
            payload,
        }
    }

    fn worker(scorer: impl Scorer + 'static, ledger: Arc<InMemoryResultLedger>) -> AgentWorker {
        AgentWorker::new("behavioral", Arc::new(scorer), ledger)
    }

    fn fixed(score: f64, confidence: f64) -> impl Scorer {
        move |_: &Value| Ok::<_, ScoreError>(ScoreOutcome::new(score, confidence, "fixed"))
    }

    #[tokio::test]
    async fn test_process_writes_one_record() {
        let ledger = Arc::new(InMemoryResultLedger::new());
        let w = worker(fixed(0.7, 0.9), Arc::clone(&ledger));

        let result = w.process(&batch(json!({"events": [1]}))).await.unwrap();
        assert_eq!(result.score, 0.7);
        assert_eq!(result.confidence, 0.9);

        // Re-delivery of the same batch must not duplicate the record.
        w.process(&batch(json!({"events": [1]}))).await.unwrap();
        let all = ledger.get_all(&BatchKey::new("C1", "B1")).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_payload_yields_zero_confidence() {
        let ledger = Arc::new(InMemoryResultLedger::new());
        let w = worker(fixed(0.7, 0.9), Arc::clone(&ledger));

        let result = w.process(&batch(json!({}))).await.unwrap();
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.rationale, "insufficient_data");
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_scorer_error_is_converted() {
        let ledger = Arc::new(InMemoryResultLedger::new());
        let failing = |_: &Value| Err::<ScoreOutcome, _>(ScoreError::Failed("model offline".into()));
        let w = worker(failing, ledger);

        let result = w.evaluate(&batch(json!({"events": [1]})));
        assert_eq!(result.confidence, 0.0);
        assert!(result.is_insufficient());
        assert!(result.rationale.contains("model offline"));
    }

    #[test]
    fn test_scorer_panic_is_converted() {
        let ledger = Arc::new(InMemoryResultLedger::new());
        let panicking = |_: &Value| -> Result<ScoreOutcome, ScoreError> { panic!("boom") };
        let w = worker(panicking, ledger);

        let result = w.evaluate(&batch(json!({"events": [1]})));
        assert_eq!(result.confidence, 0.0);
        assert!(result.rationale.contains("scorer panicked"));
    }

    #[test]
    fn test_non_finite_score_is_converted() {
        let ledger = Arc::new(InMemoryResultLedger::new());
        let w = worker(fixed(f64::NAN, 0.5), ledger);

        let result = w.evaluate(&batch(json!({"events": [1]})));
        assert_eq!(result.score, 0.0);
        assert!(result.is_insufficient());
    }
}

//! Synthesis of dimension results into a final assessment.
//!
//! The score is a weighted average normalized over the dimensions that
//! actually carry information, so a missing or zero-confidence dimension
//! lowers confidence but never drags the score towards zero.
//!
//! At-most-one complete assessment per batch is guaranteed by the
//! conditional commit of the assessment store, not by the caller.

use crate::config::{RequiredDimensionSet, ScoringPolicy};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{AssessmentStatus, BatchKey, DimensionResult, FinalAssessment, RiskCategory};
use crate::notify::Notifier;
use crate::store::{AssessmentStore, CommitOutcome, ObservationStore, ResultLedger};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Why a synthesis request wrote nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum NoOpReason {
    /// A complete assessment already exists for the batch.
    AlreadyComplete,
    /// A forced synthesis found an assessment already in place.
    AlreadySynthesized(AssessmentStatus),
    /// Required dimensions are still missing.
    Incomplete { missing: Vec<String> },
}

/// Result of a synthesis request.
#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisOutcome {
    /// The assessment was written and subscribers were notified.
    Committed(FinalAssessment),
    /// An earlier, undelivered assessment was sent again.
    Redelivered(FinalAssessment),
    NoOp(NoOpReason),
}

impl SynthesisOutcome {
    pub fn assessment(&self) -> Option<&FinalAssessment> {
        match self {
            SynthesisOutcome::Committed(a) | SynthesisOutcome::Redelivered(a) => Some(a),
            SynthesisOutcome::NoOp(_) => None,
        }
    }
}

/// Numbers derived from a set of dimension results.
#[derive(Debug, Clone, PartialEq)]
pub struct Combined {
    pub overall_score: f64,
    pub confidence: f64,
    pub category: RiskCategory,
    pub per_dimension: BTreeMap<String, DimensionResult>,
    pub missing: Vec<String>,
}

/// Combine results into score, confidence and category.
///
/// Only results for required dimensions are considered. Zero-confidence
/// and zero-weight dimensions are left out of the score average; the
/// confidence average includes every present dimension and is scaled by
/// the fraction of required dimensions present.
pub fn combine(
    required: &RequiredDimensionSet,
    policy: &ScoringPolicy,
    results: Vec<DimensionResult>,
) -> Combined {
    let per_dimension: BTreeMap<String, DimensionResult> = results
        .into_iter()
        .filter(|r| required.contains(&r.dimension))
        .map(|r| (r.dimension.clone(), r))
        .collect();

    let missing = required.missing(per_dimension.keys().map(String::as_str));

    let mut score_num = 0.0;
    let mut score_den = 0.0;
    let mut conf_num = 0.0;
    let mut conf_den = 0.0;

    for (dimension, result) in &per_dimension {
        let weight = policy.weight(dimension);
        conf_num += weight * result.confidence;
        conf_den += weight;
        if result.confidence > 0.0 {
            score_num += weight * result.score;
            score_den += weight;
        }
    }

    let overall_score = if score_den > 0.0 {
        (score_num / score_den).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let coverage = if required.is_empty() {
        0.0
    } else {
        per_dimension.len() as f64 / required.len() as f64
    };

    let confidence = if conf_den > 0.0 && score_den > 0.0 {
        (conf_num / conf_den * coverage).clamp(0.0, 1.0)
    } else {
        0.0
    };

    Combined {
        overall_score,
        confidence,
        category: policy.thresholds.categorize(overall_score),
        per_dimension,
        missing,
    }
}

/// Writes final assessments and notifies subscribers.
pub struct Synthesizer {
    required: RequiredDimensionSet,
    policy: ScoringPolicy,
    observations: Arc<dyn ObservationStore>,
    ledger: Arc<dyn ResultLedger>,
    assessments: Arc<dyn AssessmentStore>,
    notifier: Arc<dyn Notifier>,
}

impl Synthesizer {
    pub fn new(
        required: RequiredDimensionSet,
        policy: ScoringPolicy,
        observations: Arc<dyn ObservationStore>,
        ledger: Arc<dyn ResultLedger>,
        assessments: Arc<dyn AssessmentStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            required,
            policy,
            observations,
            ledger,
            assessments,
            notifier,
        }
    }

    pub fn required(&self) -> &RequiredDimensionSet {
        &self.required
    }

    /// Synthesize a complete assessment if every required dimension is present.
    ///
    /// Re-entrant: concurrent or repeated calls for the same batch write at
    /// most one complete assessment; the others return `NoOp`, or re-send
    /// the stored assessment when its earlier delivery failed.
    pub async fn synthesize(&self, key: &BatchKey) -> PipelineResult<SynthesisOutcome> {
        if let Some(existing) = self.assessments.get(key).await? {
            if existing.is_complete() {
                debug!("Assessment for {} already complete, skipping", key);
                return self.redeliver(key, NoOpReason::AlreadyComplete).await;
            }
        }

        let results = self.ledger.get_all(key).await?;
        let combined = combine(&self.required, &self.policy, results);

        if !combined.missing.is_empty() {
            debug!("Batch {} still missing {:?}", key, combined.missing);
            return Ok(SynthesisOutcome::NoOp(NoOpReason::Incomplete {
                missing: combined.missing,
            }));
        }

        self.write(key, combined, AssessmentStatus::Complete).await
    }

    /// Synthesize whatever is present for a batch that missed its deadline.
    ///
    /// Produces a `partial` assessment unless every dimension turned up in
    /// the meantime, in which case it is an ordinary complete synthesis.
    pub async fn force_partial(&self, key: &BatchKey) -> PipelineResult<SynthesisOutcome> {
        if let Some(existing) = self.assessments.get(key).await? {
            return self
                .redeliver(key, NoOpReason::AlreadySynthesized(existing.status))
                .await;
        }

        let results = self.ledger.get_all(key).await?;
        let combined = combine(&self.required, &self.policy, results);
        let status = if combined.missing.is_empty() {
            AssessmentStatus::Complete
        } else {
            AssessmentStatus::Partial
        };

        self.write(key, combined, status).await
    }

    async fn write(
        &self,
        key: &BatchKey,
        combined: Combined,
        status: AssessmentStatus,
    ) -> PipelineResult<SynthesisOutcome> {
        let synthesized_at = Utc::now();
        let captured_at = match self.observations.get(key).await? {
            Some(batch) => batch.captured_at,
            None => {
                debug!("Batch {} not in observation store, dating by synthesis", key);
                synthesized_at
            }
        };

        let assessment = FinalAssessment {
            customer_id: key.customer_id.clone(),
            batch_id: key.batch_id.clone(),
            captured_at,
            overall_score: combined.overall_score,
            category: combined.category,
            confidence: combined.confidence,
            per_dimension: combined.per_dimension,
            missing_dimensions: combined.missing,
            synthesized_at,
            status,
            pipeline_version: self.required.version().to_string(),
        };

        match self.assessments.commit(assessment.clone()).await? {
            CommitOutcome::Committed => {
                info!(
                    "{} assessment for {}: score={:.3} category={} confidence={:.3}",
                    status, key, assessment.overall_score, assessment.category, assessment.confidence
                );
            }
            CommitOutcome::Rejected { existing } => {
                debug!(
                    "Lost synthesis race for {} ({} assessment already stored)",
                    key, existing.status
                );
                let reason = match status {
                    AssessmentStatus::Complete => NoOpReason::AlreadyComplete,
                    AssessmentStatus::Partial => NoOpReason::AlreadySynthesized(existing.status),
                };
                return self.redeliver(key, reason).await;
            }
        }

        self.deliver(key, assessment)
            .await
            .map(SynthesisOutcome::Committed)
    }

    /// Re-send a stored assessment whose notification failed, if any.
    async fn redeliver(&self, key: &BatchKey, reason: NoOpReason) -> PipelineResult<SynthesisOutcome> {
        match self.assessments.claim_undelivered(key).await? {
            Some(assessment) => {
                info!("Re-sending undelivered {} assessment for {}", assessment.status, key);
                self.deliver(key, assessment)
                    .await
                    .map(SynthesisOutcome::Redelivered)
            }
            None => Ok(SynthesisOutcome::NoOp(reason)),
        }
    }

    async fn deliver(
        &self,
        key: &BatchKey,
        assessment: FinalAssessment,
    ) -> PipelineResult<FinalAssessment> {
        let sent = self.notifier.notify(&assessment).await;
        self.assessments
            .settle_delivery(&assessment, sent.is_ok())
            .await?;

        match sent {
            Ok(()) => Ok(assessment),
            Err(e) => {
                warn!("Notification for {} failed, kept for re-delivery: {}", key, e);
                Err(PipelineError::Notify {
                    key: key.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Thresholds;
    use crate::models::ObservationBatch;
    use crate::notify::ChannelNotifier;
    use crate::store::{InMemoryAssessmentStore, InMemoryObservationStore, InMemoryResultLedger};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn result(dimension: &str, score: f64, confidence: f64) -> DimensionResult {
        DimensionResult {
            customer_id: "C1".to_string(),
            dimension: dimension.to_string(),
            batch_id: "B1".to_string(),
            score,
            confidence,
            rationale: "test".to_string(),
            produced_at: Utc::now(),
        }
    }

    fn policy(weights: &[(&str, f64)]) -> ScoringPolicy {
        ScoringPolicy {
            weights: weights.iter().map(|(d, w)| (d.to_string(), *w)).collect(),
            thresholds: Thresholds::default(),
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_weighted_average() {
        let required = RequiredDimensionSet::new("v1", ["A", "B"]);
        let combined = combine(
            &required,
            &policy(&[("A", 2.0), ("B", 1.0)]),
            vec![result("A", 0.8, 1.0), result("B", 0.2, 1.0)],
        );
        assert!(approx(combined.overall_score, 0.6));
        assert!(approx(combined.confidence, 1.0));
        assert_eq!(combined.category, RiskCategory::Medium);
        assert!(combined.missing.is_empty());
    }

    #[test]
    fn test_missing_dimension_is_excluded_not_diluting() {
        let required = RequiredDimensionSet::new("v1", ["A", "B"]);
        let combined = combine(
            &required,
            &policy(&[("A", 2.0), ("B", 1.0)]),
            vec![result("A", 0.8, 0.9)],
        );
        assert!(approx(combined.overall_score, 0.8));
        assert!(approx(combined.confidence, 0.45));
        assert_eq!(combined.missing, vec!["B".to_string()]);
    }

    #[test]
    fn test_zero_confidence_excluded_from_score_only() {
        let required = RequiredDimensionSet::new("v1", ["A", "B"]);
        let combined = combine(
            &required,
            &policy(&[]),
            vec![result("A", 0.9, 0.8), result("B", 0.0, 0.0)],
        );
        assert!(approx(combined.overall_score, 0.9));
        assert!(approx(combined.confidence, 0.4));
        assert!(combined.missing.is_empty());
    }

    #[test]
    fn test_nothing_to_score() {
        let required = RequiredDimensionSet::new("v1", ["A", "B"]);
        let combined = combine(
            &required,
            &policy(&[]),
            vec![result("A", 0.0, 0.0), result("B", 0.0, 0.0)],
        );
        assert_eq!(combined.overall_score, 0.0);
        assert_eq!(combined.confidence, 0.0);
        assert_eq!(combined.category, RiskCategory::Low);
    }

    #[test]
    fn test_unrequired_dimensions_are_ignored() {
        let required = RequiredDimensionSet::new("v1", ["A"]);
        let combined = combine(
            &required,
            &policy(&[]),
            vec![result("A", 0.2, 1.0), result("extra", 1.0, 1.0)],
        );
        assert!(approx(combined.overall_score, 0.2));
        assert_eq!(combined.per_dimension.len(), 1);
    }

    /// Fails the first `failures` deliveries, then forwards to a channel.
    struct FlakyNotifier {
        failures: AtomicUsize,
        inner: ChannelNotifier,
    }

    #[async_trait]
    impl Notifier for FlakyNotifier {
        async fn notify(&self, assessment: &FinalAssessment) -> anyhow::Result<()> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                anyhow::bail!("sink unavailable");
            }
            self.inner.notify(assessment).await
        }
    }

    struct Fixture {
        synthesizer: Synthesizer,
        observations: Arc<InMemoryObservationStore>,
        ledger: Arc<InMemoryResultLedger>,
        assessments: Arc<InMemoryAssessmentStore>,
        notifications: tokio::sync::mpsc::UnboundedReceiver<FinalAssessment>,
    }

    fn fixture_failing(failures: usize) -> Fixture {
        let observations = Arc::new(InMemoryObservationStore::new());
        let ledger = Arc::new(InMemoryResultLedger::new());
        let assessments = Arc::new(InMemoryAssessmentStore::new());
        let (inner, notifications) = ChannelNotifier::new();
        let notifier = FlakyNotifier {
            failures: AtomicUsize::new(failures),
            inner,
        };
        let synthesizer = Synthesizer::new(
            RequiredDimensionSet::new("v1", ["A", "B"]),
            policy(&[("A", 2.0), ("B", 1.0)]),
            observations.clone(),
            ledger.clone(),
            assessments.clone(),
            Arc::new(notifier),
        );
        Fixture {
            synthesizer,
            observations,
            ledger,
            assessments,
            notifications,
        }
    }

    fn fixture() -> Fixture {
        fixture_failing(0)
    }

    #[tokio::test]
    async fn test_synthesize_without_all_dimensions_is_noop() {
        let mut f = fixture();
        f.ledger.upsert(result("A", 0.8, 0.9)).await.unwrap();

        let outcome = f.synthesizer.synthesize(&BatchKey::new("C1", "B1")).await.unwrap();
        assert_eq!(
            outcome,
            SynthesisOutcome::NoOp(NoOpReason::Incomplete {
                missing: vec!["B".to_string()]
            })
        );
        assert_eq!(f.assessments.complete_count(), 0);
        assert!(f.notifications.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_synthesize_is_idempotent() {
        let mut f = fixture();
        let key = BatchKey::new("C1", "B1");
        f.ledger.upsert(result("A", 0.8, 1.0)).await.unwrap();
        f.ledger.upsert(result("B", 0.2, 1.0)).await.unwrap();

        let first = f.synthesizer.synthesize(&key).await.unwrap();
        let assessment = first.assessment().cloned().unwrap();
        assert_eq!(assessment.status, AssessmentStatus::Complete);
        assert!(approx(assessment.overall_score, 0.6));
        assert_eq!(assessment.pipeline_version, "v1");

        let second = f.synthesizer.synthesize(&key).await.unwrap();
        assert_eq!(second, SynthesisOutcome::NoOp(NoOpReason::AlreadyComplete));

        assert_eq!(f.notifications.try_recv().unwrap(), assessment);
        assert!(f.notifications.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_forced_partial_then_late_completion() {
        let mut f = fixture();
        let key = BatchKey::new("C1", "B1");
        f.ledger.upsert(result("A", 0.8, 0.9)).await.unwrap();

        let partial = f.synthesizer.force_partial(&key).await.unwrap();
        let partial = partial.assessment().cloned().unwrap();
        assert_eq!(partial.status, AssessmentStatus::Partial);
        assert!(approx(partial.overall_score, 0.8));
        assert_eq!(partial.missing_dimensions, vec!["B".to_string()]);

        // A second deadline sweep leaves the partial alone.
        assert_eq!(
            f.synthesizer.force_partial(&key).await.unwrap(),
            SynthesisOutcome::NoOp(NoOpReason::AlreadySynthesized(AssessmentStatus::Partial))
        );

        f.ledger.upsert(result("B", 0.2, 0.9)).await.unwrap();
        let complete = f.synthesizer.synthesize(&key).await.unwrap();
        let complete = complete.assessment().cloned().unwrap();
        assert_eq!(complete.status, AssessmentStatus::Complete);
        assert!(complete.missing_dimensions.is_empty());

        assert_eq!(f.notifications.try_recv().unwrap().status, AssessmentStatus::Partial);
        assert_eq!(f.notifications.try_recv().unwrap().status, AssessmentStatus::Complete);
        assert_eq!(f.assessments.complete_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_notification_surfaces_error() {
        let ledger = Arc::new(InMemoryResultLedger::new());
        let assessments = Arc::new(InMemoryAssessmentStore::new());
        let (notifier, receiver) = ChannelNotifier::new();
        drop(receiver);
        let synthesizer = Synthesizer::new(
            RequiredDimensionSet::new("v1", ["A"]),
            ScoringPolicy::default(),
            Arc::new(InMemoryObservationStore::new()),
            ledger.clone(),
            assessments,
            Arc::new(notifier),
        );
        ledger.upsert(result("A", 0.5, 0.5)).await.unwrap();

        let err = synthesizer
            .synthesize(&BatchKey::new("C1", "B1"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Notify { .. }));
    }

    #[tokio::test]
    async fn test_complete_redelivered_after_failed_notification() {
        let mut f = fixture_failing(1);
        let key = BatchKey::new("C1", "B1");
        f.ledger.upsert(result("A", 0.8, 1.0)).await.unwrap();
        f.ledger.upsert(result("B", 0.2, 1.0)).await.unwrap();

        let err = f.synthesizer.synthesize(&key).await.unwrap_err();
        assert!(matches!(err, PipelineError::Notify { .. }));
        assert_eq!(f.assessments.complete_count(), 1);
        assert_eq!(f.assessments.undelivered_count(), 1);
        assert!(f.notifications.try_recv().is_err());

        let retried = f.synthesizer.synthesize(&key).await.unwrap();
        let sent = match retried {
            SynthesisOutcome::Redelivered(a) => a,
            other => panic!("expected re-delivery, got {:?}", other),
        };
        assert_eq!(f.notifications.try_recv().unwrap(), sent);
        assert_eq!(f.assessments.undelivered_count(), 0);

        // Delivered once; later triggers stay silent.
        assert_eq!(
            f.synthesizer.synthesize(&key).await.unwrap(),
            SynthesisOutcome::NoOp(NoOpReason::AlreadyComplete)
        );
        assert!(f.notifications.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_partial_redelivered_by_next_sweep() {
        let mut f = fixture_failing(1);
        let key = BatchKey::new("C1", "B1");
        f.ledger.upsert(result("A", 0.8, 0.9)).await.unwrap();

        assert!(f.synthesizer.force_partial(&key).await.is_err());
        let retried = f.synthesizer.force_partial(&key).await.unwrap();
        assert!(matches!(retried, SynthesisOutcome::Redelivered(ref a) if a.status == AssessmentStatus::Partial));
        assert_eq!(f.notifications.try_recv().unwrap().status, AssessmentStatus::Partial);

        assert_eq!(
            f.synthesizer.force_partial(&key).await.unwrap(),
            SynthesisOutcome::NoOp(NoOpReason::AlreadySynthesized(AssessmentStatus::Partial))
        );
    }

    #[tokio::test]
    async fn test_assessment_carries_batch_capture_time() {
        let f = fixture();
        let captured_at = Utc::now() - chrono::Duration::hours(3);
        f.observations
            .append(ObservationBatch {
                customer_id: "C1".to_string(),
                batch_id: "B1".to_string(),
                captured_at,
                payload: serde_json::json!({"events": [{"kind": "login"}]}),
            })
            .await
            .unwrap();
        f.ledger.upsert(result("A", 0.5, 1.0)).await.unwrap();
        f.ledger.upsert(result("B", 0.5, 1.0)).await.unwrap();

        let outcome = f.synthesizer.synthesize(&BatchKey::new("C1", "B1")).await.unwrap();
        let assessment = outcome.assessment().unwrap();
        assert_eq!(assessment.captured_at, captured_at);
        assert!(assessment.synthesized_at > captured_at);
    }
}

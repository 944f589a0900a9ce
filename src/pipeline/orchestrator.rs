//! Pipeline wiring: ingestion, worker fan-out, deadline sweeps and queries.

use crate::agent::{AgentWorker, ScorerRegistry};
use crate::config::{Config, RequiredDimensionSet, ScoringPolicy};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{BatchKey, DimensionResult, FinalAssessment, ObservationBatch};
use crate::notify::{JsonlNotifier, Notifier};
use crate::pipeline::detector::{CompletionDetector, Detection};
use crate::pipeline::synthesizer::Synthesizer;
use crate::store::{
    AppendOutcome, AssessmentStore, InMemoryAssessmentStore, InMemoryObservationStore,
    InMemoryResultLedger, ObservationStore, ResultLedger,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// What happened to one ingested batch.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub key: BatchKey,
    /// Whether the batch had been ingested before.
    pub redelivered: bool,
    /// One result per agent worker.
    pub results: Vec<DimensionResult>,
    /// The assessment this ingestion produced, or re-sent after an
    /// earlier failed notification.
    pub assessment: Option<FinalAssessment>,
    /// Detector invocations that found the batch already synthesized.
    pub suppressed_triggers: usize,
}

impl BatchReport {
    fn new(key: BatchKey, redelivered: bool) -> Self {
        Self {
            key,
            redelivered,
            results: Vec::new(),
            assessment: None,
            suppressed_triggers: 0,
        }
    }

    fn record(&mut self, result: DimensionResult, detection: Detection) {
        self.results.push(result);
        match detection {
            Detection::Synthesized(assessment) | Detection::Redelivered(assessment) => {
                self.assessment = Some(assessment)
            }
            Detection::AlreadySynthesized => self.suppressed_triggers += 1,
            Detection::Waiting { .. } => {}
        }
    }
}

/// Builder for [`Pipeline`]. Stores default to in-memory implementations.
pub struct PipelineBuilder {
    required: RequiredDimensionSet,
    policy: ScoringPolicy,
    concurrency: usize,
    deadline: Duration,
    result_ttl: Option<Duration>,
    registry: ScorerRegistry,
    observations: Option<Arc<dyn ObservationStore>>,
    ledger: Option<Arc<dyn ResultLedger>>,
    assessments: Option<Arc<dyn AssessmentStore>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl PipelineBuilder {
    pub fn new(required: RequiredDimensionSet, policy: ScoringPolicy) -> Self {
        Self {
            required,
            policy,
            concurrency: 4,
            deadline: Duration::from_secs(900),
            result_ttl: None,
            registry: ScorerRegistry::with_builtins(),
            observations: None,
            ledger: None,
            assessments: None,
            notifier: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.required_dimensions(), config.scoring_policy())
            .concurrency(config.general.concurrency)
            .deadline(config.synthesis_deadline())
            .result_ttl(config.result_ttl())
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = Some(ttl);
        self
    }

    pub fn registry(mut self, registry: ScorerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn observations(mut self, store: Arc<dyn ObservationStore>) -> Self {
        self.observations = Some(store);
        self
    }

    pub fn ledger(mut self, ledger: Arc<dyn ResultLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn assessments(mut self, store: Arc<dyn AssessmentStore>) -> Self {
        self.assessments = Some(store);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Resolve scorers for the required set and wire the pipeline.
    pub fn build(self) -> PipelineResult<Pipeline> {
        let scorers = self.registry.resolve(&self.required)?;

        let ledger: Arc<dyn ResultLedger> = match (self.ledger, self.result_ttl) {
            (Some(ledger), _) => ledger,
            (None, Some(ttl)) => Arc::new(InMemoryResultLedger::with_ttl(ttl)),
            (None, None) => Arc::new(InMemoryResultLedger::new()),
        };
        let observations: Arc<dyn ObservationStore> = match self.observations {
            Some(store) => store,
            None => Arc::new(InMemoryObservationStore::new()),
        };
        let assessments: Arc<dyn AssessmentStore> = match self.assessments {
            Some(store) => store,
            None => Arc::new(InMemoryAssessmentStore::new()),
        };
        let notifier: Arc<dyn Notifier> = match self.notifier {
            Some(notifier) => notifier,
            None => Arc::new(JsonlNotifier::stdout()),
        };

        let workers = scorers
            .into_iter()
            .map(|(dimension, scorer)| AgentWorker::new(dimension, scorer, Arc::clone(&ledger)))
            .collect();

        let synthesizer = Arc::new(Synthesizer::new(
            self.required.clone(),
            self.policy,
            Arc::clone(&observations),
            Arc::clone(&ledger),
            Arc::clone(&assessments),
            notifier,
        ));
        let detector = Arc::new(CompletionDetector::new(
            self.required.clone(),
            Arc::clone(&ledger),
            Arc::clone(&synthesizer),
        ));

        info!(
            "Pipeline {} ready with dimensions {:?}",
            self.required.version(),
            self.required.iter().collect::<Vec<_>>()
        );

        Ok(Pipeline {
            required: self.required,
            observations,
            assessments,
            workers,
            detector,
            synthesizer,
            limiter: Arc::new(Semaphore::new(self.concurrency)),
            deadline: chrono::Duration::from_std(self.deadline)
                .unwrap_or_else(|_| chrono::Duration::days(365 * 100)),
            sweep: Mutex::new(SweepState::default()),
            sweep_turn: tokio::sync::Mutex::new(()),
        })
    }
}

/// Progress of deadline sweeps.
#[derive(Default)]
struct SweepState {
    /// Every batch captured before this instant has been offered to a sweep.
    swept_until: Option<DateTime<Utc>>,
    /// Batches behind the cursor that still need one: late arrivals and
    /// sweeps whose notification failed.
    carry: BTreeSet<(DateTime<Utc>, BatchKey)>,
}

/// The assembled fan-out/fan-in pipeline.
pub struct Pipeline {
    required: RequiredDimensionSet,
    observations: Arc<dyn ObservationStore>,
    assessments: Arc<dyn AssessmentStore>,
    workers: Vec<AgentWorker>,
    detector: Arc<CompletionDetector>,
    synthesizer: Arc<Synthesizer>,
    limiter: Arc<Semaphore>,
    deadline: chrono::Duration,
    sweep: Mutex<SweepState>,
    /// Serializes sweeps.
    sweep_turn: tokio::sync::Mutex<()>,
}

impl Pipeline {
    pub fn required(&self) -> &RequiredDimensionSet {
        &self.required
    }

    /// Store a batch and run every agent worker on it concurrently.
    ///
    /// Safe under at-least-once delivery: a re-delivered batch is scored
    /// again, overwriting its earlier results, and never synthesized twice.
    /// Any store failure fails the whole invocation.
    pub async fn ingest(&self, batch: ObservationBatch) -> PipelineResult<BatchReport> {
        let key = batch.key();
        let redelivered = match self.observations.append(batch.clone()).await? {
            AppendOutcome::Inserted => false,
            AppendOutcome::Duplicate => {
                info!("Batch {} re-delivered, reprocessing", key);
                true
            }
        };

        {
            let mut sweep = self.sweep.lock();
            if sweep.swept_until.map_or(false, |until| batch.captured_at < until) {
                debug!("Batch {} arrived behind the sweep cursor", key);
                sweep.carry.insert((batch.captured_at, key.clone()));
            }
        }

        debug!("Fanning out {} to {} workers", key, self.workers.len());
        let batch = Arc::new(batch);
        let handles: Vec<_> = self
            .workers
            .iter()
            .cloned()
            .map(|worker| {
                let batch = Arc::clone(&batch);
                let detector = Arc::clone(&self.detector);
                let limiter = Arc::clone(&self.limiter);
                tokio::spawn(async move {
                    let _permit = limiter.acquire_owned().await;
                    let result = worker.process(&batch).await?;
                    let detection = detector.on_result_written(&batch.key()).await?;
                    Ok::<_, PipelineError>((result, detection))
                })
            })
            .collect();

        let mut report = BatchReport::new(key.clone(), redelivered);
        let mut first_error = None;

        for joined in futures::future::join_all(handles).await {
            match joined {
                Ok(Ok((result, detection))) => report.record(result, detection),
                Ok(Err(e)) => {
                    warn!("Worker invocation for {} failed: {}", key, e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(e) => {
                    warn!("Worker task for {} did not finish: {}", key, e);
                    if first_error.is_none() {
                        first_error = Some(PipelineError::Join {
                            key: key.clone(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Force-synthesize batches older than the deadline that have no assessment.
    ///
    /// Returns the assessments written, or re-sent after a failed
    /// notification, by this sweep. Each sweep only visits batches captured
    /// since the previous cutoff plus those carried over.
    pub async fn sweep_overdue(&self, now: DateTime<Utc>) -> PipelineResult<Vec<FinalAssessment>> {
        match now.checked_sub_signed(self.deadline) {
            Some(cutoff) => self.sweep_captured_before(cutoff, true).await,
            None => {
                debug!("Deadline reaches before the representable range, nothing is overdue");
                Ok(Vec::new())
            }
        }
    }

    /// Force-synthesize every batch that has no assessment yet, regardless of age.
    pub async fn finalize_pending(&self) -> PipelineResult<Vec<FinalAssessment>> {
        self.sweep_captured_before(DateTime::<Utc>::MAX_UTC, false)
            .await
    }

    async fn sweep_captured_before(
        &self,
        cutoff: DateTime<Utc>,
        advance: bool,
    ) -> PipelineResult<Vec<FinalAssessment>> {
        let _turn = self.sweep_turn.lock().await;

        // Advance before reading so a concurrent ingest either lands in the
        // window or sees the new cursor and joins the carry set.
        let previous = {
            let mut sweep = self.sweep.lock();
            let previous = sweep.swept_until;
            if advance && previous.map_or(true, |until| until < cutoff) {
                sweep.swept_until = Some(cutoff);
            }
            previous
        };

        let window = match self.observations.captured_between(previous, cutoff).await {
            Ok(window) => window,
            Err(e) => {
                self.sweep.lock().swept_until = previous;
                return Err(e.into());
            }
        };

        let due: Vec<(DateTime<Utc>, BatchKey)> = {
            let mut sweep = self.sweep.lock();
            sweep.carry.extend(window);
            sweep
                .carry
                .range(..(cutoff, BatchKey::new("", "")))
                .cloned()
                .collect()
        };

        let mut written = Vec::new();
        for entry in due {
            let key = &entry.1;
            match self.synthesizer.force_partial(key).await {
                Ok(outcome) => {
                    if let Some(assessment) = outcome.assessment() {
                        if !assessment.is_complete() {
                            warn!(
                                "Batch {} missed its deadline, partial assessment written without {:?}",
                                key, assessment.missing_dimensions
                            );
                        }
                        written.push(assessment.clone());
                    }
                }
                Err(PipelineError::Notify { reason, .. }) => {
                    warn!("Sweep could not notify for {}, kept for the next sweep: {}", key, reason);
                    continue;
                }
                Err(e) => return Err(e),
            }
            self.sweep.lock().carry.remove(&entry);
        }

        Ok(written)
    }

    /// The assessment of one batch: `None` until synthesis, then partial or complete.
    pub async fn assessment(&self, key: &BatchKey) -> PipelineResult<Option<FinalAssessment>> {
        Ok(self.assessments.get(key).await?)
    }

    /// The most recent assessment of a customer.
    pub async fn latest(&self, customer_id: &str) -> PipelineResult<Option<FinalAssessment>> {
        Ok(self.assessments.latest(customer_id).await?)
    }
}

//! Completion detection after every ledger write.
//!
//! The detector may fire many times for the same batch, including
//! concurrently from workers finishing together. It is allowed to
//! over-trigger; uniqueness is enforced by the synthesizer's commit.

use crate::config::RequiredDimensionSet;
use crate::error::PipelineResult;
use crate::models::{BatchKey, FinalAssessment};
use crate::pipeline::synthesizer::{NoOpReason, SynthesisOutcome, Synthesizer};
use crate::store::ResultLedger;
use std::sync::Arc;
use tracing::debug;

/// What a detector invocation observed.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// Required dimensions are still missing.
    Waiting { missing: Vec<String> },
    /// This invocation produced the batch's complete assessment.
    Synthesized(FinalAssessment),
    /// Another invocation already synthesized the batch.
    AlreadySynthesized,
    /// The batch was already synthesized but its notification had failed;
    /// this invocation sent it again.
    Redelivered(FinalAssessment),
}

pub struct CompletionDetector {
    required: RequiredDimensionSet,
    ledger: Arc<dyn ResultLedger>,
    synthesizer: Arc<Synthesizer>,
}

impl CompletionDetector {
    pub fn new(
        required: RequiredDimensionSet,
        ledger: Arc<dyn ResultLedger>,
        synthesizer: Arc<Synthesizer>,
    ) -> Self {
        Self {
            required,
            ledger,
            synthesizer,
        }
    }

    /// Check a batch after one of its results was written.
    pub async fn on_result_written(&self, key: &BatchKey) -> PipelineResult<Detection> {
        let results = self.ledger.get_all(key).await?;
        let missing = self
            .required
            .missing(results.iter().map(|r| r.dimension.as_str()));

        if !missing.is_empty() {
            debug!("Batch {} waiting on {:?}", key, missing);
            return Ok(Detection::Waiting { missing });
        }

        debug!("All required dimensions present for {}, synthesizing", key);
        let detection = match self.synthesizer.synthesize(key).await? {
            SynthesisOutcome::Committed(assessment) => Detection::Synthesized(assessment),
            SynthesisOutcome::Redelivered(assessment) => Detection::Redelivered(assessment),
            SynthesisOutcome::NoOp(NoOpReason::Incomplete { missing }) => {
                Detection::Waiting { missing }
            }
            SynthesisOutcome::NoOp(_) => {
                debug!("Duplicate completion trigger for {} suppressed", key);
                Detection::AlreadySynthesized
            }
        };

        Ok(detection)
    }
}

//! Scoring functions for the analysis dimensions.
//!
//! A scorer turns a raw payload into `(score, confidence, rationale)` for
//! one dimension. Scorers are registered by dimension name and resolved
//! once at startup against the required dimension set.

use crate::config::RequiredDimensionSet;
use crate::error::{PipelineError, ScoreError};
use crate::models::ScoreOutcome;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Pluggable scoring function for one dimension.
pub trait Scorer: Send + Sync {
    fn score(&self, payload: &Value) -> Result<ScoreOutcome, ScoreError>;
}

impl<F> Scorer for F
where
    F: Fn(&Value) -> Result<ScoreOutcome, ScoreError> + Send + Sync,
{
    fn score(&self, payload: &Value) -> Result<ScoreOutcome, ScoreError> {
        self(payload)
    }
}

/// Capability set mapping dimension names to scorers.
#[derive(Default, Clone)]
pub struct ScorerRegistry {
    scorers: HashMap<String, Arc<dyn Scorer>>,
}

impl ScorerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in scorers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("behavioral", BehavioralScorer::default());
        registry.register("sentiment", SentimentScorer::default());
        registry.register("financial", FinancialScorer);
        registry
    }

    /// Register a scorer, replacing any previous one for the dimension.
    pub fn register(&mut self, dimension: impl Into<String>, scorer: impl Scorer + 'static) {
        let dimension = dimension.into();
        debug!("Registering scorer for dimension {}", dimension);
        self.scorers.insert(dimension, Arc::new(scorer));
    }

    pub fn get(&self, dimension: &str) -> Option<Arc<dyn Scorer>> {
        self.scorers.get(dimension).cloned()
    }

    pub fn dimensions(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.scorers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Resolve one scorer per required dimension.
    ///
    /// Fails on the first dimension with no registered scorer.
    pub fn resolve(
        &self,
        required: &RequiredDimensionSet,
    ) -> Result<Vec<(String, Arc<dyn Scorer>)>, PipelineError> {
        required
            .iter()
            .map(|dimension| {
                self.get(dimension)
                    .map(|scorer| (dimension.to_string(), scorer))
                    .ok_or_else(|| PipelineError::UnknownDimension(dimension.to_string()))
            })
            .collect()
    }
}

fn array_field<'a>(payload: &'a Value, field: &'static str) -> Result<&'a Vec<Value>, ScoreError> {
    match payload.get(field) {
        None | Some(Value::Null) => Err(ScoreError::MissingField(field)),
        Some(Value::Array(items)) => Ok(items),
        Some(other) => Err(ScoreError::InvalidValue {
            field,
            reason: format!("expected an array, got {}", other),
        }),
    }
}

/// Fraction of observed events whose kind signals risk.
///
/// Expects `payload.events` as an array of objects with a `kind` string.
/// Confidence grows with the number of events and saturates at
/// `saturation` events.
pub struct BehavioralScorer {
    pub risky_kinds: Vec<String>,
    pub saturation: usize,
}

impl Default for BehavioralScorer {
    fn default() -> Self {
        Self {
            risky_kinds: vec![
                "late_payment",
                "chargeback",
                "claim",
                "cancellation",
                "failed_login",
                "address_change",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            saturation: 10,
        }
    }
}

impl Scorer for BehavioralScorer {
    fn score(&self, payload: &Value) -> Result<ScoreOutcome, ScoreError> {
        let events = array_field(payload, "events")?;
        if events.is_empty() {
            return Err(ScoreError::EmptyPayload);
        }

        let risky = events
            .iter()
            .filter_map(|e| e.get("kind").and_then(Value::as_str))
            .filter(|kind| self.risky_kinds.iter().any(|k| k.as_str() == *kind))
            .count();

        let total = events.len();
        let score = risky as f64 / total as f64;
        let confidence = (total as f64 / self.saturation.max(1) as f64).min(1.0);

        Ok(ScoreOutcome::new(
            score,
            confidence,
            format!("{} of {} events flagged as risky", risky, total),
        ))
    }
}

/// Lexicon-based sentiment over free-text messages.
///
/// Expects `payload.messages` as an array of strings. The score is the
/// share of negative hits among all lexicon hits.
pub struct SentimentScorer {
    pub negative: Vec<String>,
    pub positive: Vec<String>,
    pub saturation: usize,
}

impl Default for SentimentScorer {
    fn default() -> Self {
        let words = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            negative: words(&[
                "angry", "cancel", "complaint", "fraud", "lawsuit", "refund", "terrible",
                "unhappy", "worst", "dispute",
            ]),
            positive: words(&[
                "great", "happy", "thanks", "excellent", "satisfied", "love", "helpful",
                "recommend",
            ]),
            saturation: 5,
        }
    }
}

impl Scorer for SentimentScorer {
    fn score(&self, payload: &Value) -> Result<ScoreOutcome, ScoreError> {
        let messages = array_field(payload, "messages")?;

        let mut negative = 0usize;
        let mut positive = 0usize;
        for message in messages.iter().filter_map(Value::as_str) {
            for token in message
                .split(|c: char| !c.is_alphanumeric())
                .filter(|t| !t.is_empty())
            {
                let token = token.to_lowercase();
                if self.negative.iter().any(|w| *w == token) {
                    negative += 1;
                } else if self.positive.iter().any(|w| *w == token) {
                    positive += 1;
                }
            }
        }

        let hits = negative + positive;
        if hits == 0 {
            return Ok(ScoreOutcome::new(
                0.0,
                0.0,
                format!("{}: no sentiment-bearing terms", crate::models::INSUFFICIENT_DATA),
            ));
        }

        Ok(ScoreOutcome::new(
            negative as f64 / hits as f64,
            (hits as f64 / self.saturation.max(1) as f64).min(1.0),
            format!("{} negative / {} positive terms", negative, positive),
        ))
    }
}

/// Debt-to-income ratio from `payload.financial.{debt, income}`.
pub struct FinancialScorer;

impl Scorer for FinancialScorer {
    fn score(&self, payload: &Value) -> Result<ScoreOutcome, ScoreError> {
        let financial = payload
            .get("financial")
            .ok_or(ScoreError::MissingField("financial"))?;

        let debt = financial
            .get("debt")
            .and_then(Value::as_f64)
            .ok_or(ScoreError::MissingField("financial.debt"))?;
        let income = financial
            .get("income")
            .and_then(Value::as_f64)
            .ok_or(ScoreError::MissingField("financial.income"))?;

        if debt < 0.0 {
            return Err(ScoreError::InvalidValue {
                field: "financial.debt",
                reason: "must not be negative".to_string(),
            });
        }
        if income <= 0.0 {
            return Err(ScoreError::InvalidValue {
                field: "financial.income",
                reason: "must be positive".to_string(),
            });
        }

        let ratio = debt / income;
        Ok(ScoreOutcome::new(
            ratio.min(1.0),
            0.8,
            format!("debt-to-income ratio {:.2}", ratio),
        ))
    }
}

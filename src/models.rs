//! Data models for the risk assessment pipeline.
//!
//! This module contains the records that flow through the pipeline:
//! raw observation batches, per-dimension results written by agent
//! workers, and the final synthesized assessment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Rationale flag carried by results that could not be scored.
pub const INSUFFICIENT_DATA: &str = "insufficient_data";

/// Identifies one batch of one customer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BatchKey {
    pub customer_id: String,
    pub batch_id: String,
}

impl BatchKey {
    pub fn new(customer_id: impl Into<String>, batch_id: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            batch_id: batch_id.into(),
        }
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.customer_id, self.batch_id)
    }
}

/// One arrival of raw observation data for a customer.
///
/// Immutable once written. `batch_id` is unique per ingestion event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationBatch {
    /// Customer the observations belong to.
    pub customer_id: String,
    /// Producer-assigned identifier, unique per ingestion event.
    pub batch_id: String,
    /// Arrival time of the batch.
    pub captured_at: DateTime<Utc>,
    /// Raw observation payload, opaque to the pipeline.
    #[serde(default)]
    pub payload: Value,
}

impl ObservationBatch {
    /// Returns the key of this batch.
    pub fn key(&self) -> BatchKey {
        BatchKey::new(&self.customer_id, &self.batch_id)
    }

    /// Whether the payload carries anything to score.
    pub fn has_payload(&self) -> bool {
        match &self.payload {
            Value::Null => false,
            Value::Object(map) => !map.is_empty(),
            Value::Array(items) => !items.is_empty(),
            Value::String(s) => !s.trim().is_empty(),
            _ => true,
        }
    }
}

/// Output of a scoring function before it is attached to a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreOutcome {
    pub score: f64,
    pub confidence: f64,
    pub rationale: String,
}

impl ScoreOutcome {
    pub fn new(score: f64, confidence: f64, rationale: impl Into<String>) -> Self {
        Self {
            score,
            confidence,
            rationale: rationale.into(),
        }
    }
}

/// The result of one agent worker for one batch.
///
/// One logical record exists per `(customer_id, dimension, batch_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionResult {
    pub customer_id: String,
    /// Analysis axis that produced this result.
    pub dimension: String,
    pub batch_id: String,
    /// Risk score in `[0, 1]`.
    pub score: f64,
    /// Confidence in `[0, 1]`. Zero means the batch could not be scored.
    pub confidence: f64,
    pub rationale: String,
    pub produced_at: DateTime<Utc>,
}

impl DimensionResult {
    /// Builds a result from a scorer outcome, clamping both values into `[0, 1]`.
    pub fn scored(batch: &ObservationBatch, dimension: &str, outcome: ScoreOutcome) -> Self {
        Self {
            customer_id: batch.customer_id.clone(),
            dimension: dimension.to_string(),
            batch_id: batch.batch_id.clone(),
            score: outcome.score.clamp(0.0, 1.0),
            confidence: outcome.confidence.clamp(0.0, 1.0),
            rationale: outcome.rationale,
            produced_at: Utc::now(),
        }
    }

    /// Builds the zero-confidence result recorded when a batch cannot be scored.
    pub fn insufficient(batch: &ObservationBatch, dimension: &str, detail: Option<&str>) -> Self {
        let rationale = match detail {
            Some(detail) => format!("{}: {}", INSUFFICIENT_DATA, detail),
            None => INSUFFICIENT_DATA.to_string(),
        };

        Self {
            customer_id: batch.customer_id.clone(),
            dimension: dimension.to_string(),
            batch_id: batch.batch_id.clone(),
            score: 0.0,
            confidence: 0.0,
            rationale,
            produced_at: Utc::now(),
        }
    }

    pub fn batch_key(&self) -> BatchKey {
        BatchKey::new(&self.customer_id, &self.batch_id)
    }

    /// Whether this result is flagged as insufficient data.
    pub fn is_insufficient(&self) -> bool {
        self.rationale.starts_with(INSUFFICIENT_DATA)
    }
}

/// Risk category derived from the overall score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskCategory {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskCategory::Low => write!(f, "low"),
            RiskCategory::Medium => write!(f, "medium"),
            RiskCategory::High => write!(f, "high"),
        }
    }
}

impl RiskCategory {
    /// Returns an emoji representation of the category.
    pub fn emoji(&self) -> &'static str {
        match self {
            RiskCategory::Low => "🟢",
            RiskCategory::Medium => "🟡",
            RiskCategory::High => "🔴",
        }
    }
}

/// Whether every required dimension contributed to an assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssessmentStatus {
    /// All required dimensions were present.
    Complete,
    /// Forced after the synthesis deadline with dimensions missing.
    Partial,
}

impl fmt::Display for AssessmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssessmentStatus::Complete => write!(f, "complete"),
            AssessmentStatus::Partial => write!(f, "partial"),
        }
    }
}

/// The synthesized assessment for one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalAssessment {
    pub customer_id: String,
    pub batch_id: String,
    /// Arrival time of the assessed batch; orders assessments of a customer.
    pub captured_at: DateTime<Utc>,
    pub overall_score: f64,
    pub category: RiskCategory,
    pub confidence: f64,
    /// Results that fed the synthesis, keyed by dimension.
    pub per_dimension: BTreeMap<String, DimensionResult>,
    /// Required dimensions that were absent at synthesis time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_dimensions: Vec<String>,
    pub synthesized_at: DateTime<Utc>,
    pub status: AssessmentStatus,
    /// Pipeline version whose dimension set was applied.
    pub pipeline_version: String,
}

impl FinalAssessment {
    pub fn key(&self) -> BatchKey {
        BatchKey::new(&self.customer_id, &self.batch_id)
    }

    pub fn is_complete(&self) -> bool {
        self.status == AssessmentStatus::Complete
    }

    /// Supersession order between assessments of one customer: newer
    /// batches first by arrival, then by synthesis time.
    pub fn recency(&self, other: &FinalAssessment) -> std::cmp::Ordering {
        self.captured_at
            .cmp(&other.captured_at)
            .then_with(|| self.synthesized_at.cmp(&other.synthesized_at))
            .then_with(|| self.batch_id.cmp(&other.batch_id))
    }
}

//! Error types for the pipeline.
//!
//! Scoring errors never leave an agent worker; they are converted into
//! zero-confidence results. Store errors are fatal for the current
//! invocation and rely on re-delivery of the triggering event.

use crate::models::BatchKey;
use thiserror::Error;

/// Failure of a persisted store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("{store} unavailable: {reason}")]
    Unavailable { store: &'static str, reason: String },

    /// A write contradicted an immutable record.
    #[error("conflicting write for {key}: {reason}")]
    Conflict { key: BatchKey, reason: String },
}

/// Failure of a scoring function.
#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("payload is empty")]
    EmptyPayload,

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("scorer failed: {0}")]
    Failed(String),
}

/// Pipeline-level errors surfaced to the caller of an invocation.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("notification for {key} failed: {reason}")]
    Notify { key: BatchKey, reason: String },

    #[error("no scorer registered for dimension `{0}`")]
    UnknownDimension(String),

    #[error("worker task for {key} panicked or was cancelled: {reason}")]
    Join { key: BatchKey, reason: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

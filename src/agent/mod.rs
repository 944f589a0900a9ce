//! Agent workers and their scoring functions.
//!
//! This module provides the pluggable per-dimension scorers and the
//! stateless worker that runs them against an observation batch.

pub mod scorers;
pub mod worker;

pub use scorers::{Scorer, ScorerRegistry};
pub use worker::AgentWorker;

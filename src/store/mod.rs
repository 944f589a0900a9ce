//! Persisted state of the pipeline.
//!
//! Three stores are shared between workers: the observation store, the
//! result ledger and the assessment store. Each is a port trait with an
//! in-memory implementation whose writes are atomic per key.

pub mod assessments;
pub mod ledger;
pub mod observations;

pub use assessments::{AssessmentStore, CommitOutcome, InMemoryAssessmentStore};
pub use ledger::{InMemoryResultLedger, ResultLedger, UpsertOutcome};
pub use observations::{AppendOutcome, InMemoryObservationStore, ObservationStore};

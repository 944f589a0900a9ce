//! Fan-out/fan-in orchestration.
//!
//! One batch fans out to every agent worker; each worker's ledger write
//! triggers the completion detector, and the last one in synthesizes.

pub mod detector;
pub mod orchestrator;
pub mod synthesizer;

pub use detector::{CompletionDetector, Detection};
pub use orchestrator::{BatchReport, Pipeline, PipelineBuilder};
pub use synthesizer::{combine, NoOpReason, SynthesisOutcome, Synthesizer};

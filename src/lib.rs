//! RiskWeave - multi-agent risk assessment pipeline
//!
//! Independent analysis agents score each observation batch along one
//! dimension apiece; their results fan back in to a synthesizer that
//! writes exactly one assessment per batch and notifies subscribers.
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use riskweave::config::Config;
//! use riskweave::pipeline::PipelineBuilder;
//!
//! let config = Config::default();
//! let pipeline = PipelineBuilder::from_config(&config)
//!     .notifier(riskweave::notify::from_config(&config.notifier)?)
//!     .build()?;
//! let latest = pipeline.latest("C1").await?;
//! # let _ = latest;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod cli;
pub mod config;
pub mod error;
pub mod input;
pub mod models;
pub mod notify;
pub mod pipeline;
pub mod store;

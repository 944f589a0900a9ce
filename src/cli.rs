//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use clap::Parser;
use std::path::PathBuf;

/// RiskWeave - multi-agent risk assessment pipeline
///
/// Feeds observation batches through every analysis agent and prints the
/// synthesized per-customer risk assessments.
///
/// Examples:
///   riskweave batches.jsonl
///   riskweave ./inbox --concurrency 8 --notify-file assessments.jsonl
///   riskweave batches.json --finalize --fail-on high
///   riskweave --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Observation batches to ingest
    ///
    /// A .json file (one batch or an array), a .jsonl file (one batch per
    /// line), or a directory searched recursively for both.
    #[arg(value_name = "PATH", required_unless_present = "init_config")]
    pub input: Option<PathBuf>,

    /// Path to configuration file
    ///
    /// If not specified, looks for .riskweave.toml in the current directory
    #[arg(short, long, value_name = "FILE", env = "RISKWEAVE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Maximum number of agent invocations running at once
    #[arg(long, value_name = "NUM")]
    pub concurrency: Option<usize>,

    /// Seconds a batch may wait for all dimensions before a partial assessment
    #[arg(long, value_name = "SECS")]
    pub deadline_secs: Option<u64>,

    /// Append assessments as JSON lines to this file instead of stdout
    #[arg(long, value_name = "FILE")]
    pub notify_file: Option<PathBuf>,

    /// Force partial assessments for every batch still incomplete after ingestion
    #[arg(long)]
    pub finalize: bool,

    /// Fail if any assessment lands at or above this category
    ///
    /// Useful for CI pipelines. Exit code 2 when threshold is reached.
    /// Values: low, medium, high
    #[arg(long, value_name = "LEVEL")]
    pub fail_on: Option<FailOnLevel>,

    /// Generate a default .riskweave.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

/// Risk category threshold for --fail-on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum)]
pub enum FailOnLevel {
    Low,
    Medium,
    High,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        if self.init_config {
            return Ok(());
        }

        match self.input {
            Some(ref input) if !input.exists() => {
                return Err(format!("Input path does not exist: {}", input.display()));
            }
            None => return Err("An input file or directory is required".to_string()),
            _ => {}
        }

        if self.concurrency == Some(0) {
            return Err("Concurrency must be at least 1".to_string());
        }

        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}

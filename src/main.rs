//! RiskWeave - multi-agent risk assessment pipeline
//!
//! A CLI driver that feeds observation batches through independent
//! analysis agents, fans their results back in, and emits one
//! synthesized risk assessment per batch.
//!
//! Exit codes:
//!   0 - Success (no assessment above threshold, or no --fail-on set)
//!   1 - Runtime error (config, input, store failure, etc.)
//!   2 - Assessments found at or above the --fail-on category

use anyhow::{Context, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use riskweave::cli::{Args, FailOnLevel};
use riskweave::config::{self, Config};
use riskweave::error::PipelineError;
use riskweave::models::{AssessmentStatus, BatchKey, FinalAssessment, RiskCategory};
use riskweave::pipeline::{BatchReport, PipelineBuilder};
use riskweave::{input, notify};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

/// Print run chatter, moved to stderr when notifications own stdout.
macro_rules! say {
    ($to_stderr:expr, $($arg:tt)*) => {
        if $to_stderr {
            eprintln!($($arg)*);
        } else {
            println!($($arg)*);
        }
    };
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    // Initialize logging
    init_logging(&args);

    info!("RiskWeave v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    // Run the pipeline
    match run(args).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Run failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .riskweave.toml.
fn handle_init_config() -> Result<()> {
    let path = std::path::Path::new(config::DEFAULT_CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            config::DEFAULT_CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", config::DEFAULT_CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", config::DEFAULT_CONFIG_FILE);
    println!("   Edit it to customize dimensions, weights, thresholds, and the notifier.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args) {
    let level = args.log_level();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Tally of one run.
#[derive(Debug, Default)]
struct RunSummary {
    batches: usize,
    redelivered: usize,
    failed: usize,
    undelivered: usize,
    complete: usize,
    partial: usize,
    low: usize,
    medium: usize,
    high: usize,
}

impl RunSummary {
    fn record(&mut self, assessment: &FinalAssessment) {
        match assessment.status {
            AssessmentStatus::Complete => self.complete += 1,
            AssessmentStatus::Partial => self.partial += 1,
        }
        match assessment.category {
            RiskCategory::Low => self.low += 1,
            RiskCategory::Medium => self.medium += 1,
            RiskCategory::High => self.high += 1,
        }
    }

    fn pending(&self) -> usize {
        self.batches
            .saturating_sub(self.redelivered + self.failed + self.complete + self.partial)
    }
}

/// Run the pipeline over the input. Returns exit code (0 or 2).
async fn run(args: Args) -> Result<i32> {
    let start_time = Instant::now();

    // Load configuration
    let mut config = load_config(&args)?;
    config.merge_with_args(&args);
    config.validate()?;
    let to_stderr = config.notifier.writes_stdout();

    let input = args
        .input
        .clone()
        .context("An input file or directory is required")?;

    // Step 1: Load the input batches
    say!(to_stderr, "📥 Loading batches from {}", input.display());
    let batches = input::load_batches(&input)?;
    say!(to_stderr, "   Found {} batches", batches.len());

    // Step 2: Assemble the pipeline
    let notifier = notify::from_config(&config.notifier)?;
    let pipeline = PipelineBuilder::from_config(&config)
        .notifier(notifier)
        .build()
        .context("Failed to assemble pipeline")?;

    say!(
        to_stderr,
        "🤖 Pipeline {} with dimensions: {}",
        pipeline.required().version(),
        pipeline.required().iter().collect::<Vec<_>>().join(", ")
    );
    say!(to_stderr, "   Concurrency: {}", config.general.concurrency);
    say!(to_stderr, "   Deadline: {}s", config.pipeline.synthesis_deadline_secs);

    // Step 3: Ingest every batch with bounded concurrency
    let progress = if args.quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(batches.len() as u64)
    };
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    let mut summary = RunSummary {
        batches: batches.len(),
        ..RunSummary::default()
    };
    let mut assessments: BTreeMap<BatchKey, FinalAssessment> = BTreeMap::new();

    let results: Vec<_> = stream::iter(batches)
        .map(|batch| {
            let pipeline = &pipeline;
            let progress = &progress;
            async move {
                let key = batch.key();
                let result = pipeline.ingest(batch).await;
                progress.inc(1);
                (key, result)
            }
        })
        .buffer_unordered(config.general.concurrency)
        .collect()
        .await;
    progress.finish_and_clear();

    // Step 4: Collect what ingestion synthesized
    let mut undelivered: BTreeSet<BatchKey> = BTreeSet::new();
    for (key, result) in results {
        match result {
            Ok(BatchReport {
                assessment: Some(assessment),
                ..
            }) => {
                assessments.insert(key, assessment);
            }
            Ok(BatchReport {
                redelivered: true, ..
            }) => summary.redelivered += 1,
            Ok(report) => debug!("Batch {} still waiting after ingestion", report.key),
            Err(PipelineError::Notify { reason, .. }) => {
                // Committed but not delivered: it still counts towards --fail-on.
                warn!("Assessment for {} stored but not delivered: {}", key, reason);
                if let Some(stored) = pipeline.assessment(&key).await? {
                    assessments.insert(key.clone(), stored);
                }
                undelivered.insert(key);
            }
            Err(e) => {
                warn!("Batch {} failed: {}", key, e);
                summary.failed += 1;
            }
        }
    }

    // Step 5: Force partials for overdue (or, with --finalize, all) batches
    let swept = if args.finalize {
        pipeline.finalize_pending().await
    } else {
        pipeline.sweep_overdue(Utc::now()).await
    };
    for assessment in swept.context("Failed to finalize pending batches")? {
        let key = assessment.key();
        undelivered.remove(&key);
        assessments.insert(key, assessment);
    }
    summary.undelivered = undelivered.len();

    for assessment in assessments.values() {
        summary.record(assessment);
    }

    // Print summary
    let duration = start_time.elapsed().as_secs_f64();
    say!(to_stderr, "\n📊 Run Summary:");
    say!(to_stderr, "   Batches: {}", summary.batches);
    say!(
        to_stderr,
        "   Assessments: {} complete | {} partial",
        summary.complete, summary.partial
    );
    say!(
        to_stderr,
        "   - {} High: {} | {} Medium: {} | {} Low: {}",
        RiskCategory::High.emoji(),
        summary.high,
        RiskCategory::Medium.emoji(),
        summary.medium,
        RiskCategory::Low.emoji(),
        summary.low
    );
    if summary.redelivered > 0 {
        say!(to_stderr, "   Re-delivered: {}", summary.redelivered);
    }
    if summary.pending() > 0 {
        say!(to_stderr, "   Still waiting: {} (use --finalize to force)", summary.pending());
    }
    if summary.failed > 0 {
        say!(to_stderr, "   Failed: {}", summary.failed);
    }
    if summary.undelivered > 0 {
        say!(to_stderr, "   Undelivered: {}", summary.undelivered);
    }
    say!(to_stderr, "   Duration: {:.1}s", duration);

    // Check --fail-on threshold
    if let Some(fail_level) = args.fail_on {
        let threshold = fail_on_to_category(fail_level);
        let has_assessments_above = assessments.values().any(|a| a.category >= threshold);

        if has_assessments_above {
            eprintln!(
                "\n⛔ Assessments found at or above {} risk. Failing (exit code 2).",
                threshold
            );
            return Ok(2);
        }
    }

    if summary.failed > 0 || summary.undelivered > 0 {
        anyhow::bail!(
            "{} batches failed and {} notifications were not delivered; re-deliver them to retry",
            summary.failed,
            summary.undelivered
        );
    }

    say!(to_stderr, "\n✅ Run complete!");
    Ok(0)
}

/// Convert FailOnLevel to RiskCategory for comparison.
fn fail_on_to_category(level: FailOnLevel) -> RiskCategory {
    match level {
        FailOnLevel::Low => RiskCategory::Low,
        FailOnLevel::Medium => RiskCategory::Medium,
        FailOnLevel::High => RiskCategory::High,
    }
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    match Config::load_default() {
        Ok(Some(config)) => {
            info!("Loaded default config from {}", config::DEFAULT_CONFIG_FILE);
            Ok(config)
        }
        Ok(None) => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            warn!("Failed to load config: {}", e);
            Ok(Config::default())
        }
    }
}

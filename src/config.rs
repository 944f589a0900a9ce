//! Configuration file handling.
//!
//! This module handles loading, validating and merging configuration from
//! `.riskweave.toml` files, and derives the static pipeline policy
//! (required dimensions, weights, category thresholds) from it.

use crate::models::RiskCategory;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::time::Duration;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = ".riskweave.toml";

/// Upper bound for time windows in seconds, about 100 years.
pub const MAX_WINDOW_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Pipeline policy.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Notification sink settings.
    #[serde(default)]
    pub notifier: NotifierConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,

    /// Number of concurrently running agent workers.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            concurrency: default_concurrency(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

/// Static synthesis policy. Constant for the lifetime of a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline version the dimension set is bound to.
    #[serde(default = "default_version")]
    pub version: String,

    /// Dimensions that must all be present before a complete synthesis.
    #[serde(default = "default_required_dimensions")]
    pub required_dimensions: Vec<String>,

    /// Age after which a stuck batch may be force-synthesized as partial.
    #[serde(default = "default_deadline")]
    pub synthesis_deadline_secs: u64,

    /// Visibility window of result ledger records.
    #[serde(default = "default_result_ttl")]
    pub result_ttl_secs: u64,

    /// Per-dimension weights. Dimensions not listed weigh 1.0.
    #[serde(default = "default_weights")]
    pub weights: BTreeMap<String, f64>,

    /// Category cut-points on the overall score.
    #[serde(default)]
    pub thresholds: Thresholds,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            required_dimensions: default_required_dimensions(),
            synthesis_deadline_secs: default_deadline(),
            result_ttl_secs: default_result_ttl(),
            weights: default_weights(),
            thresholds: Thresholds::default(),
        }
    }
}

fn default_version() -> String {
    "v1".to_string()
}

fn default_required_dimensions() -> Vec<String> {
    vec!["behavioral", "sentiment", "financial"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_deadline() -> u64 {
    900 // 15 min
}

fn default_result_ttl() -> u64 {
    7 * 24 * 3600
}

fn default_weights() -> BTreeMap<String, f64> {
    default_required_dimensions()
        .into_iter()
        .map(|d| (d, 1.0))
        .collect()
}

/// Category cut-points. A score at or above a cut-point falls in that band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default = "default_medium")]
    pub medium: f64,
    #[serde(default = "default_high")]
    pub high: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            medium: default_medium(),
            high: default_high(),
        }
    }
}

fn default_medium() -> f64 {
    0.4
}

fn default_high() -> f64 {
    0.7
}

impl Thresholds {
    /// Maps an overall score onto its category.
    pub fn categorize(&self, score: f64) -> RiskCategory {
        if score >= self.high {
            RiskCategory::High
        } else if score >= self.medium {
            RiskCategory::Medium
        } else {
            RiskCategory::Low
        }
    }
}

/// Kind of notification sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifierKind {
    #[default]
    Stdout,
    Jsonl,
    Webhook,
}

/// Notification sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    #[serde(default)]
    pub kind: NotifierKind,

    /// Target file for the `jsonl` sink.
    #[serde(default = "default_notify_path")]
    pub path: String,

    /// Target URL for the `webhook` sink.
    #[serde(default)]
    pub url: String,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Number of delivery attempts before giving up.
    #[serde(default = "default_retries")]
    pub retries: usize,
}

impl NotifierConfig {
    /// Whether notifications are written to stdout.
    pub fn writes_stdout(&self) -> bool {
        self.kind == NotifierKind::Stdout
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            kind: NotifierKind::default(),
            path: default_notify_path(),
            url: String::new(),
            timeout_seconds: default_timeout(),
            retries: default_retries(),
        }
    }
}

fn default_notify_path() -> String {
    "assessments.jsonl".to_string()
}

fn default_timeout() -> u64 {
    10
}

fn default_retries() -> usize {
    3
}

/// The set of dimensions a batch must accumulate before complete synthesis.
///
/// Built once from configuration and bound to a pipeline version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredDimensionSet {
    version: String,
    dimensions: BTreeSet<String>,
}

impl RequiredDimensionSet {
    pub fn new<I, S>(version: impl Into<String>, dimensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            version: version.into(),
            dimensions: dimensions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn len(&self) -> usize {
        self.dimensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty()
    }

    pub fn contains(&self, dimension: &str) -> bool {
        self.dimensions.contains(dimension)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.dimensions.iter().map(String::as_str)
    }

    /// Required dimensions absent from `present`, in sorted order.
    pub fn missing<'a, I>(&self, present: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let present: HashSet<&str> = present.into_iter().collect();
        self.dimensions
            .iter()
            .filter(|d| !present.contains(d.as_str()))
            .cloned()
            .collect()
    }
}

/// Weights and thresholds applied by the synthesizer.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringPolicy {
    pub weights: BTreeMap<String, f64>,
    pub thresholds: Thresholds,
}

impl ScoringPolicy {
    /// Weight of a dimension, 1.0 when not configured.
    pub fn weight(&self, dimension: &str) -> f64 {
        self.weights.get(dimension).copied().unwrap_or(1.0)
    }
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            weights: BTreeMap::new(),
            thresholds: Thresholds::default(),
        }
    }
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Check the static policy for values that would make synthesis meaningless.
    pub fn validate(&self) -> Result<()> {
        let pipeline = &self.pipeline;

        if pipeline.required_dimensions.is_empty() {
            bail!("pipeline.required_dimensions must not be empty");
        }

        let mut seen = HashSet::new();
        for dimension in &pipeline.required_dimensions {
            if dimension.trim().is_empty() {
                bail!("pipeline.required_dimensions contains an empty name");
            }
            if !seen.insert(dimension.as_str()) {
                bail!("pipeline.required_dimensions lists `{}` twice", dimension);
            }
        }

        for (dimension, weight) in &pipeline.weights {
            if !weight.is_finite() || *weight < 0.0 {
                bail!("weight for `{}` must be a finite non-negative number", dimension);
            }
        }

        let t = pipeline.thresholds;
        if !(0.0..=1.0).contains(&t.medium) || !(0.0..=1.0).contains(&t.high) || t.medium > t.high
        {
            bail!(
                "thresholds must satisfy 0 <= medium <= high <= 1 (got medium={}, high={})",
                t.medium,
                t.high
            );
        }

        if self.general.concurrency == 0 {
            bail!("general.concurrency must be at least 1");
        }

        if pipeline.synthesis_deadline_secs > MAX_WINDOW_SECS {
            bail!(
                "pipeline.synthesis_deadline_secs must be at most {} (got {})",
                MAX_WINDOW_SECS,
                pipeline.synthesis_deadline_secs
            );
        }
        if pipeline.result_ttl_secs > MAX_WINDOW_SECS {
            bail!(
                "pipeline.result_ttl_secs must be at most {} (got {})",
                MAX_WINDOW_SECS,
                pipeline.result_ttl_secs
            );
        }

        if self.notifier.kind == NotifierKind::Webhook
            && !self.notifier.url.starts_with("http://")
            && !self.notifier.url.starts_with("https://")
        {
            bail!("notifier.url must start with 'http://' or 'https://' for the webhook sink");
        }

        Ok(())
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings, but only
    /// when they were given explicitly.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(concurrency) = args.concurrency {
            self.general.concurrency = concurrency;
        }

        if let Some(deadline) = args.deadline_secs {
            self.pipeline.synthesis_deadline_secs = deadline;
        }

        if let Some(ref path) = args.notify_file {
            self.notifier.kind = NotifierKind::Jsonl;
            self.notifier.path = path.display().to_string();
        }

        if args.verbose {
            self.general.verbose = true;
        }
    }

    pub fn required_dimensions(&self) -> RequiredDimensionSet {
        RequiredDimensionSet::new(
            self.pipeline.version.clone(),
            self.pipeline.required_dimensions.iter().cloned(),
        )
    }

    pub fn scoring_policy(&self) -> ScoringPolicy {
        ScoringPolicy {
            weights: self.pipeline.weights.clone(),
            thresholds: self.pipeline.thresholds,
        }
    }

    pub fn synthesis_deadline(&self) -> Duration {
        Duration::from_secs(self.pipeline.synthesis_deadline_secs)
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.pipeline.result_ttl_secs)
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

//! Loading observation batches from disk.
//!
//! Accepts `.json` files holding one batch or an array of batches,
//! `.jsonl` files with one batch per line, and directories containing
//! either. Hidden entries are skipped.

use crate::models::ObservationBatch;
use anyhow::{Context, Result};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Load every batch found at `path`, in file order.
pub fn load_batches(path: &Path) -> Result<Vec<ObservationBatch>> {
    let files = if path.is_dir() {
        discover(path)
    } else {
        vec![path.to_path_buf()]
    };

    let mut batches = Vec::new();
    for file in &files {
        let loaded = load_file(file)?;
        debug!("Loaded {} batches from {}", loaded.len(), file.display());
        batches.extend(loaded);
    }

    Ok(batches)
}

/// Find batch files below a directory, sorted by path.
fn discover(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.file_name().to_str()))
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && is_batch_file(entry.path()))
        .map(|entry| entry.into_path())
        .collect();

    files.sort();
    files
}

fn is_hidden(name: Option<&str>) -> bool {
    name.map(|n| n.starts_with('.')).unwrap_or(false)
}

fn is_batch_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("json") | Some("jsonl")
    )
}

fn load_file(path: &Path) -> Result<Vec<ObservationBatch>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
        return content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("Invalid batch at {}:{}", path.display(), n + 1))
            })
            .collect();
    }

    let value: Value = serde_json::from_str(&content)
        .with_context(|| format!("Invalid JSON in {}", path.display()))?;

    let batches = match value {
        Value::Array(_) => serde_json::from_value(value),
        other => serde_json::from_value(other).map(|batch| vec![batch]),
    };

    batches.with_context(|| format!("Invalid batch in {}", path.display()))
}

//! Append-only delegation log.
//!
//! Every routing attempt (success, failure, skip, cancel) becomes one
//! [`AttemptRecord`], written as a JSON line to `router.log_path` and kept
//! in memory for the life of the process. Entries are never rewritten.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use context_relay_core::routing::{AttemptOutcome, AttemptRecord};

pub struct DelegationLog {
    path: Option<PathBuf>,
    inner: Mutex<LogInner>,
}

struct LogInner {
    file: Option<File>,
    entries: Vec<AttemptRecord>,
}

impl DelegationLog {
    /// Log that only keeps entries in memory.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            inner: Mutex::new(LogInner {
                file: None,
                entries: Vec::new(),
            }),
        }
    }

    /// Log that also appends to `path`, creating it if needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open delegation log {}", path.display()))?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            inner: Mutex::new(LogInner {
                file: Some(file),
                entries: Vec::new(),
            }),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one entry. The in-memory copy is kept even if the file write
    /// fails; the error is returned so the caller can report it.
    pub fn append(&self, record: AttemptRecord) -> Result<()> {
        let line = serde_json::to_string(&record)?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.push(record);
        if let Some(file) = inner.file.as_mut() {
            writeln!(file, "{}", line).context("Failed to append to delegation log")?;
            file.flush()?;
        }
        Ok(())
    }

    pub fn entries(&self) -> Vec<AttemptRecord> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .clone()
    }

    pub fn entries_for(&self, task_id: &str) -> Vec<AttemptRecord> {
        self.entries()
            .into_iter()
            .filter(|r| r.task_id == task_id)
            .collect()
    }
}

/// Read a JSONL delegation log. Malformed lines are skipped with a warning.
pub fn read_log(path: &Path) -> Result<Vec<AttemptRecord>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open delegation log {}", path.display()))?;
    let mut entries = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AttemptRecord>(&line) {
            Ok(record) => entries.push(record),
            Err(err) => tracing::warn!(line = n + 1, error = %err, "skipping malformed log line"),
        }
    }
    Ok(entries)
}

/// Per-model routing summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelStats {
    pub model: String,
    pub attempts: usize,
    pub successes: usize,
    pub transient_failures: usize,
    pub capability_failures: usize,
    pub skipped: usize,
    pub cancelled: usize,
    /// Successes over attempts that reached the backend.
    pub success_rate: f64,
    pub mean_latency_ms: f64,
    pub total_tokens: usize,
}

/// Summarise entries per model, sorted by model name.
pub fn log_stats(entries: &[AttemptRecord]) -> Vec<ModelStats> {
    let mut by_model: BTreeMap<&str, (ModelStats, u64, usize)> = BTreeMap::new();

    for record in entries {
        let (stats, latency_sum, called) = by_model
            .entry(record.model.as_str())
            .or_insert_with(|| {
                (
                    ModelStats {
                        model: record.model.clone(),
                        ..Default::default()
                    },
                    0,
                    0,
                )
            });
        stats.attempts += 1;
        stats.total_tokens += record.token_cost;
        match record.outcome {
            AttemptOutcome::Success => stats.successes += 1,
            AttemptOutcome::Transient => stats.transient_failures += 1,
            AttemptOutcome::Capability => stats.capability_failures += 1,
            AttemptOutcome::Skipped => stats.skipped += 1,
            AttemptOutcome::Cancelled => stats.cancelled += 1,
        }
        if matches!(
            record.outcome,
            AttemptOutcome::Success | AttemptOutcome::Transient | AttemptOutcome::Capability
        ) {
            *called += 1;
            *latency_sum += record.latency_ms;
        }
    }

    by_model
        .into_values()
        .map(|(mut stats, latency_sum, called)| {
            if called > 0 {
                stats.success_rate = stats.successes as f64 / called as f64;
                stats.mean_latency_ms = latency_sum as f64 / called as f64;
            }
            stats
        })
        .collect()
}

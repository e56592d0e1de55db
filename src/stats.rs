//! Delegation log statistics.
//!
//! Summarises the append-only delegation log per model: attempts, success
//! rate, mean latency, token cost and when the model was last used. Used by
//! `relay log stats` to show which models are actually carrying the load.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};

use context_relay_core::routing::AttemptRecord;

use crate::config::Config;
use crate::delegation_log::{log_stats, read_log, ModelStats};

/// Run the stats command: read the log and print a summary.
pub fn run_log_stats(config: &Config, json: bool) -> Result<()> {
    let Some(path) = config.router.log_path.as_ref() else {
        bail!("router.log_path is not set; no delegation log to read");
    };
    if !path.exists() {
        println!("No delegation log at {} yet.", path.display());
        return Ok(());
    }

    let entries = read_log(path)?;
    let stats = log_stats(&entries);

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    let tasks = {
        let mut ids: Vec<&str> = entries.iter().map(|e| e.task_id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    };

    println!("Context Relay: Delegation Log");
    println!("=============================");
    println!();
    println!("  Log:         {}", path.display());
    println!("  Size:        {}", format_bytes(size));
    println!();
    println!("  Tasks:       {}", tasks);
    println!("  Attempts:    {}", entries.len());
    println!(
        "  Tokens:      {}",
        stats.iter().map(|s| s.total_tokens).sum::<usize>()
    );

    if !stats.is_empty() {
        println!();
        println!("  By model:");
        println!(
            "  {:<20} {:>8} {:>7} {:>9} {:>10} {:>10}   {}",
            "MODEL", "ATTEMPTS", "OK", "FAILED", "LATENCY", "TOKENS", "LAST USED"
        );
        println!("  {}", "-".repeat(86));
        for s in &stats {
            println!(
                "  {:<20} {:>8} {:>6.0}% {:>9} {:>8.0}ms {:>10}   {}",
                s.model,
                s.attempts,
                s.success_rate * 100.0,
                s.transient_failures + s.capability_failures,
                s.mean_latency_ms,
                s.total_tokens,
                last_used(&entries, s)
                    .map(format_relative)
                    .unwrap_or_else(|| "never".to_string())
            );
        }
    }

    println!();
    Ok(())
}

fn last_used(entries: &[AttemptRecord], stats: &ModelStats) -> Option<DateTime<Utc>> {
    entries
        .iter()
        .filter(|e| e.model == stats.model)
        .map(|e| e.at)
        .max()
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

/// Format a timestamp relative to now (e.g. "3 hours ago").
fn format_relative(at: DateTime<Utc>) -> String {
    let delta = (Utc::now() - at).num_seconds();

    if delta < 0 {
        at.format("%Y-%m-%d %H:%M").to_string()
    } else if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        at.format("%Y-%m-%d %H:%M").to_string()
    }
}

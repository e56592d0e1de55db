//! Batch progress reporting.
//!
//! Reports observable progress while `relay batch` drains the queue so users
//! see which task is running, on which model, and how much is left.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

use crate::queue::TaskStatus;

/// A single progress event for the batch queue.
#[derive(Clone, Debug)]
pub enum QueueProgressEvent {
    /// A task was claimed and handed to the router (or planned, in dry runs).
    Started {
        task_id: String,
        model: Option<String>,
        chunks: usize,
    },
    /// A task reached a terminal status.
    Finished {
        task_id: String,
        status: TaskStatus,
        done: u64,
        remaining: u64,
    },
}

/// Reports queue progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: QueueProgressEvent);
}

/// Human-friendly progress on stderr: "batch 1a2b3c4d  succeeded  12 done, 1,204 left".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: QueueProgressEvent) {
        let line = match &event {
            QueueProgressEvent::Started {
                task_id,
                model,
                chunks,
            } => format!(
                "batch {}  started  model={} chunks={}\n",
                short_id(task_id),
                model.as_deref().unwrap_or("-"),
                chunks
            ),
            QueueProgressEvent::Finished {
                task_id,
                status,
                done,
                remaining,
            } => format!(
                "batch {}  {}  {} done, {} left\n",
                short_id(task_id),
                status.as_str(),
                format_number(*done),
                format_number(*remaining)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: QueueProgressEvent) {
        let obj = match &event {
            QueueProgressEvent::Started {
                task_id,
                model,
                chunks,
            } => serde_json::json!({
                "event": "progress",
                "phase": "started",
                "task_id": task_id,
                "model": model,
                "chunks": chunks
            }),
            QueueProgressEvent::Finished {
                task_id,
                status,
                done,
                remaining,
            } => serde_json::json!({
                "event": "progress",
                "phase": "finished",
                "task_id": task_id,
                "status": status.as_str(),
                "done": done,
                "remaining": remaining
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: QueueProgressEvent) {}
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Parse `auto|human|json|off`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(Self::default_for_tty()),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            "off" => Some(ProgressMode::Off),
            _ => None,
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

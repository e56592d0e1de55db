//! Error taxonomy shared by the cache, assembler, router and queue.
//!
//! Transient delivery errors are retried inside the router and only
//! surface once the retry bound is spent. Capability and configuration
//! errors surface immediately. An empty context package is not an error:
//! see [`EmptyReason`](crate::models::EmptyReason).

use serde::Serialize;

use crate::routing::AttemptRecord;

/// Top-level error enum for Context Relay.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The indexer failed to produce a document (parse error, crashed command).
    #[error("indexer failure: {0}")]
    IndexerFailure(String),

    /// A persisted cache record could not be read or decoded.
    #[error("cache record at {path} is unreadable: {reason}")]
    CacheCorruption { path: String, reason: String },

    /// Indexer output declared a schema version this build does not understand.
    #[error("unsupported index schema_version {found} (expected {expected})")]
    SchemaVersion { found: u32, expected: u32 },

    /// A model rejected the request or cannot serve it.
    #[error("model '{model}' unavailable: {reason}")]
    ModelUnavailable { model: String, reason: String },

    /// Timeout or rate limit that outlived the retry budget.
    #[error("transient delivery error on '{model}': {reason}")]
    TransientDelivery { model: String, reason: String },

    /// Every candidate model failed or was unsuitable.
    #[error(
        "task {task_id}: all {} candidate model(s) exhausted after {} attempt(s) ({fragment_count} fragments); last error: {last_error}",
        .models_tried.len(),
        .attempts.len()
    )]
    AllModelsExhausted {
        task_id: String,
        models_tried: Vec<String>,
        fragment_count: usize,
        last_error: String,
        attempts: Vec<AttemptRecord>,
    },

    /// The task was cancelled. `partial` is set when some chunks had already
    /// completed and their output was dropped.
    #[error("task {task_id} cancelled (partial result: {partial})")]
    Cancelled {
        task_id: String,
        partial: bool,
        completed_chunks: usize,
    },

    /// The worker running a task stopped without producing an outcome.
    #[error("task {task_id} worker aborted: {reason}")]
    WorkerAborted { task_id: String, reason: String },

    #[error("unknown scenario '{0}'")]
    UnknownScenario(String),

    #[error("unknown model '{0}'")]
    UnknownModel(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RelayError {
    /// Stable, machine-readable kind label used in logs and JSON output.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::IndexerFailure(_) => ErrorKind::IndexerFailure,
            RelayError::CacheCorruption { .. } => ErrorKind::CacheCorruption,
            RelayError::SchemaVersion { .. } => ErrorKind::Config,
            RelayError::ModelUnavailable { .. } => ErrorKind::ModelUnavailable,
            RelayError::TransientDelivery { .. } => ErrorKind::TransientDelivery,
            RelayError::AllModelsExhausted { .. } => ErrorKind::AllModelsExhausted,
            RelayError::Cancelled { .. } => ErrorKind::Cancelled,
            RelayError::WorkerAborted { .. } => ErrorKind::Internal,
            RelayError::UnknownScenario(_)
            | RelayError::UnknownModel(_)
            | RelayError::Config(_) => ErrorKind::Config,
            RelayError::Io(_) | RelayError::Json(_) => ErrorKind::Io,
        }
    }

    /// Attempt history, if this error carries one.
    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            RelayError::AllModelsExhausted { attempts, .. } => attempts,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    IndexerFailure,
    CacheCorruption,
    ModelUnavailable,
    TransientDelivery,
    AllModelsExhausted,
    Cancelled,
    Internal,
    Config,
    Io,
}

pub type RelayResult<T> = Result<T, RelayError>;

//! Validity cache over the indexer.
//!
//! The cache holds at most one [`CacheRecord`]: an [`IndexDocument`] plus
//! the fingerprint of the tree it was built from. Every read recomputes the
//! fingerprint and only trusts the record on an exact match.
//!
//! # Concurrency
//!
//! The record sits behind an `RwLock<Option<Arc<CacheRecord>>>` and is only
//! ever replaced whole, so readers see the old record or the new one.
//! Rebuilds are serialised by an async build lock. A caller that loses the
//! race re-checks the record after acquiring the lock and returns the
//! winner's document instead of indexing again.
//!
//! # Persistence
//!
//! The record is written to `cache.path` through a temp file and a rename.
//! On open, an unreadable or undecodable file is discarded and logged; the
//! next read rebuilds.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use context_relay_core::error::RelayError;
use context_relay_core::models::{IndexDocument, SCHEMA_VERSION};
use context_relay_core::search::{search_index, SearchHit};
use context_relay_core::tokens::TokenEstimator;

use crate::config::CacheConfig;
use crate::fingerprint::{Fingerprint, SourceTree};
use crate::indexer::Indexer;

/// A document and the fingerprint it is valid for. Replaced, never edited.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheRecord {
    pub fingerprint: String,
    pub generated_at: DateTime<Utc>,
    pub file_count: usize,
    pub document: IndexDocument,
}

/// How a lookup was served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CacheStatus {
    /// Fingerprint matched; the indexer was not invoked.
    Hit,
    /// No record existed; one was built.
    Built,
    /// The record was out of date (or invalidated) and was replaced.
    Rebuilt,
    /// The indexer failed; the last good record is returned as-is.
    StaleButAvailable { reason: String },
}

#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub record: Arc<CacheRecord>,
    pub status: CacheStatus,
}

impl CacheLookup {
    pub fn document(&self) -> &IndexDocument {
        &self.record.document
    }

    pub fn fingerprint(&self) -> &str {
        &self.record.fingerprint
    }

    pub fn is_stale(&self) -> bool {
        matches!(self.status, CacheStatus::StaleButAvailable { .. })
    }

    /// Keyword search over this resolved document. Never touches the indexer.
    pub fn search(&self, query: &str, limit: usize, estimator: &TokenEstimator) -> Vec<SearchHit> {
        search_index(self.document(), query, limit, estimator)
    }
}

/// What happened to the persisted file when the cache was opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PersistedState {
    NotFound,
    Loaded,
    DiscardedCorrupt { reason: String },
}

/// Snapshot for `relay status`.
#[derive(Debug, Clone, Serialize)]
pub struct CacheReport {
    pub path: PathBuf,
    pub source_root: PathBuf,
    pub fingerprint: Option<String>,
    pub generated_at: Option<DateTime<Utc>>,
    pub module_count: usize,
    pub persisted: PersistedState,
    pub invalidated: bool,
    /// Reason of the last indexer failure, while the record is stale.
    pub stale_reason: Option<String>,
}

pub struct ValidityCache {
    tree: SourceTree,
    indexer: Arc<dyn Indexer>,
    path: PathBuf,
    record: RwLock<Option<Arc<CacheRecord>>>,
    build_lock: tokio::sync::Mutex<()>,
    invalidated: AtomicBool,
    persisted: PersistedState,
    stale_reason: Mutex<Option<String>>,
}

impl ValidityCache {
    /// Open the cache, loading a persisted record if one is readable.
    pub fn open(config: &CacheConfig, indexer: Arc<dyn Indexer>) -> Result<Self> {
        let tree = SourceTree::new(config)?;
        let (record, persisted) = match load_record(&config.path) {
            Ok(Some(record)) => {
                tracing::debug!(path = %config.path.display(), "loaded persisted cache record");
                (Some(Arc::new(record)), PersistedState::Loaded)
            }
            Ok(None) => (None, PersistedState::NotFound),
            Err(err) => {
                tracing::warn!(
                    path = %config.path.display(),
                    error = %err,
                    "discarding unreadable cache record; next read rebuilds"
                );
                (
                    None,
                    PersistedState::DiscardedCorrupt {
                        reason: err.to_string(),
                    },
                )
            }
        };

        Ok(Self {
            tree,
            indexer,
            path: config.path.clone(),
            record: RwLock::new(record),
            build_lock: tokio::sync::Mutex::new(()),
            invalidated: AtomicBool::new(false),
            persisted,
            stale_reason: Mutex::new(None),
        })
    }

    /// Return a document valid for the current tree, indexing only when the
    /// fingerprint no longer matches or the cache was invalidated.
    pub async fn get_or_build(&self) -> Result<CacheLookup> {
        let fingerprint = self.tree.fingerprint()?;

        if let Some(record) = self.valid_record(&fingerprint) {
            tracing::debug!(fingerprint = %record.fingerprint, "cache hit");
            return Ok(CacheLookup {
                record,
                status: CacheStatus::Hit,
            });
        }

        let _guard = self.build_lock.lock().await;

        // Another caller may have rebuilt while we waited.
        if let Some(record) = self.valid_record(&fingerprint) {
            tracing::debug!("cache filled by concurrent build");
            return Ok(CacheLookup {
                record,
                status: CacheStatus::Hit,
            });
        }

        let previous = self.current();
        tracing::info!(
            indexer = self.indexer.name(),
            files = fingerprint.file_count,
            "indexing source tree"
        );

        // Invalidations that arrive while indexing stay set for the next read.
        let was_invalidated = self.invalidated.swap(false, Ordering::SeqCst);

        match self.indexer.index(&self.tree).await {
            Ok(document) => {
                let record = Arc::new(CacheRecord {
                    fingerprint: fingerprint.digest,
                    generated_at: Utc::now(),
                    file_count: fingerprint.file_count,
                    document,
                });
                self.replace(record.clone());
                self.set_stale_reason(None);

                if let Err(err) = persist_record(&self.path, &record) {
                    tracing::warn!(path = %self.path.display(), error = %err, "failed to persist cache record");
                }

                let status = if previous.is_some() {
                    CacheStatus::Rebuilt
                } else {
                    CacheStatus::Built
                };
                tracing::info!(
                    modules = record.document.modules.len(),
                    fingerprint = %record.fingerprint,
                    "index cached"
                );
                Ok(CacheLookup { record, status })
            }
            Err(err) => {
                let reason = format!("{:#}", err);
                if was_invalidated {
                    self.invalidated.store(true, Ordering::SeqCst);
                }
                match previous {
                    Some(record) => {
                        tracing::warn!(error = %reason, "indexer failed; serving stale record");
                        self.set_stale_reason(Some(reason.clone()));
                        Ok(CacheLookup {
                            record,
                            status: CacheStatus::StaleButAvailable { reason },
                        })
                    }
                    None => Err(RelayError::IndexerFailure(reason).into()),
                }
            }
        }
    }

    /// Force the next [`get_or_build`](Self::get_or_build) to re-index even
    /// if the fingerprint still matches.
    pub fn invalidate(&self) {
        tracing::debug!("cache invalidated");
        self.invalidated.store(true, Ordering::SeqCst);
    }

    pub fn status(&self) -> CacheReport {
        let record = self.current();
        CacheReport {
            path: self.path.clone(),
            source_root: self.tree.root().to_path_buf(),
            fingerprint: record.as_ref().map(|r| r.fingerprint.clone()),
            generated_at: record.as_ref().map(|r| r.generated_at),
            module_count: record
                .as_ref()
                .map(|r| r.document.modules.len())
                .unwrap_or(0),
            persisted: self.persisted.clone(),
            invalidated: self.invalidated.load(Ordering::SeqCst),
            stale_reason: self
                .stale_reason
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }

    /// The current record without validating it.
    pub fn current(&self) -> Option<Arc<CacheRecord>> {
        self.record
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn valid_record(&self, fingerprint: &Fingerprint) -> Option<Arc<CacheRecord>> {
        if self.invalidated.load(Ordering::SeqCst) {
            return None;
        }
        self.current()
            .filter(|record| record.fingerprint == fingerprint.digest)
    }

    fn replace(&self, record: Arc<CacheRecord>) {
        *self.record.write().unwrap_or_else(|e| e.into_inner()) = Some(record);
    }

    fn set_stale_reason(&self, reason: Option<String>) {
        *self.stale_reason.lock().unwrap_or_else(|e| e.into_inner()) = reason;
    }
}

fn load_record(path: &Path) -> Result<Option<CacheRecord>, RelayError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(RelayError::CacheCorruption {
                path: path.display().to_string(),
                reason: err.to_string(),
            })
        }
    };

    let record: CacheRecord =
        serde_json::from_str(&raw).map_err(|err| RelayError::CacheCorruption {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;

    if record.document.schema_version != SCHEMA_VERSION {
        return Err(RelayError::CacheCorruption {
            path: path.display().to_string(),
            reason: format!(
                "record holds schema_version {}, expected {}",
                record.document.schema_version, SCHEMA_VERSION
            ),
        });
    }
    Ok(Some(record))
}

/// Write `record` next to `path` and rename it into place.
fn persist_record(path: &Path, record: &CacheRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let json = serde_json::to_vec(record)?;
    std::fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move cache record into {}", path.display()))?;
    Ok(())
}

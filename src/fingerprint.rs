//! Source-tree fingerprinting.
//!
//! Walks the configured source root, applies include/exclude globs, and
//! hashes every selected file into a single SHA-256 digest. The digest
//! changes iff the selected path set or any selected file's bytes change;
//! modification times are ignored so a `touch` does not trigger a rebuild.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::CacheConfig;

/// Directories that are never part of a source tree.
const DEFAULT_EXCLUDES: &[&str] = &[
    "**/.git/**",
    "**/target/**",
    "**/node_modules/**",
    "**/.relay/**",
];

/// A file selected for fingerprinting and indexing.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Path relative to the source root, `/`-separated.
    pub relative: String,
    pub absolute: PathBuf,
}

/// Digest of a source tree plus the inputs it was computed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub digest: String,
    pub file_count: usize,
    pub inputs: Vec<String>,
}

/// Fingerprint the tree described by `config`.
pub fn compute_fingerprint(config: &CacheConfig) -> Result<Fingerprint> {
    SourceTree::new(config)?.fingerprint()
}

/// Walks and hashes one source root with fixed globs.
#[derive(Debug, Clone)]
pub struct SourceTree {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    follow_symlinks: bool,
}

impl SourceTree {
    pub fn new(config: &CacheConfig) -> Result<Self> {
        let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        excludes.extend(config.exclude_globs.iter().cloned());

        Ok(Self {
            root: config.source_root.clone(),
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&excludes)?,
            follow_symlinks: config.follow_symlinks,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Selected files, sorted by relative path.
    pub fn files(&self) -> Result<Vec<SourceFile>> {
        if !self.root.exists() {
            bail!("Source root does not exist: {}", self.root.display());
        }

        let mut files = Vec::new();
        let walker = WalkDir::new(&self.root).follow_links(self.follow_symlinks);
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let rel_str = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            if self.exclude.is_match(&rel_str) || !self.include.is_match(&rel_str) {
                continue;
            }

            files.push(SourceFile {
                relative: rel_str,
                absolute: path.to_path_buf(),
            });
        }

        // Sort for deterministic ordering
        files.sort_by(|a, b| a.relative.cmp(&b.relative));
        Ok(files)
    }

    /// Hash the selected files. Each file contributes
    /// `path \0 len \0 bytes` so that renames and content moves between
    /// files both change the digest.
    pub fn fingerprint(&self) -> Result<Fingerprint> {
        let files = self.files()?;
        let mut hasher = Sha256::new();
        for file in &files {
            let bytes = std::fs::read(&file.absolute)?;
            hasher.update(file.relative.as_bytes());
            hasher.update([0u8]);
            hasher.update(bytes.len().to_string().as_bytes());
            hasher.update([0u8]);
            hasher.update(&bytes);
        }
        let digest = format!("{:x}", hasher.finalize());
        Ok(Fingerprint {
            digest,
            file_count: files.len(),
            inputs: files.into_iter().map(|f| f.relative).collect(),
        })
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

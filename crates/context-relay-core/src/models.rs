//! Core data models used throughout Context Relay.
//!
//! [`IndexDocument`] is the normalized project representation produced by
//! an indexer. [`ContextPackage`] is what the assembler emits and the
//! router consumes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, RelayResult};
use crate::scenario::PriorityRule;

/// The only Indexer Output schema version this build accepts.
pub const SCHEMA_VERSION: u32 = 1;

/// Normalized project representation. Immutable once produced; a re-parse
/// replaces it wholesale.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexDocument {
    pub schema_version: u32,
    pub metadata: IndexMetadata,
    pub modules: Vec<ModuleEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexMetadata {
    pub project_name: String,
    pub generated_at: DateTime<Utc>,
    /// Human-readable description of what the fingerprint covered
    /// (root, glob sets, file count).
    #[serde(default)]
    pub fingerprint_inputs: Vec<String>,
}

/// One source module (file) in the index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModuleEntry {
    pub path: String,
    pub language: String,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub line_count: usize,
    /// Free-form labels; `"critical"` is honoured by the `critical` rule.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ModuleEntry {
    pub fn is_tagged(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }
}

impl IndexDocument {
    /// Return modules sorted by path, which is the stable order every
    /// downstream tie-break relies on.
    pub fn normalized(mut self) -> Self {
        self.modules.sort_by(|a, b| a.path.cmp(&b.path));
        self
    }

    pub fn module(&self, path: &str) -> Option<&ModuleEntry> {
        self.modules.iter().find(|m| m.path == path)
    }
}

/// Parse Indexer Output JSON, rejecting unknown schema versions.
///
/// The version is checked before the full document is decoded so that a
/// future schema with a different shape still reports a version mismatch
/// instead of a generic decode error.
pub fn parse_index_document(raw: &str) -> RelayResult<IndexDocument> {
    #[derive(Deserialize)]
    struct VersionHeader {
        schema_version: Option<u32>,
    }

    let header: VersionHeader = serde_json::from_str(raw)?;
    match header.schema_version {
        Some(SCHEMA_VERSION) => {}
        Some(found) => {
            return Err(RelayError::SchemaVersion {
                found,
                expected: SCHEMA_VERSION,
            })
        }
        None => {
            return Err(RelayError::IndexerFailure(
                "indexer output is missing required field schema_version".to_string(),
            ))
        }
    }

    let doc: IndexDocument = serde_json::from_str(raw)?;
    Ok(doc.normalized())
}

// ============ Context Package ============

/// What a fragment was rendered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentKind {
    /// Project-level metadata. Never split, always first in a chunk plan.
    Overview,
    /// A single module's summary, symbols and dependencies.
    Module,
}

/// A rendered slice of the index with its estimated token cost.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextFragment {
    /// Module path, or `"<overview>"` for the overview fragment.
    pub source: String,
    pub kind: FragmentKind,
    pub text: String,
    pub tokens: usize,
    /// Index of the priority rule that admitted the fragment (0 = highest).
    pub rank: usize,
    /// Rule that admitted the fragment, if any.
    pub rule: Option<PriorityRule>,
}

/// A fragment that was built but did not fit the budget.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RejectedFragment {
    pub source: String,
    pub tokens: usize,
    pub rank: usize,
    /// The rule that would have admitted it.
    pub rule: Option<PriorityRule>,
}

/// Why a package came out empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyReason {
    /// The index produced no candidates after filtering.
    NoCandidates,
    /// Every candidate is larger than the budget.
    BudgetTooSmall,
}

/// Budget-respecting, priority-ordered bundle of fragments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextPackage {
    pub scenario: String,
    pub query: Option<String>,
    pub fragments: Vec<ContextFragment>,
    pub total_tokens_used: usize,
    pub budget_tokens: usize,
    pub rejected: Vec<RejectedFragment>,
    /// False when a query was given but no module matched it.
    pub query_matched: bool,
    pub empty_reason: Option<EmptyReason>,
}

impl ContextPackage {
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Concatenate fragment text in package order.
    pub fn render(&self) -> String {
        self.fragments
            .iter()
            .map(|f| f.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn rejected_tokens(&self) -> usize {
        self.rejected.iter().map(|r| r.tokens).sum()
    }

    /// Optimisation hints derived from the rejection audit trail, one per
    /// rule that lost fragments, highest priority first.
    pub fn suggestions(&self) -> Vec<String> {
        let mut hints = Vec::new();

        if self.empty_reason == Some(EmptyReason::BudgetTooSmall) {
            let cheapest = self.rejected.iter().map(|r| r.tokens).min().unwrap_or(0);
            hints.push(format!(
                "budget of {} tokens is smaller than the cheapest fragment ({} tokens); raise budget_tokens",
                self.budget_tokens, cheapest
            ));
        }

        if self.query.is_some() && !self.query_matched {
            hints.push("query matched no module; package was filled by scenario defaults".to_string());
        }

        let mut groups: Vec<(Option<PriorityRule>, usize, usize)> = Vec::new();
        for r in &self.rejected {
            match groups.iter_mut().find(|(rule, _, _)| *rule == r.rule) {
                Some(entry) => {
                    entry.1 += 1;
                    entry.2 += r.tokens;
                }
                None => groups.push((r.rule, 1, r.tokens)),
            }
        }

        for (rule, count, tokens) in groups {
            let label = rule.map(|r| r.as_str()).unwrap_or("unranked");
            hints.push(format!(
                "{} `{}` fragment(s) ({} tokens) did not fit; raise budget to {} or narrow include_globs",
                count,
                label,
                tokens,
                self.total_tokens_used + tokens
            ));
        }

        hints
    }
}

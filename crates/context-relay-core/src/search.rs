//! Keyword search over an [`IndexDocument`].
//!
//! Search works entirely on an already-resolved document, so its cost does
//! not depend on whether the cache was just rebuilt.
//!
//! # Scoring
//!
//! Each query term contributes, per module:
//!
//! | Match | Points |
//! |-------|--------|
//! | symbol equals term | 4 |
//! | symbol contains term | 3 |
//! | path contains term | 2 |
//! | summary contains term | 1 |
//!
//! Only the best symbol match counts per term. Results are sorted by score
//! (desc), then line count (asc, smaller modules first), then path (asc).

use serde::Serialize;

use crate::assemble::render_module;
use crate::models::{ContextFragment, FragmentKind, IndexDocument, ModuleEntry};
use crate::scenario::PriorityRule;
use crate::tokens::TokenEstimator;

/// A scored search result with its rendered fragment.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub path: String,
    pub score: usize,
    pub line_count: usize,
    pub fragment: ContextFragment,
}

/// Split a query into lowercase keywords.
///
/// Separators are whitespace and punctuation other than `_`, `.`, `/`, `-`
/// and `:`, which are common inside identifiers and paths.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = query
        .split(|c: char| !(c.is_alphanumeric() || matches!(c, '_' | '.' | '/' | '-' | ':')))
        .map(|t| t.trim_matches(|c: char| matches!(c, '.' | '-' | ':')))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect();
    terms.dedup();
    terms
}

/// Relevance of `module` for the given terms; zero means no match.
pub fn score_module(module: &ModuleEntry, terms: &[String]) -> usize {
    let path = module.path.to_lowercase();
    let summary = module.summary.to_lowercase();
    let symbols: Vec<String> = module.symbols.iter().map(|s| s.to_lowercase()).collect();

    terms
        .iter()
        .map(|term| {
            let symbol_points = symbols
                .iter()
                .map(|s| {
                    if s == term || s.rsplit(' ').next() == Some(term.as_str()) {
                        4
                    } else if s.contains(term.as_str()) {
                        3
                    } else {
                        0
                    }
                })
                .max()
                .unwrap_or(0);
            let path_points = if path.contains(term.as_str()) { 2 } else { 0 };
            let summary_points = if summary.contains(term.as_str()) { 1 } else { 0 };
            symbol_points + path_points + summary_points
        })
        .sum()
}

/// True if any term matches the module at all.
pub fn module_matches(module: &ModuleEntry, terms: &[String]) -> bool {
    !terms.is_empty() && score_module(module, terms) > 0
}

/// Run a keyword search, returning at most `limit` hits.
pub fn search_index(
    doc: &IndexDocument,
    query: &str,
    limit: usize,
    estimator: &TokenEstimator,
) -> Vec<SearchHit> {
    let terms = query_terms(query);
    if terms.is_empty() || limit == 0 {
        return Vec::new();
    }

    let mut hits: Vec<SearchHit> = doc
        .modules
        .iter()
        .filter_map(|m| {
            let score = score_module(m, &terms);
            if score == 0 {
                return None;
            }
            let text = render_module(m);
            Some(SearchHit {
                path: m.path.clone(),
                score,
                line_count: m.line_count,
                fragment: ContextFragment {
                    source: m.path.clone(),
                    kind: FragmentKind::Module,
                    tokens: estimator.estimate(&text),
                    text,
                    rank: 0,
                    rule: Some(PriorityRule::QueryMatch),
                },
            })
        })
        .collect();

    hits.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then(a.line_count.cmp(&b.line_count))
            .then(a.path.cmp(&b.path))
    });
    hits.truncate(limit);
    hits
}

//! Token-budgeted context assembly.
//!
//! # Algorithm
//!
//! 1. Build one candidate fragment per module admitted by the scenario's
//!    include/exclude filters, plus an optional project overview.
//! 2. Rank each candidate by the first priority rule that admits it
//!    (overview is always rank 0; modules no rule admits rank last).
//! 3. Stable-sort by rank. Ties keep index order, which is path order.
//! 4. Greedily accept while `total + cost <= budget`. A fragment that does
//!    not fit is recorded as rejected and packing continues, so a large
//!    high-priority fragment cannot starve cheaper ones behind it.
//!
//! The output is deterministic for a given document, scenario and request.

use std::collections::HashSet;

use crate::models::{
    ContextFragment, ContextPackage, EmptyReason, FragmentKind, IndexDocument, ModuleEntry,
    RejectedFragment,
};
use crate::scenario::{PriorityRule, Scenario};
use crate::search::{module_matches, query_terms};
use crate::tokens::TokenEstimator;

/// Source label used for the overview fragment.
pub const OVERVIEW_SOURCE: &str = "<overview>";

/// Per-call inputs beyond the scenario.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssemblyRequest<'a> {
    pub query: Option<&'a str>,
    /// Path of the file the caller is working in, as it appears in the index.
    pub active_file: Option<&'a str>,
}

/// Assembles [`ContextPackage`]s with a fixed token estimator.
#[derive(Debug, Clone, Copy, Default)]
pub struct Assembler {
    estimator: TokenEstimator,
}

impl Assembler {
    pub fn new(estimator: TokenEstimator) -> Self {
        Self { estimator }
    }

    pub fn estimator(&self) -> &TokenEstimator {
        &self.estimator
    }

    /// Assemble with an optional query and no active file.
    pub fn assemble(
        &self,
        scenario: &Scenario,
        doc: &IndexDocument,
        query: Option<&str>,
    ) -> ContextPackage {
        self.assemble_with(
            scenario,
            doc,
            &AssemblyRequest {
                query,
                active_file: None,
            },
        )
    }

    pub fn assemble_with(
        &self,
        scenario: &Scenario,
        doc: &IndexDocument,
        request: &AssemblyRequest<'_>,
    ) -> ContextPackage {
        let terms = request.query.map(query_terms).unwrap_or_default();
        let active_deps = active_dependencies(doc, request.active_file);
        let rules = scenario.priority_rules();
        let unranked = rules.len() + 1;

        let mut candidates: Vec<ContextFragment> = Vec::new();

        if scenario.include_overview() {
            let text = render_overview(doc);
            candidates.push(ContextFragment {
                source: OVERVIEW_SOURCE.to_string(),
                kind: FragmentKind::Overview,
                tokens: self.estimator.estimate(&text),
                text,
                rank: 0,
                rule: None,
            });
        }

        let mut query_matched = terms.is_empty();

        for module in doc.modules.iter().filter(|m| scenario.admits(&m.path)) {
            if !query_matched && module_matches(module, &terms) {
                query_matched = true;
            }

            let ctx = RuleContext {
                terms: &terms,
                active_file: request.active_file,
                active_deps: &active_deps,
                scenario,
            };
            let hit = rules
                .iter()
                .position(|rule| ctx.admits(*rule, module));

            let text = render_module(module);
            candidates.push(ContextFragment {
                source: module.path.clone(),
                kind: FragmentKind::Module,
                tokens: self.estimator.estimate(&text),
                text,
                rank: hit.map(|i| i + 1).unwrap_or(unranked),
                rule: hit.map(|i| rules[i]),
            });
        }

        // Vec::sort_by_key is stable.
        candidates.sort_by_key(|c| c.rank);

        let budget = scenario.budget_tokens();
        let mut total = 0usize;
        let mut fragments = Vec::new();
        let mut rejected = Vec::new();

        for candidate in candidates {
            if total + candidate.tokens <= budget {
                total += candidate.tokens;
                fragments.push(candidate);
            } else {
                rejected.push(RejectedFragment {
                    source: candidate.source,
                    tokens: candidate.tokens,
                    rank: candidate.rank,
                    rule: candidate.rule,
                });
            }
        }

        let empty_reason = if !fragments.is_empty() {
            None
        } else if rejected.is_empty() {
            Some(EmptyReason::NoCandidates)
        } else {
            Some(EmptyReason::BudgetTooSmall)
        };

        ContextPackage {
            scenario: scenario.name().to_string(),
            query: request.query.map(|q| q.to_string()),
            fragments,
            total_tokens_used: total,
            budget_tokens: budget,
            rejected,
            query_matched,
            empty_reason,
        }
    }
}

struct RuleContext<'a> {
    terms: &'a [String],
    active_file: Option<&'a str>,
    active_deps: &'a HashSet<String>,
    scenario: &'a Scenario,
}

impl RuleContext<'_> {
    fn admits(&self, rule: PriorityRule, module: &ModuleEntry) -> bool {
        match rule {
            PriorityRule::QueryMatch => module_matches(module, self.terms),
            PriorityRule::Critical => {
                module.is_tagged("critical") || self.scenario.is_critical_path(&module.path)
            }
            PriorityRule::ActiveFile => self.active_file == Some(module.path.as_str()),
            PriorityRule::ActiveDependencies => self.active_deps.contains(&module.path),
            PriorityRule::Summaries => !module.summary.trim().is_empty(),
            PriorityRule::Remaining => true,
        }
    }
}

/// Paths of modules the active file depends on directly.
fn active_dependencies(doc: &IndexDocument, active_file: Option<&str>) -> HashSet<String> {
    let Some(active) = active_file.and_then(|p| doc.module(p)) else {
        return HashSet::new();
    };
    doc.modules
        .iter()
        .filter(|m| m.path != active.path)
        .filter(|m| {
            active
                .dependencies
                .iter()
                .any(|dep| dependency_matches(dep, &m.path))
        })
        .map(|m| m.path.clone())
        .collect()
}

/// Whether dependency edge `dep` names the module at `path`.
///
/// Accepts exact paths, extension-less paths, and `::` / `.` separated
/// module names that resolve to a path suffix (`crate::cache` →
/// `src/cache.rs`).
pub fn dependency_matches(dep: &str, path: &str) -> bool {
    if dep == path {
        return true;
    }
    let stem = match path.rfind('.') {
        Some(dot) if dot > path.rfind('/').map(|s| s + 1).unwrap_or(0) => &path[..dot],
        _ => path,
    };
    if dep == stem {
        return true;
    }
    let normalized = dep
        .trim_start_matches("crate::")
        .trim_start_matches("self::")
        .replace("::", "/");
    let normalized = if normalized.contains('/') {
        normalized
    } else {
        normalized.replace('.', "/")
    };
    !normalized.is_empty()
        && (stem == normalized
            || stem.ends_with(&format!("/{}", normalized))
            || stem.ends_with(&format!("/{}/mod", normalized))
            || stem.ends_with(&format!("/{}/__init__", normalized)))
}

/// Render one module as fragment text.
pub fn render_module(module: &ModuleEntry) -> String {
    let mut out = format!(
        "## {} ({}, {} lines)",
        module.path, module.language, module.line_count
    );
    let summary = module.summary.trim();
    if !summary.is_empty() {
        out.push('\n');
        out.push_str(summary);
    }
    if !module.symbols.is_empty() {
        out.push_str("\nsymbols: ");
        out.push_str(&module.symbols.join(", "));
    }
    if !module.dependencies.is_empty() {
        out.push_str("\ndepends on: ");
        out.push_str(&module.dependencies.join(", "));
    }
    out
}

/// Render the project overview fragment from index metadata.
pub fn render_overview(doc: &IndexDocument) -> String {
    let mut languages: Vec<(String, usize)> = Vec::new();
    for m in &doc.modules {
        match languages.iter_mut().find(|(l, _)| *l == m.language) {
            Some(entry) => entry.1 += 1,
            None => languages.push((m.language.clone(), 1)),
        }
    }
    languages.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let total_lines: usize = doc.modules.iter().map(|m| m.line_count).sum();
    let langs = languages
        .iter()
        .map(|(l, n)| format!("{} ({})", l, n))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "# Project {}\nmodules: {}, lines: {}, indexed: {}\nlanguages: {}",
        doc.metadata.project_name,
        doc.modules.len(),
        total_lines,
        doc.metadata.generated_at.format("%Y-%m-%dT%H:%M:%SZ"),
        langs
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IndexMetadata, SCHEMA_VERSION};
    use crate::scenario::ScenarioSpec;
    use chrono::Utc;

    fn module(path: &str) -> ModuleEntry {
        ModuleEntry {
            path: path.to_string(),
            language: "rust".to_string(),
            symbols: vec![],
            dependencies: vec![],
            summary: String::new(),
            line_count: 10,
            tags: vec![],
        }
    }

    /// Pad the summary until the rendered module costs exactly `cost` tokens.
    fn module_with_cost(path: &str, cost: usize, est: &TokenEstimator) -> ModuleEntry {
        let mut m = module(path);
        m.summary = "x".repeat(cost * est.chars_per_token());
        loop {
            let tokens = est.estimate(&render_module(&m));
            if tokens == cost {
                return m;
            }
            let delta = tokens.abs_diff(cost) * est.chars_per_token();
            if tokens > cost {
                let keep = m.summary.len().saturating_sub(delta).max(1);
                m.summary.truncate(keep);
            } else {
                m.summary.push_str(&"x".repeat(delta));
            }
        }
    }

    fn doc(modules: Vec<ModuleEntry>) -> IndexDocument {
        IndexDocument {
            schema_version: SCHEMA_VERSION,
            metadata: IndexMetadata {
                project_name: "demo".into(),
                generated_at: Utc::now(),
                fingerprint_inputs: vec![],
            },
            modules,
        }
        .normalized()
    }

    fn scenario(budget: usize, rules: &[&str]) -> Scenario {
        Scenario::compile(
            "test",
            &ScenarioSpec {
                budget_tokens: budget,
                priority_rules: rules.iter().map(|r| r.to_string()).collect(),
                include_globs: vec![],
                exclude_globs: vec![],
                critical_globs: vec![],
                include_overview: false,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_knapsack_skips_oversized_fragment() {
        let est = TokenEstimator::default();
        let d = doc(vec![
            module_with_cost("a.rs", 500, &est),
            module_with_cost("b.rs", 2000, &est),
            module_with_cost("c.rs", 100, &est),
        ]);
        let pkg = Assembler::new(est).assemble(&scenario(600, &["summaries"]), &d, None);

        let kept: Vec<&str> = pkg.fragments.iter().map(|f| f.source.as_str()).collect();
        assert_eq!(kept, vec!["a.rs", "c.rs"]);
        assert_eq!(pkg.total_tokens_used, 600);
        assert_eq!(pkg.rejected.len(), 1);
        assert_eq!(pkg.rejected[0].source, "b.rs");
        assert_eq!(pkg.rejected[0].tokens, 2000);
        assert_eq!(pkg.rejected[0].rule, Some(PriorityRule::Summaries));
    }

    #[test]
    fn test_budget_smaller_than_every_fragment_is_empty_not_error() {
        let est = TokenEstimator::default();
        let d = doc(vec![
            module_with_cost("a.rs", 50, &est),
            module_with_cost("b.rs", 70, &est),
        ]);
        let pkg = Assembler::new(est).assemble(&scenario(10, &["remaining"]), &d, None);
        assert!(pkg.is_empty());
        assert_eq!(pkg.total_tokens_used, 0);
        assert_eq!(pkg.empty_reason, Some(EmptyReason::BudgetTooSmall));
        assert_eq!(pkg.rejected.len(), 2);
    }

    #[test]
    fn test_empty_index_reports_no_candidates() {
        let pkg = Assembler::default().assemble(&scenario(10, &["remaining"]), &doc(vec![]), None);
        assert_eq!(pkg.empty_reason, Some(EmptyReason::NoCandidates));
    }

    #[test]
    fn test_query_rank_precedes_summaries() {
        let mut cache = module("src/cache.rs");
        cache.symbols = vec!["fn get_or_build".into()];
        let mut docs = module("src/aaa_docs.rs");
        docs.summary = "documentation helpers".into();
        let d = doc(vec![docs, cache]);

        let pkg = Assembler::default().assemble(
            &scenario(10_000, &["query_match", "summaries"]),
            &d,
            Some("get_or_build"),
        );
        assert_eq!(pkg.fragments[0].source, "src/cache.rs");
        assert_eq!(pkg.fragments[0].rule, Some(PriorityRule::QueryMatch));
        assert_eq!(pkg.fragments[1].source, "src/aaa_docs.rs");
        assert!(pkg.query_matched);
    }

    #[test]
    fn test_failed_query_still_populates_from_defaults() {
        let mut m = module("src/lib.rs");
        m.summary = "library root".into();
        let d = doc(vec![m]);
        let pkg = Assembler::default().assemble(
            &scenario(10_000, &["query_match", "summaries"]),
            &d,
            Some("zzz_nothing"),
        );
        assert!(!pkg.query_matched);
        assert_eq!(pkg.fragments.len(), 1);
        assert_eq!(pkg.fragments[0].rule, Some(PriorityRule::Summaries));
    }

    #[test]
    fn test_active_file_and_dependencies() {
        let mut active = module("src/router.rs");
        active.dependencies = vec!["crate::routing".into()];
        let d = doc(vec![
            module("src/aaa.rs"),
            active,
            module("src/routing.rs"),
        ]);
        let req = AssemblyRequest {
            query: None,
            active_file: Some("src/router.rs"),
        };
        let pkg = Assembler::default().assemble_with(
            &scenario(10_000, &["active_file", "active_dependencies", "remaining"]),
            &d,
            &req,
        );
        let order: Vec<&str> = pkg.fragments.iter().map(|f| f.source.as_str()).collect();
        assert_eq!(order, vec!["src/router.rs", "src/routing.rs", "src/aaa.rs"]);
    }

    #[test]
    fn test_unranked_modules_come_last() {
        let mut tagged = module("z.rs");
        tagged.tags = vec!["critical".into()];
        let d = doc(vec![module("a.rs"), tagged]);
        let pkg = Assembler::default().assemble(&scenario(10_000, &["critical"]), &d, None);
        assert_eq!(pkg.fragments[0].source, "z.rs");
        assert_eq!(pkg.fragments[1].rule, None);
        assert_eq!(pkg.fragments[1].rank, 2);
    }

    #[test]
    fn test_overview_first_when_enabled() {
        let spec = ScenarioSpec {
            budget_tokens: 10_000,
            priority_rules: vec!["remaining".into()],
            include_globs: vec![],
            exclude_globs: vec![],
            critical_globs: vec![],
            include_overview: true,
        };
        let s = Scenario::compile("ov", &spec).unwrap();
        let pkg = Assembler::default().assemble(&s, &doc(vec![module("a.rs")]), None);
        assert_eq!(pkg.fragments[0].kind, FragmentKind::Overview);
        assert!(pkg.fragments[0].text.starts_with("# Project demo"));
    }

    #[test]
    fn test_budget_and_order_invariants_over_many_budgets() {
        let est = TokenEstimator::new(3);
        let mut modules = Vec::new();
        for i in 0..20 {
            let mut m = module_with_cost(&format!("m{:02}.rs", i), 10 + (i * 37) % 90, &est);
            if i % 3 == 0 {
                m.tags = vec!["critical".into()];
            }
            if i % 4 == 0 {
                m.summary = format!("router piece {}", i);
            }
            modules.push(m);
        }
        let d = doc(modules);
        let assembler = Assembler::new(est);
        for budget in [1usize, 15, 60, 200, 555, 1_000, 5_000] {
            let s = scenario(budget, &["query_match", "critical", "summaries", "remaining"]);
            let pkg = assembler.assemble(&s, &d, Some("router"));
            assert!(pkg.total_tokens_used <= budget);
            assert_eq!(
                pkg.total_tokens_used,
                pkg.fragments.iter().map(|f| f.tokens).sum::<usize>()
            );
            for pair in pkg.fragments.windows(2) {
                assert!(pair[0].rank <= pair[1].rank, "priority order violated");
            }
            let again = assembler.assemble(&s, &d, Some("router"));
            assert_eq!(pkg, again, "assembly must be deterministic");
        }
    }

    #[test]
    fn test_dependency_matches_forms() {
        assert!(dependency_matches("src/cache.rs", "src/cache.rs"));
        assert!(dependency_matches("src/cache", "src/cache.rs"));
        assert!(dependency_matches("crate::cache", "src/cache.rs"));
        assert!(dependency_matches("pkg.util", "pkg/util.py"));
        assert!(dependency_matches("crate::store", "src/store/mod.rs"));
        assert!(!dependency_matches("crate::cache", "src/cache_tests.rs"));
    }
}

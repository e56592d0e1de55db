//! Named context-assembly scenarios.
//!
//! A [`ScenarioSpec`] is the deserialisable form found in configuration. It
//! is compiled once into a [`Scenario`] (glob sets built, rules checked) and
//! the compiled value is immutable for the rest of the process.
//!
//! | Scenario | Budget | Rules |
//! |----------|--------|-------|
//! | `full` | 120,000 | query_match, critical, active_file, active_dependencies, summaries, remaining |
//! | `focused` | 32,000 | query_match, active_file, active_dependencies, critical, summaries |
//! | `minimal` | 4,000 | query_match, critical, summaries |
//! | `session` | 16,000 | active_file, active_dependencies, query_match, critical, summaries |

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, RelayResult};

/// Ordered predicates used to rank fragments. Earlier rules win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityRule {
    /// Path, summary or a symbol contains one of the query keywords.
    QueryMatch,
    /// Module is tagged `critical` or matches `critical_globs`.
    Critical,
    /// Module is the caller's active file.
    ActiveFile,
    /// Module is a direct dependency of the active file.
    ActiveDependencies,
    /// Module carries a non-empty summary.
    Summaries,
    /// Catch-all.
    Remaining,
}

impl PriorityRule {
    pub const ALL: [PriorityRule; 6] = [
        PriorityRule::QueryMatch,
        PriorityRule::Critical,
        PriorityRule::ActiveFile,
        PriorityRule::ActiveDependencies,
        PriorityRule::Summaries,
        PriorityRule::Remaining,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityRule::QueryMatch => "query_match",
            PriorityRule::Critical => "critical",
            PriorityRule::ActiveFile => "active_file",
            PriorityRule::ActiveDependencies => "active_dependencies",
            PriorityRule::Summaries => "summaries",
            PriorityRule::Remaining => "remaining",
        }
    }
}

impl fmt::Display for PriorityRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PriorityRule {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PriorityRule::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| {
                RelayError::Config(format!(
                    "unknown priority rule '{}'. Must be one of: {}",
                    s,
                    PriorityRule::ALL
                        .iter()
                        .map(|r| r.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }
}

/// Scenario as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScenarioSpec {
    pub budget_tokens: usize,
    pub priority_rules: Vec<String>,
    #[serde(default)]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub critical_globs: Vec<String>,
    #[serde(default)]
    pub include_overview: bool,
}

/// A validated, immutable scenario.
#[derive(Debug, Clone)]
pub struct Scenario {
    name: String,
    budget_tokens: usize,
    priority_rules: Vec<PriorityRule>,
    include: Option<GlobSet>,
    exclude: GlobSet,
    critical: GlobSet,
    include_overview: bool,
}

impl Scenario {
    /// Compile a spec. Fails on a zero budget, an empty or unknown rule
    /// list, or an invalid glob.
    pub fn compile(name: &str, spec: &ScenarioSpec) -> RelayResult<Self> {
        if spec.budget_tokens == 0 {
            return Err(RelayError::Config(format!(
                "scenarios.{}.budget_tokens must be > 0",
                name
            )));
        }
        if spec.priority_rules.is_empty() {
            return Err(RelayError::Config(format!(
                "scenarios.{}.priority_rules must not be empty",
                name
            )));
        }

        let mut rules = Vec::with_capacity(spec.priority_rules.len());
        for raw in &spec.priority_rules {
            let rule: PriorityRule = raw
                .parse()
                .map_err(|e| RelayError::Config(format!("scenarios.{}: {}", name, e)))?;
            if !rules.contains(&rule) {
                rules.push(rule);
            }
        }

        let include = if spec.include_globs.is_empty() {
            None
        } else {
            Some(build_globset(name, &spec.include_globs)?)
        };

        Ok(Self {
            name: name.to_string(),
            budget_tokens: spec.budget_tokens,
            priority_rules: rules,
            include,
            exclude: build_globset(name, &spec.exclude_globs)?,
            critical: build_globset(name, &spec.critical_globs)?,
            include_overview: spec.include_overview,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn budget_tokens(&self) -> usize {
        self.budget_tokens
    }

    pub fn priority_rules(&self) -> &[PriorityRule] {
        &self.priority_rules
    }

    pub fn include_overview(&self) -> bool {
        self.include_overview
    }

    /// Admitted by include filters and not excluded.
    pub fn admits(&self, path: &str) -> bool {
        if self.exclude.is_match(path) {
            return false;
        }
        match &self.include {
            Some(set) => set.is_match(path),
            None => true,
        }
    }

    pub fn is_critical_path(&self, path: &str) -> bool {
        self.critical.is_match(path)
    }
}

fn build_globset(scenario: &str, patterns: &[String]) -> RelayResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| {
            RelayError::Config(format!(
                "scenarios.{}: invalid glob '{}': {}",
                scenario, pattern, e
            ))
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| RelayError::Config(format!("scenarios.{}: {}", scenario, e)))
}

/// Specs for the four built-in scenarios.
pub fn builtin_specs() -> BTreeMap<String, ScenarioSpec> {
    fn spec(budget: usize, rules: &[PriorityRule], overview: bool) -> ScenarioSpec {
        ScenarioSpec {
            budget_tokens: budget,
            priority_rules: rules.iter().map(|r| r.as_str().to_string()).collect(),
            include_globs: Vec::new(),
            exclude_globs: Vec::new(),
            critical_globs: Vec::new(),
            include_overview: overview,
        }
    }

    use PriorityRule::*;
    let mut specs = BTreeMap::new();
    specs.insert(
        "full".to_string(),
        spec(
            120_000,
            &[QueryMatch, Critical, ActiveFile, ActiveDependencies, Summaries, Remaining],
            true,
        ),
    );
    specs.insert(
        "focused".to_string(),
        spec(
            32_000,
            &[QueryMatch, ActiveFile, ActiveDependencies, Critical, Summaries],
            true,
        ),
    );
    specs.insert(
        "minimal".to_string(),
        spec(4_000, &[QueryMatch, Critical, Summaries], false),
    );
    specs.insert(
        "session".to_string(),
        spec(
            16_000,
            &[ActiveFile, ActiveDependencies, QueryMatch, Critical, Summaries],
            true,
        ),
    );
    specs
}

/// Compiled scenarios keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ScenarioRegistry {
    scenarios: BTreeMap<String, Scenario>,
}

impl ScenarioRegistry {
    /// Built-ins overlaid with `overrides` (same name replaces, new names extend).
    pub fn with_overrides(overrides: &BTreeMap<String, ScenarioSpec>) -> RelayResult<Self> {
        let mut specs = builtin_specs();
        for (name, spec) in overrides {
            specs.insert(name.clone(), spec.clone());
        }
        let mut scenarios = BTreeMap::new();
        for (name, spec) in &specs {
            scenarios.insert(name.clone(), Scenario::compile(name, spec)?);
        }
        Ok(Self { scenarios })
    }

    pub fn builtin() -> Self {
        // Built-in specs are static and always compile.
        Self::with_overrides(&BTreeMap::new()).unwrap_or_default()
    }

    pub fn get(&self, name: &str) -> RelayResult<&Scenario> {
        self.scenarios
            .get(name)
            .ok_or_else(|| RelayError::UnknownScenario(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.scenarios.keys().map(|s| s.as_str())
    }
}

//! TOML configuration parsing and validation.
//!
//! Everything is validated once in [`load_config`]; the rest of the crate
//! works with typed, already-checked values (compiled scenarios, model
//! profiles with known providers).

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use context_relay_core::routing::{ModelProfile, RetryPolicy, DEFAULT_RESPONSE_MARGIN};
use context_relay_core::scenario::{ScenarioRegistry, ScenarioSpec};
use context_relay_core::tokens::DEFAULT_CHARS_PER_TOKEN;

/// Providers that have a built-in backend.
pub const KNOWN_PROVIDERS: &[&str] = &["openai", "command", "echo"];

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub cache: CacheConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub assembly: AssemblyConfig,
    #[serde(default)]
    pub scenarios: BTreeMap<String, ScenarioSpec>,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub models: Vec<ModelProfile>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Where the persisted cache record lives.
    pub path: PathBuf,
    pub source_root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    [
        "**/*.rs", "**/*.py", "**/*.ts", "**/*.tsx", "**/*.js", "**/*.go", "**/*.java",
        "**/*.kt", "**/*.c", "**/*.h", "**/*.cpp", "**/*.rb", "**/*.sh", "**/*.toml",
        "**/*.md",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexerConfig {
    #[serde(default = "default_indexer_kind")]
    pub kind: String,
    /// argv for `kind = "command"`; the source root is appended.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default = "default_indexer_timeout")]
    pub timeout_secs: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            kind: default_indexer_kind(),
            command: Vec::new(),
            timeout_secs: default_indexer_timeout(),
        }
    }
}

fn default_indexer_kind() -> String {
    "builtin".to_string()
}
fn default_indexer_timeout() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct AssemblyConfig {
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,
    #[serde(default = "default_scenario")]
    pub default_scenario: String,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            chars_per_token: default_chars_per_token(),
            default_scenario: default_scenario(),
        }
    }
}

fn default_chars_per_token() -> usize {
    DEFAULT_CHARS_PER_TOKEN
}
fn default_scenario() -> String {
    "focused".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouterConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_response_margin")]
    pub response_margin: f64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Append-only JSONL delegation log. Disabled when unset.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            response_margin: default_response_margin(),
            timeout_secs: default_timeout_secs(),
            log_path: None,
        }
    }
}

impl RouterConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_base_ms: self.backoff_base_ms,
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_response_margin() -> f64 {
    DEFAULT_RESPONSE_MARGIN
}
fn default_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

fn default_concurrency() -> usize {
    1
}

impl Config {
    /// A config rooted at `source_root` with every other setting defaulted.
    pub fn minimal(source_root: &Path) -> Self {
        Self {
            cache: CacheConfig {
                path: source_root.join(".relay").join("index-cache.json"),
                source_root: source_root.to_path_buf(),
                include_globs: default_include_globs(),
                exclude_globs: Vec::new(),
                follow_symlinks: false,
            },
            indexer: IndexerConfig::default(),
            assembly: AssemblyConfig::default(),
            scenarios: BTreeMap::new(),
            router: RouterConfig::default(),
            queue: QueueConfig::default(),
            models: Vec::new(),
        }
    }

    /// Built-in scenarios overlaid with the configured ones.
    pub fn scenario_registry(&self) -> Result<ScenarioRegistry> {
        Ok(ScenarioRegistry::with_overrides(&self.scenarios)?)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Relative paths resolve against the config file's directory.
    if let Some(base) = path.parent() {
        resolve_relative(&mut config, base);
    }

    validate(&config)?;
    Ok(config)
}

fn resolve_relative(config: &mut Config, base: &Path) {
    let fix = |p: &mut PathBuf| {
        if p.is_relative() {
            *p = base.join(&*p);
        }
    };
    fix(&mut config.cache.path);
    fix(&mut config.cache.source_root);
    if let Some(log) = config.router.log_path.as_mut() {
        fix(log);
    }
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate assembly
    if config.assembly.chars_per_token == 0 {
        bail!("assembly.chars_per_token must be > 0");
    }

    // Scenarios compile or fail here, not on first use
    let scenarios = config.scenario_registry()?;
    scenarios
        .get(&config.assembly.default_scenario)
        .with_context(|| "assembly.default_scenario")?;

    // Validate indexer
    match config.indexer.kind.as_str() {
        "builtin" => {}
        "command" => {
            if config.indexer.command.is_empty() {
                bail!("indexer.command must be set when indexer.kind = \"command\"");
            }
        }
        other => bail!(
            "Unknown indexer kind: '{}'. Must be builtin or command.",
            other
        ),
    }

    // Validate router
    if !(0.0..0.9).contains(&config.router.response_margin) {
        bail!("router.response_margin must be in [0.0, 0.9)");
    }
    if config.router.timeout_secs == 0 {
        bail!("router.timeout_secs must be > 0");
    }

    // Validate queue
    if !(1..=16).contains(&config.queue.concurrency) {
        bail!("queue.concurrency must be between 1 and 16");
    }

    // Validate models
    let mut seen = HashSet::new();
    for model in &config.models {
        if !seen.insert(model.name.as_str()) {
            bail!("models: duplicate model name '{}'", model.name);
        }
        if model.max_context_tokens == 0 {
            bail!("models.{}.max_context_tokens must be > 0", model.name);
        }
        if !KNOWN_PROVIDERS.contains(&model.provider.as_str()) {
            bail!(
                "models.{}: unknown provider '{}'. Must be one of: {}",
                model.name,
                model.provider,
                KNOWN_PROVIDERS.join(", ")
            );
        }
        if model.provider == "command"
            && model.command.as_ref().map(|c| c.is_empty()).unwrap_or(true)
        {
            bail!("models.{}: provider 'command' requires command = [..]", model.name);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<Config> {
        let config: Config = toml::from_str(raw)?;
        validate(&config)?;
        Ok(config)
    }

    const BASE: &str = r#"
[cache]
path = "/tmp/relay/cache.json"
source_root = "/tmp/relay/src"
"#;

    #[test]
    fn test_defaults() {
        let cfg = parse(BASE).unwrap();
        assert_eq!(cfg.assembly.chars_per_token, 4);
        assert_eq!(cfg.router.max_retries, 3);
        assert!((cfg.router.response_margin - 0.10).abs() < 1e-9);
        assert_eq!(cfg.queue.concurrency, 1);
        assert!(cfg.cache.include_globs.contains(&"**/*.rs".to_string()));
    }

    #[test]
    fn test_scenario_override_and_bad_rule() {
        let ok = format!(
            "{}\n[scenarios.review]\nbudget_tokens = 900\npriority_rules = [\"critical\", \"summaries\"]\n",
            BASE
        );
        let cfg = parse(&ok).unwrap();
        assert_eq!(
            cfg.scenario_registry().unwrap().get("review").unwrap().budget_tokens(),
            900
        );

        let bad = format!(
            "{}\n[scenarios.review]\nbudget_tokens = 900\npriority_rules = [\"vibes\"]\n",
            BASE
        );
        assert!(parse(&bad).is_err());
    }

    #[test]
    fn test_models_validated() {
        let dup = format!(
            r#"{}
[[models]]
name = "a"
provider = "echo"
max_context_tokens = 1000
cost_class = "low"

[[models]]
name = "a"
provider = "echo"
max_context_tokens = 2000
cost_class = "high"
"#,
            BASE
        );
        let err = parse(&dup).unwrap_err();
        assert!(err.to_string().contains("duplicate model name"));

        let unknown = format!(
            r#"{}
[[models]]
name = "x"
provider = "carrier-pigeon"
max_context_tokens = 1000
cost_class = "low"
"#,
            BASE
        );
        assert!(parse(&unknown).is_err());
    }

    #[test]
    fn test_margin_and_concurrency_bounds() {
        assert!(parse(&format!("{}\n[router]\nresponse_margin = 0.95\n", BASE)).is_err());
        assert!(parse(&format!("{}\n[queue]\nconcurrency = 0\n", BASE)).is_err());
        assert!(parse(&format!("{}\n[queue]\nconcurrency = 4\n", BASE)).is_ok());
    }

    #[test]
    fn test_relative_paths_resolve_against_config_dir() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("relay.toml");
        std::fs::write(
            &path,
            "[cache]\npath = \"data/cache.json\"\nsource_root = \"src\"\n[router]\nlog_path = \"data/log.jsonl\"\n",
        )
        .unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.cache.source_root, tmp.path().join("src"));
        assert_eq!(cfg.router.log_path, Some(tmp.path().join("data/log.jsonl")));
    }
}

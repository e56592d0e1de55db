//! Wiring for one configured project.
//!
//! [`Engine`] owns the validity cache, scenario registry, assembler, model
//! registry and router built from a [`Config`]. The CLI commands are thin
//! consumers of it; tests build one with [`Engine::with_parts`] to swap in
//! fake indexers and backends.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use context_relay_core::assemble::{AssemblyRequest, Assembler};
use context_relay_core::models::ContextPackage;
use context_relay_core::scenario::ScenarioRegistry;
use context_relay_core::tokens::TokenEstimator;

use crate::backend::BackendRegistry;
use crate::cache::{CacheStatus, ValidityCache};
use crate::config::Config;
use crate::delegation_log::DelegationLog;
use crate::indexer::{create_indexer, Indexer};
use crate::model_registry::ModelRegistry;
use crate::queue::{BatchFile, BatchQueue, DelegationTask};
use crate::router::Router;

/// Inputs for building a context package.
#[derive(Debug, Clone, Default)]
pub struct ContextQuery {
    /// Scenario name; the configured default when unset.
    pub scenario: Option<String>,
    pub query: Option<String>,
    pub active_file: Option<String>,
}

/// A package plus how the index behind it was obtained.
#[derive(Debug, Clone)]
pub struct ContextOutcome {
    pub package: ContextPackage,
    pub cache_status: CacheStatus,
}

pub struct Engine {
    config: Config,
    cache: ValidityCache,
    scenarios: ScenarioRegistry,
    assembler: Assembler,
    models: ModelRegistry,
    router: Arc<Router>,
}

impl Engine {
    /// Build with the configured indexer and the built-in backends.
    pub fn new(config: Config) -> Result<Self> {
        let indexer = create_indexer(&config.indexer)?;
        let backends =
            BackendRegistry::with_defaults(Duration::from_secs(config.router.timeout_secs))?;
        Self::with_parts(config, indexer, backends)
    }

    pub fn with_parts(
        config: Config,
        indexer: Arc<dyn Indexer>,
        backends: BackendRegistry,
    ) -> Result<Self> {
        let estimator = TokenEstimator::new(config.assembly.chars_per_token);
        let scenarios = config.scenario_registry()?;
        let cache = ValidityCache::open(&config.cache, indexer)?;
        let log = match &config.router.log_path {
            Some(path) => DelegationLog::open(path)?,
            None => DelegationLog::in_memory(),
        };
        let router = Router::new(
            backends,
            Arc::new(log),
            config.router.retry_policy(),
            config.router.response_margin,
            estimator,
        );

        Ok(Self {
            models: ModelRegistry::new(config.models.clone()),
            assembler: Assembler::new(estimator),
            router: Arc::new(router),
            scenarios,
            cache,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &ValidityCache {
        &self.cache
    }

    pub fn scenarios(&self) -> &ScenarioRegistry {
        &self.scenarios
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn estimator(&self) -> &TokenEstimator {
        self.assembler.estimator()
    }

    /// Assemble a package from a current index.
    pub async fn context(&self, query: &ContextQuery) -> Result<ContextOutcome> {
        let name = query
            .scenario
            .as_deref()
            .unwrap_or(&self.config.assembly.default_scenario);
        let scenario = self.scenarios.get(name)?;
        let lookup = self.cache.get_or_build().await?;

        let package = self.assembler.assemble_with(
            scenario,
            lookup.document(),
            &AssemblyRequest {
                query: query.query.as_deref(),
                active_file: query.active_file.as_deref(),
            },
        );
        tracing::debug!(
            scenario = name,
            fragments = package.fragments.len(),
            tokens = package.total_tokens_used,
            budget = package.budget_tokens,
            "context assembled"
        );

        Ok(ContextOutcome {
            package,
            cache_status: lookup.status,
        })
    }

    /// Assemble context and capture a model snapshot for a new task.
    pub async fn prepare_task(
        &self,
        description: &str,
        query: &ContextQuery,
        models: &[String],
        tags: Vec<String>,
    ) -> Result<DelegationTask> {
        let candidates = self.models.candidates(models)?;
        let outcome = self.context(query).await?;
        Ok(DelegationTask::new(
            description,
            outcome.package,
            candidates,
            tags,
        ))
    }

    pub fn queue(&self) -> BatchQueue {
        BatchQueue::new(self.router.clone())
    }

    /// Turn every batch-file entry into a pending task on `queue`.
    pub async fn enqueue_batch(&self, queue: &BatchQueue, batch: &BatchFile) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(batch.tasks.len());
        for entry in &batch.tasks {
            let query = ContextQuery {
                scenario: entry.scenario.clone(),
                query: entry.query.clone(),
                active_file: entry.active_file.clone(),
            };
            let task = self
                .prepare_task(&entry.description, &query, &entry.models, entry.tags.clone())
                .await?;
            ids.push(queue.enqueue(task));
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::EchoBackend;
    use crate::indexer::BuiltinIndexer;
    use crate::queue::TaskStatus;
    use context_relay_core::routing::{CostClass, ModelProfile};
    use std::fs;
    use tempfile::TempDir;

    fn engine(tmp: &TempDir) -> Engine {
        fs::create_dir_all(tmp.path().join("src")).unwrap();
        fs::write(
            tmp.path().join("src/lib.rs"),
            "//! Crate root.\npub mod cache;\npub fn run() {}\n",
        )
        .unwrap();
        fs::write(
            tmp.path().join("src/cache.rs"),
            "//! Validity cache.\npub struct Cache;\n",
        )
        .unwrap();

        let mut config = Config::minimal(tmp.path());
        config.models = vec![ModelProfile {
            name: "local".into(),
            provider: "echo".into(),
            model: String::new(),
            max_context_tokens: 4_000,
            cost_class: CostClass::Low,
            strengths: vec![],
            average_latency_ms: 0,
            supports_chunking: false,
            max_output_tokens: None,
            endpoint: None,
            api_key_env: None,
            command: None,
        }];
        let mut backends = BackendRegistry::new();
        backends.register(Arc::new(EchoBackend));
        Engine::with_parts(config, Arc::new(BuiltinIndexer), backends).unwrap()
    }

    #[tokio::test]
    async fn test_context_uses_default_scenario() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let outcome = engine
            .context(&ContextQuery {
                query: Some("cache".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(outcome.package.scenario, "focused");
        assert_eq!(outcome.cache_status, CacheStatus::Built);
        assert!(outcome
            .package
            .fragments
            .iter()
            .any(|f| f.source == "src/cache.rs"));
    }

    #[tokio::test]
    async fn test_unknown_scenario_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let err = engine
            .context(&ContextQuery {
                scenario: Some("nope".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[tokio::test]
    async fn test_prepared_task_runs_through_queue() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let task = engine
            .prepare_task("summarise", &ContextQuery::default(), &[], vec![])
            .await
            .unwrap();
        let queue = engine.queue();
        let id = queue.enqueue(task);
        queue.process(false, 1).await.unwrap();
        let done = queue.get(&id).unwrap();
        assert_eq!(done.status, TaskStatus::Succeeded);
        assert_eq!(done.result.unwrap().model_used, "local");
    }
}

//! Reloadable registry of [`ModelProfile`]s.
//!
//! Tasks capture a [`snapshot`](ModelRegistry::snapshot) when they select a
//! model. [`reload`](ModelRegistry::reload) swaps the shared list, so tasks
//! that already hold a snapshot keep routing against the profiles they
//! started with.

use std::sync::{Arc, RwLock};

use context_relay_core::error::{RelayError, RelayResult};
use context_relay_core::routing::ModelProfile;

#[derive(Debug, Default)]
pub struct ModelRegistry {
    profiles: RwLock<Arc<Vec<ModelProfile>>>,
}

impl ModelRegistry {
    pub fn new(profiles: Vec<ModelProfile>) -> Self {
        Self {
            profiles: RwLock::new(Arc::new(profiles)),
        }
    }

    pub fn snapshot(&self) -> Arc<Vec<ModelProfile>> {
        self.profiles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the profile list. Existing snapshots are unaffected.
    pub fn reload(&self, profiles: Vec<ModelProfile>) {
        tracing::info!(models = profiles.len(), "model registry reloaded");
        *self.profiles.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(profiles);
    }

    /// Candidate list for a task: the named models in the given order, or
    /// every registered model when `names` is empty.
    pub fn candidates(&self, names: &[String]) -> RelayResult<Vec<ModelProfile>> {
        let snapshot = self.snapshot();
        if names.is_empty() {
            return Ok(snapshot.as_ref().clone());
        }
        names
            .iter()
            .map(|name| {
                snapshot
                    .iter()
                    .find(|p| &p.name == name)
                    .cloned()
                    .ok_or_else(|| RelayError::UnknownModel(name.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use context_relay_core::routing::CostClass;

    fn profile(name: &str) -> ModelProfile {
        ModelProfile {
            name: name.into(),
            provider: "echo".into(),
            model: String::new(),
            max_context_tokens: 1_000,
            cost_class: CostClass::Low,
            strengths: vec![],
            average_latency_ms: 0,
            supports_chunking: false,
            max_output_tokens: None,
            endpoint: None,
            api_key_env: None,
            command: None,
        }
    }

    #[test]
    fn test_snapshot_survives_reload() {
        let registry = ModelRegistry::new(vec![profile("a")]);
        let before = registry.snapshot();
        registry.reload(vec![profile("b"), profile("c")]);
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].name, "a");
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[test]
    fn test_candidates_by_name() {
        let registry = ModelRegistry::new(vec![profile("a"), profile("b")]);
        let picked = registry.candidates(&["b".into(), "a".into()]).unwrap();
        assert_eq!(picked[0].name, "b");
        assert_eq!(registry.candidates(&[]).unwrap().len(), 2);
        assert!(matches!(
            registry.candidates(&["zzz".into()]),
            Err(RelayError::UnknownModel(_))
        ));
    }
}

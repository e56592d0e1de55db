//! Model backends and their registry.
//!
//! A [`ModelBackend`] performs one completion call for a [`ModelProfile`]
//! and classifies any failure as transient or capability. It never retries:
//! retry and fallback belong to the router's state machine.
//!
//! Backends are registered by provider key into a [`BackendRegistry`] at
//! startup. Profiles name their provider; the router looks the backend up
//! once per candidate.
//!
//! | Provider | Backend |
//! |----------|---------|
//! | `openai` | [`OpenAiCompatibleBackend`](crate::backend_openai::OpenAiCompatibleBackend) |
//! | `command` | [`CommandBackend`] |
//! | `echo` | [`EchoBackend`] |

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use context_relay_core::routing::{BackendFailure, ModelProfile};

use crate::backend_openai::OpenAiCompatibleBackend;

/// One completion call.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub task_id: String,
    pub prompt: String,
    /// Zero-based chunk index and chunk total; `(0, 1)` for single calls.
    pub chunk_index: usize,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendReply {
    pub text: String,
    /// Provider-reported token usage, when the provider reports it.
    pub usage_tokens: Option<usize>,
}

#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Provider key this backend serves (`"openai"`, `"command"`, ...).
    fn provider(&self) -> &str;

    async fn complete(
        &self,
        profile: &ModelProfile,
        request: &BackendRequest,
    ) -> Result<BackendReply, BackendFailure>;
}

/// Provider key → backend.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn ModelBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in backend, using `timeout` per call.
    pub fn with_defaults(timeout: Duration) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(OpenAiCompatibleBackend::new(timeout)?));
        registry.register(Arc::new(CommandBackend::new(timeout)));
        registry.register(Arc::new(EchoBackend));
        Ok(registry)
    }

    /// Register a backend, replacing any previous one for the same provider.
    pub fn register(&mut self, backend: Arc<dyn ModelBackend>) {
        self.backends.insert(backend.provider().to_string(), backend);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn ModelBackend>> {
        self.backends.get(provider).cloned()
    }

    pub fn providers(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.backends.keys().map(|k| k.as_str()).collect();
        keys.sort();
        keys
    }
}

// ============ Echo ============

/// Offline backend that answers with a deterministic digest of the prompt.
pub struct EchoBackend;

#[async_trait]
impl ModelBackend for EchoBackend {
    fn provider(&self) -> &str {
        "echo"
    }

    async fn complete(
        &self,
        profile: &ModelProfile,
        request: &BackendRequest,
    ) -> Result<BackendReply, BackendFailure> {
        let sources: Vec<&str> = request
            .prompt
            .lines()
            .filter_map(|l| l.strip_prefix("## "))
            .map(|l| l.split(' ').next().unwrap_or(l))
            .collect();
        let text = format!(
            "[{}] part {} of {}: {} chars, modules: {}",
            profile.name,
            request.chunk_index + 1,
            request.chunk_count,
            request.prompt.chars().count(),
            if sources.is_empty() {
                "-".to_string()
            } else {
                sources.join(", ")
            }
        );
        Ok(BackendReply {
            text,
            usage_tokens: None,
        })
    }
}

// ============ External command ============

/// Runs `profile.command`, writing the prompt to stdin and reading the
/// completion from stdout.
///
/// A timeout is transient. A spawn failure or non-zero exit is a capability
/// failure: the same command is not expected to behave differently on retry.
pub struct CommandBackend {
    timeout: Duration,
}

impl CommandBackend {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ModelBackend for CommandBackend {
    fn provider(&self) -> &str {
        "command"
    }

    async fn complete(
        &self,
        profile: &ModelProfile,
        request: &BackendRequest,
    ) -> Result<BackendReply, BackendFailure> {
        let argv = profile
            .command
            .as_deref()
            .filter(|argv| !argv.is_empty())
            .ok_or_else(|| {
                BackendFailure::capability(format!("model '{}' has no command", profile.name))
            })?;

        let mut child = tokio::process::Command::new(&argv[0])
            .args(&argv[1..])
            .env("RELAY_MODEL", &profile.model)
            .env("RELAY_TASK_ID", &request.task_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendFailure::capability(format!("failed to spawn {}: {}", argv[0], e)))?;

        let prompt = request.prompt.clone();
        let mut stdin = child.stdin.take();
        let run = async move {
            if let Some(stdin) = stdin.as_mut() {
                // A command that exits without reading stdin is not an error here.
                let _ = stdin.write_all(prompt.as_bytes()).await;
            }
            drop(stdin);
            child.wait_with_output().await
        };

        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| {
                BackendFailure::transient(format!(
                    "command timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| BackendFailure::transient(format!("command I/O error: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendFailure::capability(format!(
                "command exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(BackendReply {
            text: String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
            usage_tokens: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use context_relay_core::routing::{CostClass, FailureKind};

    fn profile(provider: &str, command: Option<Vec<&str>>) -> ModelProfile {
        ModelProfile {
            name: "m".into(),
            provider: provider.into(),
            model: "m-1".into(),
            max_context_tokens: 1_000,
            cost_class: CostClass::Low,
            strengths: vec![],
            average_latency_ms: 0,
            supports_chunking: false,
            max_output_tokens: None,
            endpoint: None,
            api_key_env: None,
            command: command.map(|c| c.into_iter().map(String::from).collect()),
        }
    }

    fn request(prompt: &str) -> BackendRequest {
        BackendRequest {
            task_id: "t1".into(),
            prompt: prompt.into(),
            chunk_index: 1,
            chunk_count: 3,
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = BackendRegistry::with_defaults(Duration::from_secs(5)).unwrap();
        assert_eq!(registry.providers(), vec!["command", "echo", "openai"]);
        assert!(registry.get("echo").is_some());
        assert!(registry.get("carrier-pigeon").is_none());
    }

    #[tokio::test]
    async fn test_echo_is_deterministic() {
        let p = profile("echo", None);
        let req = request("# Task\nx\n\n# Context\n## src/a.rs (rust, 3 lines)\n## src/b.rs (rust, 1 lines)");
        let a = EchoBackend.complete(&p, &req).await.unwrap();
        let b = EchoBackend.complete(&p, &req).await.unwrap();
        assert_eq!(a, b);
        assert!(a.text.starts_with("[m] part 2 of 3"));
        assert!(a.text.ends_with("modules: src/a.rs, src/b.rs"));
    }

    #[tokio::test]
    async fn test_command_reads_stdin() {
        let p = profile("command", Some(vec!["sh", "-c", "tr a-z A-Z"]));
        let reply = CommandBackend::new(Duration::from_secs(10))
            .complete(&p, &request("hello"))
            .await
            .unwrap();
        assert_eq!(reply.text, "HELLO");
    }

    #[tokio::test]
    async fn test_command_nonzero_exit_is_capability() {
        let p = profile("command", Some(vec!["sh", "-c", "echo nope >&2; exit 1"]));
        let err = CommandBackend::new(Duration::from_secs(10))
            .complete(&p, &request("x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Capability);
        assert!(err.message.contains("nope"));
    }

    #[tokio::test]
    async fn test_command_timeout_is_transient() {
        let p = profile("command", Some(vec!["sleep", "5"]));
        let err = CommandBackend::new(Duration::from_millis(100))
            .complete(&p, &request("x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Transient);
    }
}

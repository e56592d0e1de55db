//! OpenAI-compatible chat-completions backend.
//!
//! Works against any endpoint that speaks the `/v1/chat/completions` shape
//! (OpenAI, local inference servers, gateways). Each profile may override
//! the endpoint URL and the environment variable holding its API key.
//!
//! Failure classification:
//! - network errors, timeouts, HTTP 408, 429 and 5xx → transient
//! - HTTP 413, or 400 mentioning the context length → capability (overflow)
//! - HTTP 401, 403, 404 and other 4xx → capability

use async_trait::async_trait;
use std::time::Duration;

use context_relay_core::routing::{BackendFailure, FailureKind, ModelProfile};

use crate::backend::{BackendReply, BackendRequest, ModelBackend};

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";

pub struct OpenAiCompatibleBackend {
    client: reqwest::Client,
}

impl OpenAiCompatibleBackend {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ModelBackend for OpenAiCompatibleBackend {
    fn provider(&self) -> &str {
        "openai"
    }

    async fn complete(
        &self,
        profile: &ModelProfile,
        request: &BackendRequest,
    ) -> Result<BackendReply, BackendFailure> {
        let key_env = profile
            .api_key_env
            .as_deref()
            .unwrap_or(DEFAULT_API_KEY_ENV);
        let api_key = std::env::var(key_env)
            .map_err(|_| BackendFailure::capability(format!("{} not set", key_env)))?;
        let endpoint = profile.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT);

        let model = if profile.model.is_empty() {
            &profile.name
        } else {
            &profile.model
        };
        let mut body = serde_json::json!({
            "model": model,
            "messages": [{ "role": "user", "content": request.prompt }],
        });
        if let Some(max) = profile.max_output_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }

        let response = self
            .client
            .post(endpoint)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendFailure::transient(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            let mut message = format!("HTTP {}: {}", status, truncate(&body_text, 300));
            if mentions_context_length(&body_text) {
                message = format!("context overflow ({})", message);
            }
            return Err(match classify_status(status.as_u16()) {
                FailureKind::Transient => BackendFailure::transient(message),
                FailureKind::Capability => BackendFailure::capability(message),
            });
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BackendFailure::transient(format!("unreadable response: {}", e)))?;
        parse_completion(&json)
    }
}

/// Classify a non-success HTTP status.
pub fn classify_status(status: u16) -> FailureKind {
    match status {
        408 | 429 | 500..=599 => FailureKind::Transient,
        _ => FailureKind::Capability,
    }
}

fn mentions_context_length(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("context_length") || lower.contains("context length") || lower.contains("maximum context")
}

/// Extract `choices[0].message.content` and `usage.total_tokens`.
pub fn parse_completion(json: &serde_json::Value) -> Result<BackendReply, BackendFailure> {
    let text = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| {
            BackendFailure::capability("response has no choices[0].message.content")
        })?;

    let usage_tokens = json
        .get("usage")
        .and_then(|u| u.get("total_tokens"))
        .and_then(|t| t.as_u64())
        .map(|t| t as usize);

    Ok(BackendReply {
        text: text.to_string(),
        usage_tokens,
    })
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max).collect();
        out.push_str("...");
        out
    }
}

//! Model ranking, chunk planning, and the delegation state machine.
//!
//! Everything here is pure: the app crate's router feeds backend outcomes
//! in as [`RouteEvent`]s and acts on the returned [`RouteState`]. Dry runs
//! call the same [`rank_models`] and [`plan_call`] functions as real runs.
//!
//! # State machine
//!
//! ```text
//! Pending ──Begin──▶ SelectingModel(c) ──Planned──▶ Calling(c, chunk, attempt)
//!                        │  ▲                          │    │        │
//!                Unsuitable │ capability / retries out  │    │ transient (attempt <= max)
//!                        ▼  │                          │    ▼        │
//!                 SelectingModel(c+1) ◀────────────────┘  Retrying ──BackoffElapsed──▶ Calling(c, chunk, attempt+1)
//!                        │                             │
//!             no more candidates                   ChunkDone ──▶ Calling(c, chunk+1, 1)
//!                        ▼                             │
//!                FallbackExhausted                  Finished ──▶ Succeeded(c)
//! ```

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{ContextPackage, FragmentKind};

/// Fixed per-chunk overhead for the "part i of n" header.
pub const CHUNK_HEADER_TOKENS: usize = 8;

/// Default share of a model's window reserved for its response.
pub const DEFAULT_RESPONSE_MARGIN: f64 = 0.10;

// ============ Model profiles ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostClass {
    Low,
    Medium,
    High,
}

impl fmt::Display for CostClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CostClass::Low => "low",
            CostClass::Medium => "medium",
            CostClass::High => "high",
        })
    }
}

/// Static capability description of one configured backend model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    /// Registry name, unique (e.g. `"gpt-small"`).
    pub name: String,
    /// Backend provider key (`"openai"`, `"command"`, `"echo"`).
    pub provider: String,
    /// Vendor model identifier sent to the backend.
    #[serde(default)]
    pub model: String,
    pub max_context_tokens: usize,
    pub cost_class: CostClass,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub average_latency_ms: u64,
    #[serde(default)]
    pub supports_chunking: bool,
    #[serde(default)]
    pub max_output_tokens: Option<usize>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

impl ModelProfile {
    /// Tokens reserved for the response: `ceil(max_context * margin)`.
    pub fn reserved_tokens(&self, margin: f64) -> usize {
        // 1000 * 0.1 must reserve 100, not 101.
        let raw = self.max_context_tokens as f64 * margin.clamp(0.0, 1.0);
        (raw - 1e-9).ceil().max(0.0) as usize
    }

    /// Tokens available for the prompt after the response margin.
    pub fn usable_window(&self, margin: f64) -> usize {
        self.max_context_tokens
            .saturating_sub(self.reserved_tokens(margin))
    }

    /// Number of task tags this model lists as strengths.
    pub fn strength_score(&self, tags: &[String]) -> usize {
        tags.iter()
            .filter(|t| self.strengths.iter().any(|s| s.eq_ignore_ascii_case(t)))
            .count()
    }
}

/// A candidate that survived filtering, in routing order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedModel {
    /// Position in the caller's candidate list.
    pub registry_index: usize,
    pub name: String,
    pub strength_score: usize,
    /// True when the whole package fits without chunking.
    pub fits_whole: bool,
}

/// Filter and order candidates for a package of `package_tokens`.
///
/// A model is kept when its window is at least the package size or it can
/// chunk. Order: strength score (desc), cost class (asc), average latency
/// (asc), then the caller's order.
pub fn rank_models(
    candidates: &[ModelProfile],
    package_tokens: usize,
    domain_tags: &[String],
) -> Vec<RankedModel> {
    let mut ranked: Vec<(usize, &ModelProfile, usize)> = candidates
        .iter()
        .enumerate()
        .filter(|(_, p)| p.max_context_tokens >= package_tokens || p.supports_chunking)
        .map(|(i, p)| (i, p, p.strength_score(domain_tags)))
        .collect();

    ranked.sort_by(|a, b| {
        b.2.cmp(&a.2)
            .then(a.1.cost_class.cmp(&b.1.cost_class))
            .then(a.1.average_latency_ms.cmp(&b.1.average_latency_ms))
            .then(a.0.cmp(&b.0))
    });

    ranked
        .into_iter()
        .map(|(i, p, score)| RankedModel {
            registry_index: i,
            name: p.name.clone(),
            strength_score: score,
            fits_whole: p.max_context_tokens >= package_tokens,
        })
        .collect()
}

// ============ Chunk planning ============

/// One sub-request of a chunked call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedChunk {
    pub index: usize,
    /// Indices into `ContextPackage::fragments`, in send order.
    pub fragment_indices: Vec<usize>,
    /// Fragment tokens carried by this chunk (excluding description/header).
    pub fragment_tokens: usize,
}

/// How a package will be sent to one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CallPlan {
    Single { prompt_tokens: usize },
    Chunked { chunks: Vec<PlannedChunk>, capacity: usize },
}

impl CallPlan {
    pub fn chunk_count(&self) -> usize {
        match self {
            CallPlan::Single { .. } => 1,
            CallPlan::Chunked { chunks, .. } => chunks.len(),
        }
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self, CallPlan::Chunked { .. })
    }
}

/// Why a model cannot take a package. Always a capability failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum PlanError {
    /// Package exceeds the usable window and the model cannot chunk.
    Overflow { needed: usize, usable: usize },
    /// A single fragment is larger than one chunk can carry.
    FragmentTooLarge {
        source: String,
        tokens: usize,
        capacity: usize,
    },
    /// The task description leaves no room for context in a chunk.
    DescriptionTooLarge { description_tokens: usize, usable: usize },
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanError::Overflow { needed, usable } => write!(
                f,
                "context overflow: {} tokens needed, {} usable and chunking unsupported",
                needed, usable
            ),
            PlanError::FragmentTooLarge {
                source,
                tokens,
                capacity,
            } => write!(
                f,
                "fragment '{}' ({} tokens) exceeds chunk capacity of {} tokens",
                source, tokens, capacity
            ),
            PlanError::DescriptionTooLarge {
                description_tokens,
                usable,
            } => write!(
                f,
                "task description ({} tokens) leaves no room for context in {} usable tokens",
                description_tokens, usable
            ),
        }
    }
}

/// Decide single vs chunked for `profile`.
///
/// The response margin is reserved from the window first. The task
/// description is replicated into every chunk, so it is charged per chunk.
/// Overview fragments are packed first and never split; the remaining
/// fragments follow in package order, filling each chunk sequentially.
pub fn plan_call(
    package: &ContextPackage,
    profile: &ModelProfile,
    description_tokens: usize,
    margin: f64,
) -> Result<CallPlan, PlanError> {
    let usable = profile.usable_window(margin);
    let needed = package.total_tokens_used + description_tokens;

    if needed <= usable {
        return Ok(CallPlan::Single {
            prompt_tokens: needed,
        });
    }
    if !profile.supports_chunking {
        return Err(PlanError::Overflow { needed, usable });
    }

    let capacity = usable.saturating_sub(description_tokens + CHUNK_HEADER_TOKENS);
    if capacity == 0 || package.fragments.is_empty() {
        return Err(PlanError::DescriptionTooLarge {
            description_tokens,
            usable,
        });
    }

    let mut order: Vec<usize> = package
        .fragments
        .iter()
        .enumerate()
        .filter(|(_, f)| f.kind == FragmentKind::Overview)
        .map(|(i, _)| i)
        .collect();
    order.extend(
        package
            .fragments
            .iter()
            .enumerate()
            .filter(|(_, f)| f.kind != FragmentKind::Overview)
            .map(|(i, _)| i),
    );

    let mut chunks: Vec<PlannedChunk> = Vec::new();
    let mut current = PlannedChunk {
        index: 0,
        fragment_indices: Vec::new(),
        fragment_tokens: 0,
    };

    for idx in order {
        let fragment = &package.fragments[idx];
        if fragment.tokens > capacity {
            return Err(PlanError::FragmentTooLarge {
                source: fragment.source.clone(),
                tokens: fragment.tokens,
                capacity,
            });
        }
        if current.fragment_tokens + fragment.tokens > capacity {
            let next_index = current.index + 1;
            chunks.push(std::mem::replace(
                &mut current,
                PlannedChunk {
                    index: next_index,
                    fragment_indices: Vec::new(),
                    fragment_tokens: 0,
                },
            ));
        }
        current.fragment_indices.push(idx);
        current.fragment_tokens += fragment.tokens;
    }
    if !current.fragment_indices.is_empty() {
        chunks.push(current);
    }
    if chunks.is_empty() {
        return Err(PlanError::DescriptionTooLarge {
            description_tokens,
            usable,
        });
    }

    Ok(CallPlan::Chunked { chunks, capacity })
}

/// Render the prompt(s) for a plan. One string per chunk, in chunk order.
pub fn render_prompts(description: &str, package: &ContextPackage, plan: &CallPlan) -> Vec<String> {
    match plan {
        CallPlan::Single { .. } => {
            let context = package.render();
            if context.is_empty() {
                vec![format!("# Task\n{}", description)]
            } else {
                vec![format!("# Task\n{}\n\n# Context\n{}", description, context)]
            }
        }
        CallPlan::Chunked { chunks, .. } => {
            let total = chunks.len();
            chunks
                .iter()
                .map(|chunk| {
                    let body = chunk
                        .fragment_indices
                        .iter()
                        .map(|&i| package.fragments[i].text.as_str())
                        .collect::<Vec<_>>()
                        .join("\n\n");
                    format!(
                        "# Task\n{}\n\n# Context (part {} of {})\n{}",
                        description,
                        chunk.index + 1,
                        total,
                        body
                    )
                })
                .collect()
        }
    }
}

/// Join chunk outputs by chunk index, whatever order they completed in.
pub fn merge_chunk_outputs(mut outputs: Vec<(usize, String)>) -> String {
    outputs.sort_by_key(|(index, _)| *index);
    outputs
        .into_iter()
        .map(|(_, text)| text)
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ============ Failures, attempts, state machine ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeout, rate limit, 5xx: retry on the same model.
    Transient,
    /// Overflow or explicit rejection: advance to the next model.
    Capability,
}

/// A classified backend failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl BackendFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn capability(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Capability,
            message: message.into(),
        }
    }
}

impl fmt::Display for BackendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.kind {
            FailureKind::Transient => "transient",
            FailureKind::Capability => "capability",
        };
        write!(f, "{}: {}", label, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Transient,
    Capability,
    /// Model was ranked but could not take the package; no call was made.
    Skipped,
    Cancelled,
}

impl From<FailureKind> for AttemptOutcome {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Transient => AttemptOutcome::Transient,
            FailureKind::Capability => AttemptOutcome::Capability,
        }
    }
}

/// One delegation-log entry. Written once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub task_id: String,
    pub model: String,
    pub attempt_number: u32,
    pub chunk_index: Option<usize>,
    pub outcome: AttemptOutcome,
    pub token_cost: usize,
    pub latency_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt on the same model.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
}

impl RetryPolicy {
    /// Delay before attempt `failed_attempt + 1`: base × 2^(n-1), exponent capped at 5.
    pub fn backoff_ms(&self, failed_attempt: u32) -> u64 {
        let exp = failed_attempt.saturating_sub(1).min(5);
        self.backoff_base_ms.saturating_mul(1u64 << exp)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RouteState {
    Pending,
    SelectingModel {
        candidate: usize,
    },
    Calling {
        candidate: usize,
        chunk: usize,
        attempt: u32,
    },
    Retrying {
        candidate: usize,
        chunk: usize,
        attempt: u32,
        delay_ms: u64,
    },
    Succeeded {
        candidate: usize,
    },
    FallbackExhausted,
}

impl RouteState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RouteState::Succeeded { .. } | RouteState::FallbackExhausted
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteEvent {
    Begin,
    /// The selected model accepted the plan; start calling.
    Planned,
    /// The selected model cannot take the package.
    Unsuitable,
    /// A chunk succeeded and more remain.
    ChunkDone,
    /// The last (or only) call succeeded.
    Finished,
    Failed(FailureKind),
    BackoffElapsed,
}

/// Pure transition function. Events that make no sense in the current
/// state leave it unchanged.
pub fn transition(
    state: RouteState,
    event: RouteEvent,
    policy: &RetryPolicy,
    candidate_count: usize,
) -> RouteState {
    let advance = |candidate: usize| {
        if candidate + 1 < candidate_count {
            RouteState::SelectingModel {
                candidate: candidate + 1,
            }
        } else {
            RouteState::FallbackExhausted
        }
    };

    match (state, event) {
        (RouteState::Pending, RouteEvent::Begin) => {
            if candidate_count == 0 {
                RouteState::FallbackExhausted
            } else {
                RouteState::SelectingModel { candidate: 0 }
            }
        }
        (RouteState::SelectingModel { candidate }, RouteEvent::Planned) => RouteState::Calling {
            candidate,
            chunk: 0,
            attempt: 1,
        },
        (RouteState::SelectingModel { candidate }, RouteEvent::Unsuitable) => advance(candidate),
        (RouteState::Calling { candidate, chunk, .. }, RouteEvent::ChunkDone) => {
            RouteState::Calling {
                candidate,
                chunk: chunk + 1,
                attempt: 1,
            }
        }
        (RouteState::Calling { candidate, .. }, RouteEvent::Finished) => {
            RouteState::Succeeded { candidate }
        }
        (
            RouteState::Calling {
                candidate,
                chunk,
                attempt,
            },
            RouteEvent::Failed(FailureKind::Transient),
        ) => {
            if attempt <= policy.max_retries {
                RouteState::Retrying {
                    candidate,
                    chunk,
                    attempt,
                    delay_ms: policy.backoff_ms(attempt),
                }
            } else {
                advance(candidate)
            }
        }
        (RouteState::Calling { candidate, .. }, RouteEvent::Failed(FailureKind::Capability)) => {
            advance(candidate)
        }
        (
            RouteState::Retrying {
                candidate,
                chunk,
                attempt,
                ..
            },
            RouteEvent::BackoffElapsed,
        ) => RouteState::Calling {
            candidate,
            chunk,
            attempt: attempt + 1,
        },
        (state, _) => state,
    }
}

/// Order helper for callers sorting by cost then latency without a task.
pub fn cheapest_first(a: &ModelProfile, b: &ModelProfile) -> Ordering {
    a.cost_class
        .cmp(&b.cost_class)
        .then(a.average_latency_ms.cmp(&b.average_latency_ms))
}

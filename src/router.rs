//! Delegation router.
//!
//! [`Router::plan`] ranks the candidate models and computes a call plan for
//! each; it performs no I/O and is what dry runs report. [`Router::execute`]
//! walks that plan through the state machine in
//! [`context_relay_core::routing`], calling backends, sleeping between
//! retries, and logging every attempt. [`Router::delegate`] is the two
//! together.
//!
//! Chunks of one task are sent sequentially and merged by chunk index.
//! Cancellation is cooperative: the flag is checked before every model
//! selection and raced against every call and backoff sleep.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use chrono::Utc;
use context_relay_core::error::{RelayError, RelayResult};
use context_relay_core::models::ContextPackage;
use context_relay_core::routing::{
    merge_chunk_outputs, plan_call, rank_models, render_prompts, transition, AttemptOutcome,
    AttemptRecord, BackendFailure, CallPlan, FailureKind, ModelProfile, PlanError, RetryPolicy,
    RouteEvent, RouteState, CHUNK_HEADER_TOKENS,
};
use context_relay_core::tokens::TokenEstimator;

use crate::backend::{BackendRegistry, BackendRequest};
use crate::delegation_log::DelegationLog;

/// Cooperative cancellation shared between a task's owner and its router call.
#[derive(Clone, Default)]
pub struct CancelFlag {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Everything the router needs for one task. `candidates` is the model
/// snapshot taken when the task was created.
#[derive(Debug, Clone)]
pub struct DelegationRequest {
    pub task_id: String,
    pub description: String,
    pub package: ContextPackage,
    pub candidates: Vec<ModelProfile>,
    /// Domain tags matched against model strengths.
    pub tags: Vec<String>,
}

/// The decision for one ranked candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidatePlan {
    pub model: String,
    pub provider: String,
    pub strength_score: usize,
    pub fits_whole: bool,
    /// Set when the model can take the package.
    pub plan: Option<CallPlan>,
    /// Set when it cannot.
    pub rejection: Option<PlanError>,
    pub estimated_prompt_tokens: usize,
}

/// Model selection and chunking for one task, in fallback order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutePlan {
    pub task_id: String,
    pub package_tokens: usize,
    pub description_tokens: usize,
    pub fragment_count: usize,
    pub candidates: Vec<CandidatePlan>,
    /// Models dropped before ranking: window too small and no chunking.
    pub filtered_out: Vec<String>,
}

impl RoutePlan {
    /// First candidate with a usable plan: the model a run without
    /// failures would use.
    pub fn selected(&self) -> Option<&CandidatePlan> {
        self.candidates.iter().find(|c| c.plan.is_some())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DelegationResult {
    pub task_id: String,
    pub model_used: String,
    pub chunks_executed: usize,
    pub merged_output: String,
    pub token_cost: usize,
    pub wall_time_ms: u64,
    pub attempts: Vec<AttemptRecord>,
}

pub struct Router {
    backends: BackendRegistry,
    log: Arc<DelegationLog>,
    policy: RetryPolicy,
    margin: f64,
    estimator: TokenEstimator,
}

impl Router {
    pub fn new(
        backends: BackendRegistry,
        log: Arc<DelegationLog>,
        policy: RetryPolicy,
        margin: f64,
        estimator: TokenEstimator,
    ) -> Self {
        Self {
            backends,
            log,
            policy,
            margin,
            estimator,
        }
    }

    pub fn log(&self) -> &Arc<DelegationLog> {
        &self.log
    }

    /// Tokens charged for the task description in every prompt.
    pub fn description_tokens(&self, description: &str) -> usize {
        self.estimator
            .estimate(&format!("# Task\n{}\n\n# Context\n", description))
    }

    /// Rank candidates and plan the call for each. Pure: no backend is touched.
    pub fn plan(&self, request: &DelegationRequest) -> RoutePlan {
        let package = &request.package;
        let description_tokens = self.description_tokens(&request.description);
        let ranked = rank_models(&request.candidates, package.total_tokens_used, &request.tags);

        let candidates = ranked
            .iter()
            .map(|r| {
                let profile = &request.candidates[r.registry_index];
                let planned = plan_call(package, profile, description_tokens, self.margin);
                let estimated_prompt_tokens = match &planned {
                    Ok(CallPlan::Single { prompt_tokens }) => *prompt_tokens,
                    Ok(CallPlan::Chunked { chunks, .. }) => chunks
                        .iter()
                        .map(|c| c.fragment_tokens + description_tokens + CHUNK_HEADER_TOKENS)
                        .sum(),
                    Err(_) => 0,
                };
                let (plan, rejection) = match planned {
                    Ok(plan) => (Some(plan), None),
                    Err(err) => (None, Some(err)),
                };
                CandidatePlan {
                    model: profile.name.clone(),
                    provider: profile.provider.clone(),
                    strength_score: r.strength_score,
                    fits_whole: r.fits_whole,
                    plan,
                    rejection,
                    estimated_prompt_tokens,
                }
            })
            .collect();

        let filtered_out = request
            .candidates
            .iter()
            .enumerate()
            .filter(|(i, _)| !ranked.iter().any(|r| r.registry_index == *i))
            .map(|(_, p)| p.name.clone())
            .collect();

        RoutePlan {
            task_id: request.task_id.clone(),
            package_tokens: package.total_tokens_used,
            description_tokens,
            fragment_count: package.fragments.len(),
            candidates,
            filtered_out,
        }
    }

    /// Plan and execute.
    pub async fn delegate(
        &self,
        request: &DelegationRequest,
        cancel: &CancelFlag,
    ) -> RelayResult<DelegationResult> {
        let plan = self.plan(request);
        self.execute(request, &plan, cancel).await
    }

    /// Execute a plan produced by [`plan`](Self::plan) for the same request.
    pub async fn execute(
        &self,
        request: &DelegationRequest,
        plan: &RoutePlan,
        cancel: &CancelFlag,
    ) -> RelayResult<DelegationResult> {
        let started = Instant::now();
        let task_id = request.task_id.as_str();
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut models_tried: Vec<String> = Vec::new();
        let mut last_error = String::new();

        for name in &plan.filtered_out {
            let reason = format!(
                "window smaller than {} tokens and chunking unsupported",
                plan.package_tokens
            );
            self.record(&mut attempts, skipped(task_id, name, &reason));
            models_tried.push(name.clone());
            last_error = format!("{}: {}", name, reason);
        }

        let count = plan.candidates.len();
        let mut state = transition(RouteState::Pending, RouteEvent::Begin, &self.policy, count);

        let mut prompts: Vec<String> = Vec::new();
        let mut outputs: Vec<(usize, String)> = Vec::new();
        let mut token_cost = 0usize;

        loop {
            let event = match state {
                RouteState::Pending => RouteEvent::Begin,

                RouteState::SelectingModel { candidate } => {
                    if cancel.is_cancelled() {
                        return Err(self.cancelled(task_id, &mut attempts, None, 0));
                    }
                    let choice = &plan.candidates[candidate];
                    models_tried.push(choice.model.clone());
                    outputs.clear();

                    let unsuitable = match (&choice.plan, &choice.rejection) {
                        (Some(call_plan), _) => {
                            if self.backends.get(&choice.provider).is_none() {
                                Some(format!("no backend registered for provider '{}'", choice.provider))
                            } else {
                                prompts = render_prompts(&request.description, &request.package, call_plan);
                                if prompts.is_empty() {
                                    Some("plan rendered no prompts".to_string())
                                } else {
                                    None
                                }
                            }
                        }
                        (None, Some(rejection)) => Some(rejection.to_string()),
                        (None, None) => Some("no plan".to_string()),
                    };

                    match unsuitable {
                        Some(reason) => {
                            tracing::info!(task = task_id, model = %choice.model, %reason, "model unsuitable");
                            self.record(&mut attempts, skipped(task_id, &choice.model, &reason));
                            last_error = format!("{}: {}", choice.model, reason);
                            RouteEvent::Unsuitable
                        }
                        None => {
                            tracing::info!(
                                task = task_id,
                                model = %choice.model,
                                chunks = prompts.len(),
                                "model selected"
                            );
                            RouteEvent::Planned
                        }
                    }
                }

                RouteState::Calling {
                    candidate,
                    chunk,
                    attempt,
                } => {
                    let choice = &plan.candidates[candidate];
                    if cancel.is_cancelled() {
                        return Err(self.cancelled(task_id, &mut attempts, Some(&choice.model), outputs.len()));
                    }
                    let Some(profile) = request.candidates.iter().find(|p| p.name == choice.model)
                    else {
                        return Err(RelayError::UnknownModel(choice.model.clone()));
                    };
                    let Some(backend) = self.backends.get(&choice.provider) else {
                        return Err(RelayError::ModelUnavailable {
                            model: choice.model.clone(),
                            reason: format!("no backend for provider '{}'", choice.provider),
                        });
                    };

                    let Some(prompt) = prompts.get(chunk) else {
                        return Err(RelayError::ModelUnavailable {
                            model: choice.model.clone(),
                            reason: format!("no prompt for chunk {} of {}", chunk + 1, prompts.len()),
                        });
                    };
                    let chunked = prompts.len() > 1
                        || choice.plan.as_ref().map(|p| p.is_chunked()).unwrap_or(false);
                    let backend_request = BackendRequest {
                        task_id: task_id.to_string(),
                        prompt: prompt.clone(),
                        chunk_index: chunk,
                        chunk_count: prompts.len(),
                    };

                    let call_started = Instant::now();
                    let outcome = tokio::select! {
                        result = backend.complete(profile, &backend_request) => Some(result),
                        _ = cancel.cancelled() => None,
                    };
                    let latency_ms = call_started.elapsed().as_millis() as u64;

                    let Some(outcome) = outcome else {
                        return Err(self.cancelled(task_id, &mut attempts, Some(&choice.model), outputs.len()));
                    };

                    let chunk_index = chunked.then_some(chunk);
                    match outcome {
                        Ok(reply) => {
                            let cost = reply.usage_tokens.unwrap_or_else(|| {
                                self.estimator.estimate(&backend_request.prompt)
                                    + self.estimator.estimate(&reply.text)
                            });
                            token_cost += cost;
                            self.record(
                                &mut attempts,
                                AttemptRecord {
                                    task_id: task_id.to_string(),
                                    model: choice.model.clone(),
                                    attempt_number: attempt,
                                    chunk_index,
                                    outcome: AttemptOutcome::Success,
                                    token_cost: cost,
                                    latency_ms,
                                    error: None,
                                    at: Utc::now(),
                                },
                            );
                            outputs.push((chunk, reply.text));
                            if chunk + 1 < prompts.len() {
                                RouteEvent::ChunkDone
                            } else {
                                RouteEvent::Finished
                            }
                        }
                        Err(failure) => {
                            self.record(
                                &mut attempts,
                                failed(task_id, &choice.model, attempt, chunk_index, latency_ms, &failure),
                            );
                            last_error = format!("{}: {}", choice.model, failure);
                            match failure.kind {
                                FailureKind::Transient => tracing::warn!(
                                    task = task_id,
                                    model = %choice.model,
                                    attempt,
                                    error = %failure.message,
                                    "transient failure"
                                ),
                                FailureKind::Capability => tracing::warn!(
                                    task = task_id,
                                    model = %choice.model,
                                    error = %failure.message,
                                    "capability failure; falling back"
                                ),
                            }
                            RouteEvent::Failed(failure.kind)
                        }
                    }
                }

                RouteState::Retrying { delay_ms, candidate, .. } => {
                    tracing::debug!(task = task_id, delay_ms, "backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                        _ = cancel.cancelled() => {
                            let model = plan.candidates[candidate].model.clone();
                            return Err(self.cancelled(task_id, &mut attempts, Some(&model), outputs.len()));
                        }
                    }
                    RouteEvent::BackoffElapsed
                }

                RouteState::Succeeded { candidate } => {
                    let model_used = plan.candidates[candidate].model.clone();
                    let chunks_executed = outputs.len();
                    let merged_output = merge_chunk_outputs(std::mem::take(&mut outputs));
                    tracing::info!(
                        task = task_id,
                        model = %model_used,
                        chunks = chunks_executed,
                        tokens = token_cost,
                        "delegation succeeded"
                    );
                    return Ok(DelegationResult {
                        task_id: task_id.to_string(),
                        model_used,
                        chunks_executed,
                        merged_output,
                        token_cost,
                        wall_time_ms: started.elapsed().as_millis() as u64,
                        attempts,
                    });
                }

                RouteState::FallbackExhausted => {
                    if last_error.is_empty() {
                        last_error = "no candidate models".to_string();
                    }
                    tracing::warn!(task = task_id, error = %last_error, "all models exhausted");
                    return Err(RelayError::AllModelsExhausted {
                        task_id: task_id.to_string(),
                        models_tried,
                        fragment_count: plan.fragment_count,
                        last_error,
                        attempts,
                    });
                }
            };

            state = transition(state, event, &self.policy, count);
        }
    }

    fn record(&self, attempts: &mut Vec<AttemptRecord>, record: AttemptRecord) {
        if let Err(err) = self.log.append(record.clone()) {
            tracing::warn!(error = %err, "failed to write delegation log entry");
        }
        attempts.push(record);
    }

    fn cancelled(
        &self,
        task_id: &str,
        attempts: &mut Vec<AttemptRecord>,
        model: Option<&str>,
        completed_chunks: usize,
    ) -> RelayError {
        if let Some(model) = model {
            self.record(
                attempts,
                AttemptRecord {
                    task_id: task_id.to_string(),
                    model: model.to_string(),
                    attempt_number: 0,
                    chunk_index: None,
                    outcome: AttemptOutcome::Cancelled,
                    token_cost: 0,
                    latency_ms: 0,
                    error: None,
                    at: Utc::now(),
                },
            );
        }
        tracing::info!(task = task_id, completed_chunks, "delegation cancelled");
        RelayError::Cancelled {
            task_id: task_id.to_string(),
            partial: completed_chunks > 0,
            completed_chunks,
        }
    }
}

fn skipped(task_id: &str, model: &str, reason: &str) -> AttemptRecord {
    AttemptRecord {
        task_id: task_id.to_string(),
        model: model.to_string(),
        attempt_number: 0,
        chunk_index: None,
        outcome: AttemptOutcome::Skipped,
        token_cost: 0,
        latency_ms: 0,
        error: Some(reason.to_string()),
        at: Utc::now(),
    }
}

fn failed(
    task_id: &str,
    model: &str,
    attempt: u32,
    chunk_index: Option<usize>,
    latency_ms: u64,
    failure: &BackendFailure,
) -> AttemptRecord {
    AttemptRecord {
        task_id: task_id.to_string(),
        model: model.to_string(),
        attempt_number: attempt,
        chunk_index,
        outcome: failure.kind.into(),
        token_cost: 0,
        latency_ms,
        error: Some(failure.message.clone()),
        at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendReply, ModelBackend};
    use async_trait::async_trait;
    use context_relay_core::models::{ContextFragment, FragmentKind};
    use context_relay_core::routing::CostClass;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Backend that replays scripted failures, then echoes the chunk index.
    #[derive(Default)]
    struct Scripted {
        script: Mutex<VecDeque<BackendFailure>>,
        calls: Mutex<Vec<(String, usize)>>,
    }

    #[async_trait]
    impl ModelBackend for Scripted {
        fn provider(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            profile: &ModelProfile,
            request: &BackendRequest,
        ) -> Result<BackendReply, BackendFailure> {
            self.calls
                .lock()
                .unwrap()
                .push((profile.name.clone(), request.chunk_index));
            if let Some(failure) = self.script.lock().unwrap().pop_front() {
                return Err(failure);
            }
            Ok(BackendReply {
                text: format!("{}#{}", profile.name, request.chunk_index),
                usage_tokens: Some(10),
            })
        }
    }

    fn profile(name: &str, max: usize, chunking: bool) -> ModelProfile {
        ModelProfile {
            name: name.into(),
            provider: "scripted".into(),
            model: String::new(),
            max_context_tokens: max,
            cost_class: CostClass::Low,
            strengths: vec![],
            average_latency_ms: 0,
            supports_chunking: chunking,
            max_output_tokens: None,
            endpoint: None,
            api_key_env: None,
            command: None,
        }
    }

    fn package(costs: &[usize]) -> ContextPackage {
        ContextPackage {
            scenario: "t".into(),
            query: None,
            fragments: costs
                .iter()
                .enumerate()
                .map(|(i, &tokens)| ContextFragment {
                    source: format!("m{}.rs", i),
                    kind: FragmentKind::Module,
                    text: format!("## m{}.rs", i),
                    tokens,
                    rank: 1,
                    rule: None,
                })
                .collect(),
            total_tokens_used: costs.iter().sum(),
            budget_tokens: costs.iter().sum(),
            rejected: vec![],
            query_matched: true,
            empty_reason: None,
        }
    }

    fn router(backend: Arc<Scripted>) -> Router {
        let mut backends = BackendRegistry::new();
        backends.register(backend);
        Router::new(
            backends,
            Arc::new(DelegationLog::in_memory()),
            RetryPolicy {
                max_retries: 2,
                backoff_base_ms: 1,
            },
            0.1,
            TokenEstimator::default(),
        )
    }

    fn request(costs: &[usize], candidates: Vec<ModelProfile>) -> DelegationRequest {
        DelegationRequest {
            task_id: "task-1".into(),
            description: "explain".into(),
            package: package(costs),
            candidates,
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn test_transient_retried_then_success() {
        let backend = Arc::new(Scripted::default());
        backend
            .script
            .lock()
            .unwrap()
            .extend([BackendFailure::transient("429"), BackendFailure::transient("503")]);
        let r = router(backend.clone());
        let result = r
            .delegate(&request(&[100], vec![profile("a", 1_000, false)]), &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(result.model_used, "a");
        assert_eq!(backend.calls.lock().unwrap().len(), 3);
        assert_eq!(result.attempts.len(), 3);
        assert_eq!(result.attempts[2].attempt_number, 3);
    }

    #[tokio::test]
    async fn test_capability_advances_without_retry() {
        let backend = Arc::new(Scripted::default());
        backend
            .script
            .lock()
            .unwrap()
            .push_back(BackendFailure::capability("rejected"));
        let r = router(backend.clone());
        let result = r
            .delegate(
                &request(&[100], vec![profile("a", 1_000, false), profile("b", 1_000, false)]),
                &CancelFlag::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.model_used, "b");
        let calls = backend.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![("a".to_string(), 0), ("b".to_string(), 0)]);
    }

    #[tokio::test]
    async fn test_exhaustion_carries_history() {
        let backend = Arc::new(Scripted::default());
        backend.script.lock().unwrap().extend(
            std::iter::repeat_with(|| BackendFailure::transient("timeout")).take(10),
        );
        let r = router(backend);
        let err = r
            .delegate(&request(&[100, 50], vec![profile("a", 1_000, false)]), &CancelFlag::new())
            .await
            .unwrap_err();
        match err {
            RelayError::AllModelsExhausted {
                task_id,
                models_tried,
                fragment_count,
                last_error,
                attempts,
            } => {
                assert_eq!(task_id, "task-1");
                assert_eq!(models_tried, vec!["a"]);
                assert_eq!(fragment_count, 2);
                assert!(last_error.contains("timeout"));
                assert_eq!(attempts.len(), 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_chunk_outputs_merged_in_order() {
        let backend = Arc::new(Scripted::default());
        let r = router(backend);
        let result = r
            .delegate(&request(&[400; 6], vec![profile("a", 1_000, true)]), &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(result.chunks_executed, 3);
        assert_eq!(result.merged_output, "a#0\n\na#1\n\na#2");
        assert!(result.attempts.iter().all(|a| a.chunk_index.is_some()));
    }

    #[tokio::test]
    async fn test_plan_matches_execution() {
        let backend = Arc::new(Scripted::default());
        let r = router(backend.clone());
        let req = request(&[400; 6], vec![profile("small", 100, false), profile("a", 1_000, true)]);
        let plan = r.plan(&req);
        assert_eq!(plan.filtered_out, vec!["small"]);
        let selected = plan.selected().unwrap();
        assert_eq!(selected.model, "a");
        assert_eq!(backend.calls.lock().unwrap().len(), 0);

        let result = r.execute(&req, &plan, &CancelFlag::new()).await.unwrap();
        assert_eq!(result.chunks_executed, selected.plan.as_ref().unwrap().chunk_count());
        assert_eq!(result.attempts[0].outcome, AttemptOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_oversized_description_on_empty_package_exhausts() {
        let backend = Arc::new(Scripted::default());
        let r = router(backend.clone());
        let mut req = request(&[], vec![profile("a", 1_000, true)]);
        req.description = "x".repeat(4_000);

        let plan = r.plan(&req);
        assert!(plan.selected().is_none());
        assert!(matches!(
            plan.candidates[0].rejection,
            Some(PlanError::DescriptionTooLarge { .. })
        ));

        let err = r.execute(&req, &plan, &CancelFlag::new()).await.unwrap_err();
        match err {
            RelayError::AllModelsExhausted { last_error, fragment_count, .. } => {
                assert_eq!(fragment_count, 0);
                assert!(last_error.contains("task description"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(backend.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_package_is_delegated_as_single_call() {
        let backend = Arc::new(Scripted::default());
        let r = router(backend.clone());
        let result = r
            .delegate(&request(&[], vec![profile("a", 1_000, true)]), &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(result.chunks_executed, 1);
        assert_eq!(result.merged_output, "a#0");
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let r = router(Arc::new(Scripted::default()));
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = r
            .delegate(&request(&[10], vec![profile("a", 1_000, false)]), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Cancelled { partial: false, .. }));
    }

    #[tokio::test]
    async fn test_attempts_written_to_log() {
        let backend = Arc::new(Scripted::default());
        let r = router(backend);
        r.delegate(&request(&[10], vec![profile("a", 1_000, false)]), &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(r.log().entries_for("task-1").len(), 1);
    }
}

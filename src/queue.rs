//! Batch queue in front of the router.
//!
//! Tasks are held in enqueue order behind one mutex. `process` claims the
//! oldest pending task under that lock (marking it in-flight before the
//! lock is released), so a task is never handed out twice, even when
//! tasks are enqueued while `process` is running. A semaphore bounds the
//! number of in-flight router calls; start order is FIFO, completion order
//! is not.
//!
//! Dry runs call the same [`Router::plan`] as real runs and stop there:
//! no backend is called and task status is left untouched.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use context_relay_core::error::{ErrorKind, RelayError};
use context_relay_core::models::ContextPackage;
use context_relay_core::routing::ModelProfile;

use crate::progress::{NoProgress, ProgressReporter, QueueProgressEvent};
use crate::router::{CancelFlag, DelegationRequest, DelegationResult, RoutePlan, Router};

/// Upper bound on `concurrency`, matching config validation.
pub const MAX_CONCURRENCY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InFlight,
    Succeeded,
    Failed,
    FallbackExhausted,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InFlight => "in_flight",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::FallbackExhausted => "fallback_exhausted",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::InFlight)
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "pending" => TaskStatus::Pending,
            "in_flight" => TaskStatus::InFlight,
            "succeeded" => TaskStatus::Succeeded,
            "failed" => TaskStatus::Failed,
            "fallback_exhausted" => TaskStatus::FallbackExhausted,
            "cancelled" => TaskStatus::Cancelled,
            other => bail!("unknown task status '{}'", other),
        })
    }
}

/// Why a task did not succeed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
    /// Some chunks completed before the task stopped.
    pub partial: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DelegationTask {
    pub id: String,
    pub description: String,
    pub package: ContextPackage,
    /// Model snapshot taken at creation.
    pub candidate_models: Vec<ModelProfile>,
    pub tags: Vec<String>,
    pub status: TaskStatus,
    pub enqueued_at: DateTime<Utc>,
    pub plan: Option<RoutePlan>,
    pub result: Option<DelegationResult>,
    pub error: Option<TaskError>,
}

impl DelegationTask {
    pub fn new(
        description: impl Into<String>,
        package: ContextPackage,
        candidate_models: Vec<ModelProfile>,
        tags: Vec<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            description: description.into(),
            package,
            candidate_models,
            tags,
            status: TaskStatus::Pending,
            enqueued_at: Utc::now(),
            plan: None,
            result: None,
            error: None,
        }
    }

    fn request(&self) -> DelegationRequest {
        DelegationRequest {
            task_id: self.id.clone(),
            description: self.description.clone(),
            package: self.package.clone(),
            candidates: self.candidate_models.clone(),
            tags: self.tags.clone(),
        }
    }
}

/// What one task did during a `process` call.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task_id: String,
    pub description: String,
    pub status: TaskStatus,
    pub selected_model: Option<String>,
    pub chunk_count: usize,
    pub estimated_prompt_tokens: usize,
    pub plan: RoutePlan,
    pub token_cost: Option<usize>,
    pub error: Option<TaskError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueReport {
    pub dry_run: bool,
    pub tasks: Vec<TaskReport>,
}

impl QueueReport {
    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    pub fn estimated_prompt_tokens(&self) -> usize {
        self.tasks.iter().map(|t| t.estimated_prompt_tokens).sum()
    }
}

struct TaskSlot {
    task: DelegationTask,
    cancel: CancelFlag,
}

type Slots = Arc<Mutex<Vec<TaskSlot>>>;

pub struct BatchQueue {
    router: Arc<Router>,
    slots: Slots,
    progress: Arc<dyn ProgressReporter>,
}

impl BatchQueue {
    pub fn new(router: Arc<Router>) -> Self {
        Self {
            router,
            slots: Arc::new(Mutex::new(Vec::new())),
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Add a task at the back of the queue. Returns its id.
    pub fn enqueue(&self, task: DelegationTask) -> String {
        let id = task.id.clone();
        tracing::debug!(task = %id, "enqueued");
        lock(&self.slots).push(TaskSlot {
            task,
            cancel: CancelFlag::new(),
        });
        id
    }

    /// Tasks in enqueue order, optionally filtered by status.
    pub fn list(&self, status: Option<TaskStatus>) -> Vec<DelegationTask> {
        lock(&self.slots)
            .iter()
            .filter(|s| status.map(|st| s.task.status == st).unwrap_or(true))
            .map(|s| s.task.clone())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<DelegationTask> {
        lock(&self.slots)
            .iter()
            .find(|s| s.task.id == id)
            .map(|s| s.task.clone())
    }

    /// Cancel a task. Pending tasks become `Cancelled` at once; in-flight
    /// tasks are signalled and settle when the router notices. Returns the
    /// status right after the request, or `None` for an unknown id.
    pub fn cancel(&self, id: &str) -> Option<TaskStatus> {
        let mut slots = lock(&self.slots);
        let slot = slots.iter_mut().find(|s| s.task.id == id)?;
        match slot.task.status {
            TaskStatus::Pending => {
                slot.task.status = TaskStatus::Cancelled;
                slot.cancel.cancel();
            }
            TaskStatus::InFlight => slot.cancel.cancel(),
            _ => {}
        }
        Some(slot.task.status)
    }

    /// Remove finished tasks (all of them, or only those with `status`).
    /// Pending and in-flight tasks are never purged. Returns how many were removed.
    pub fn purge(&self, status: Option<TaskStatus>) -> usize {
        let mut slots = lock(&self.slots);
        let before = slots.len();
        slots.retain(|s| {
            let matches = status.map(|st| s.task.status == st).unwrap_or(true);
            !(s.task.status.is_finished() && matches)
        });
        before - slots.len()
    }

    /// Drain pending tasks through the router.
    pub async fn process(&self, dry_run: bool, concurrency: usize) -> Result<QueueReport> {
        if dry_run {
            return Ok(self.preview());
        }

        let semaphore = Arc::new(Semaphore::new(concurrency.clamp(1, MAX_CONCURRENCY)));
        let mut joins: JoinSet<()> = JoinSet::new();
        let mut order: Vec<String> = Vec::new();

        loop {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .context("queue semaphore closed")?;

            let Some((request, cancel)) = claim_next(&self.slots) else {
                drop(permit);
                // Nothing pending now; wait for an in-flight task, then
                // look again in case more work was enqueued meanwhile.
                match joins.join_next().await {
                    Some(joined) => {
                        if let Err(err) = joined {
                            tracing::error!(error = %err, "queue worker panicked");
                        }
                        continue;
                    }
                    None => break,
                }
            };

            order.push(request.task_id.clone());
            let plan = self.router.plan(&request);
            set_plan(&self.slots, &request.task_id, plan.clone());
            self.progress.report(QueueProgressEvent::Started {
                task_id: request.task_id.clone(),
                model: plan.selected().map(|c| c.model.clone()),
                chunks: plan
                    .selected()
                    .and_then(|c| c.plan.as_ref())
                    .map(|p| p.chunk_count())
                    .unwrap_or(0),
            });

            let router = self.router.clone();
            let slots = self.slots.clone();
            let progress = self.progress.clone();
            joins.spawn(async move {
                let task_id = request.task_id.clone();
                let worker =
                    tokio::spawn(async move { router.execute(&request, &plan, &cancel).await });
                let outcome = match worker.await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        tracing::error!(task = %task_id, error = %err, "queue worker panicked");
                        Err(RelayError::WorkerAborted {
                            task_id: task_id.clone(),
                            reason: err.to_string(),
                        })
                    }
                };
                drop(permit);
                let status = settle(&slots, &task_id, outcome);
                let (done, remaining) = counts(&slots);
                progress.report(QueueProgressEvent::Finished {
                    task_id,
                    status,
                    done,
                    remaining,
                });
            });
        }

        let slots = lock(&self.slots);
        let tasks = order
            .iter()
            .filter_map(|id| slots.iter().find(|s| &s.task.id == id))
            .filter_map(|s| report_for(&s.task))
            .collect();
        Ok(QueueReport {
            dry_run: false,
            tasks,
        })
    }

    /// Plan every pending task without executing anything.
    fn preview(&self) -> QueueReport {
        let pending: Vec<DelegationTask> = self.list(Some(TaskStatus::Pending));
        let mut tasks = Vec::with_capacity(pending.len());
        for task in pending {
            let plan = self.router.plan(&task.request());
            self.progress.report(QueueProgressEvent::Started {
                task_id: task.id.clone(),
                model: plan.selected().map(|c| c.model.clone()),
                chunks: plan
                    .selected()
                    .and_then(|c| c.plan.as_ref())
                    .map(|p| p.chunk_count())
                    .unwrap_or(0),
            });
            let planned = DelegationTask {
                plan: Some(plan),
                ..task
            };
            if let Some(report) = report_for(&planned) {
                tasks.push(report);
            }
        }
        QueueReport {
            dry_run: true,
            tasks,
        }
    }
}

fn lock(slots: &Slots) -> std::sync::MutexGuard<'_, Vec<TaskSlot>> {
    slots.lock().unwrap_or_else(|e| e.into_inner())
}

/// Mark the oldest pending task in-flight and hand out its request.
fn claim_next(slots: &Slots) -> Option<(DelegationRequest, CancelFlag)> {
    let mut slots = lock(slots);
    let slot = slots
        .iter_mut()
        .find(|s| s.task.status == TaskStatus::Pending)?;
    slot.task.status = TaskStatus::InFlight;
    Some((slot.task.request(), slot.cancel.clone()))
}

fn set_plan(slots: &Slots, id: &str, plan: RoutePlan) {
    if let Some(slot) = lock(slots).iter_mut().find(|s| s.task.id == id) {
        slot.task.plan = Some(plan);
    }
}

/// Record a router outcome on the task and return its final status.
fn settle(slots: &Slots, id: &str, outcome: Result<DelegationResult, RelayError>) -> TaskStatus {
    let (status, result, error) = match outcome {
        Ok(result) => (TaskStatus::Succeeded, Some(result), None),
        Err(err) => {
            let status = match &err {
                RelayError::AllModelsExhausted { .. } => TaskStatus::FallbackExhausted,
                RelayError::Cancelled { partial: false, .. } => TaskStatus::Cancelled,
                _ => TaskStatus::Failed,
            };
            let partial = matches!(err, RelayError::Cancelled { partial: true, .. });
            tracing::warn!(task = id, status = status.as_str(), error = %err, "task did not succeed");
            (
                status,
                None,
                Some(TaskError {
                    kind: err.kind(),
                    message: err.to_string(),
                    partial,
                }),
            )
        }
    };

    if let Some(slot) = lock(slots).iter_mut().find(|s| s.task.id == id) {
        slot.task.status = status;
        slot.task.result = result;
        slot.task.error = error;
    }
    status
}

fn counts(slots: &Slots) -> (u64, u64) {
    let slots = lock(slots);
    let done = slots.iter().filter(|s| s.task.status.is_finished()).count() as u64;
    (done, slots.len() as u64 - done)
}

fn report_for(task: &DelegationTask) -> Option<TaskReport> {
    let plan = task.plan.clone()?;
    let selected = plan.selected();
    Some(TaskReport {
        task_id: task.id.clone(),
        description: task.description.clone(),
        status: task.status,
        selected_model: selected.map(|c| c.model.clone()),
        chunk_count: selected
            .and_then(|c| c.plan.as_ref())
            .map(|p| p.chunk_count())
            .unwrap_or(0),
        estimated_prompt_tokens: selected.map(|c| c.estimated_prompt_tokens).unwrap_or(0),
        token_cost: task.result.as_ref().map(|r| r.token_cost),
        error: task.error.clone(),
        plan,
    })
}

// ============ Batch files ============

/// One entry of a batch file.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchEntry {
    pub description: String,
    #[serde(default)]
    pub scenario: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub active_file: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchFile {
    #[serde(rename = "tasks")]
    pub tasks: Vec<BatchEntry>,
}

/// Parse a TOML batch file of `[[tasks]]` entries.
pub fn load_batch_file(path: &Path) -> Result<BatchFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read batch file: {}", path.display()))?;
    let file: BatchFile =
        toml::from_str(&content).with_context(|| "Failed to parse batch file")?;
    if file.tasks.is_empty() {
        bail!("batch file {} contains no [[tasks]]", path.display());
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendRegistry, EchoBackend};
    use crate::delegation_log::DelegationLog;
    use context_relay_core::routing::{CostClass, RetryPolicy};
    use context_relay_core::tokens::TokenEstimator;

    fn profile(name: &str, max: usize) -> ModelProfile {
        ModelProfile {
            name: name.into(),
            provider: "echo".into(),
            model: String::new(),
            max_context_tokens: max,
            cost_class: CostClass::Low,
            strengths: vec![],
            average_latency_ms: 0,
            supports_chunking: true,
            max_output_tokens: None,
            endpoint: None,
            api_key_env: None,
            command: None,
        }
    }

    fn empty_package() -> ContextPackage {
        ContextPackage {
            scenario: "minimal".into(),
            query: None,
            fragments: vec![],
            total_tokens_used: 0,
            budget_tokens: 100,
            rejected: vec![],
            query_matched: true,
            empty_reason: None,
        }
    }

    fn queue() -> BatchQueue {
        let mut backends = BackendRegistry::new();
        backends.register(Arc::new(EchoBackend));
        let router = Router::new(
            backends,
            Arc::new(DelegationLog::in_memory()),
            RetryPolicy::default(),
            0.1,
            TokenEstimator::default(),
        );
        BatchQueue::new(Arc::new(router))
    }

    fn task(desc: &str) -> DelegationTask {
        DelegationTask::new(desc, empty_package(), vec![profile("echo-1", 1_000)], vec![])
    }

    #[tokio::test]
    async fn test_process_runs_fifo_and_settles() {
        let q = queue();
        let a = q.enqueue(task("a"));
        let b = q.enqueue(task("b"));
        let report = q.process(false, 1).await.unwrap();
        let ids: Vec<&str> = report.tasks.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec![a.as_str(), b.as_str()]);
        assert_eq!(report.count(TaskStatus::Succeeded), 2);
        assert!(q.list(Some(TaskStatus::Pending)).is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_leaves_tasks_pending() {
        let q = queue();
        q.enqueue(task("a"));
        let report = q.process(true, 4).await.unwrap();
        assert!(report.dry_run);
        assert_eq!(report.tasks[0].selected_model.as_deref(), Some("echo-1"));
        assert_eq!(report.tasks[0].status, TaskStatus::Pending);
        assert!(q.router.log().entries().is_empty());
        assert_eq!(q.list(Some(TaskStatus::Pending)).len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_pending_and_purge() {
        let q = queue();
        let a = q.enqueue(task("a"));
        let b = q.enqueue(task("b"));
        assert_eq!(q.cancel(&a), Some(TaskStatus::Cancelled));
        assert_eq!(q.cancel("missing"), None);

        let report = q.process(false, 2).await.unwrap();
        assert_eq!(report.tasks.len(), 1);
        assert_eq!(report.tasks[0].task_id, b);

        assert_eq!(q.purge(Some(TaskStatus::Cancelled)), 1);
        assert_eq!(q.list(None).len(), 1);
        assert_eq!(q.purge(None), 1);
        assert!(q.list(None).is_empty());
    }

    #[test]
    fn test_status_round_trip_through_str() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::InFlight,
            TaskStatus::FallbackExhausted,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(s.as_str().parse::<TaskStatus>().unwrap(), s);
        }
    }

    #[test]
    fn test_load_batch_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("tasks.toml");
        std::fs::write(
            &path,
            "[[tasks]]\ndescription = \"summarise cache\"\nscenario = \"focused\"\nquery = \"cache\"\n\n[[tasks]]\ndescription = \"review router\"\ntags = [\"rust\"]\n",
        )
        .unwrap();
        let file = load_batch_file(&path).unwrap();
        assert_eq!(file.tasks.len(), 2);
        assert_eq!(file.tasks[1].tags, vec!["rust"]);

        std::fs::write(&path, "tasks = []\n").unwrap();
        assert!(load_batch_file(&path).is_err());
    }
}

//! Worker pool: fixed-size set of execution slots.
//!
//! The control loop sees workers only through [`WorkerPool`] (which task each
//! slot is bound to) and the [`WorkerRuntime`] trait (assign, terminate,
//! respawn, liveness). [`TokioWorkerRuntime`] runs each worker as a tokio
//! task driving an [`Executor`]; workers talk back exclusively through JSON
//! records on the inbound event channel.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use overseer_providers::{
    ChatMessage, ErrorClass, FailoverError, OpenAiCompatibleClient, ProviderFailure, ProviderRouter,
    run_with_failover,
};
use overseer_scheduler::{Task, TaskKind};
use serde::Serialize;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::budget::Usage;
use crate::events::{
    self, EventKind, LlmUsage, ProviderFailureEvent, SendMessage, TaskDone, TaskHeartbeat,
    TaskMetrics,
};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker {0} does not exist")]
    Unknown(usize),
    #[error("worker {0} is not running")]
    NotAlive(usize),
    #[error("worker {0} is busy")]
    Busy(usize),
}

// ── Pool bookkeeping ──────────────────────────────────────

/// One execution slot as seen by the control loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerSlot {
    pub id: usize,
    pub busy_task_id: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
}

/// Which slot runs which task.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    slots: Vec<WorkerSlot>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            slots: (0..size)
                .map(|id| WorkerSlot {
                    id,
                    ..Default::default()
                })
                .collect(),
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> &[WorkerSlot] {
        &self.slots
    }

    pub fn busy_task(&self, worker_id: usize) -> Option<&str> {
        self.slots.get(worker_id)?.busy_task_id.as_deref()
    }

    pub fn bind(&mut self, worker_id: usize, task_id: &str, now: DateTime<Utc>) -> Result<(), WorkerError> {
        let slot = self
            .slots
            .get_mut(worker_id)
            .ok_or(WorkerError::Unknown(worker_id))?;
        if slot.busy_task_id.is_some() {
            return Err(WorkerError::Busy(worker_id));
        }
        slot.busy_task_id = Some(task_id.to_string());
        slot.assigned_at = Some(now);
        Ok(())
    }

    /// Free the slot, but only if it is still bound to `task_id`.
    pub fn release(&mut self, worker_id: usize, task_id: &str) -> bool {
        match self.slots.get_mut(worker_id) {
            Some(slot) if slot.busy_task_id.as_deref() == Some(task_id) => {
                slot.busy_task_id = None;
                slot.assigned_at = None;
                true
            }
            _ => false,
        }
    }

    /// Unbound slots whose worker is alive, lowest id first.
    pub fn idle_ids(&self, is_alive: impl Fn(usize) -> bool) -> Vec<usize> {
        self.slots
            .iter()
            .filter(|s| s.busy_task_id.is_none() && is_alive(s.id))
            .map(|s| s.id)
            .collect()
    }
}

// ── Runtime seam ──────────────────────────────────────────

/// Spawning, killing and feeding workers.
#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    fn size(&self) -> usize;

    fn is_alive(&self, worker_id: usize) -> bool;

    /// Hand `task` to an idle worker. Must not wait for the task to finish.
    async fn assign(&self, worker_id: usize, task: Task) -> Result<(), WorkerError>;

    /// Ask the worker to stop, wait up to `grace`, then kill it.
    async fn terminate(&self, worker_id: usize, grace: Duration);

    /// Replace a terminated worker with a fresh one.
    async fn respawn(&self, worker_id: usize) -> Result<(), WorkerError>;
}

// ── Execution ─────────────────────────────────────────────

/// Repository progress reported by evolution work.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RepoProgress {
    pub commit_created: bool,
    pub push_success: bool,
    pub code_tool_calls: u32,
    pub code_tool_errors: u32,
    pub head_before: Option<String>,
    pub head_after: Option<String>,
}

/// What an executor reports for one task attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub cost_usd: f64,
    pub total_rounds: u32,
    pub tool_calls: u32,
    pub tool_errors: u32,
    pub provider_name: Option<String>,
    pub provider_model: Option<String>,
    pub provider_error_class: Option<ErrorClass>,
    pub exhausted_providers: Vec<String>,
    pub repo: Option<RepoProgress>,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl ExecutionReport {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    fn into_task_done(self, task: &Task, worker_id: usize) -> TaskDone {
        let has_repo = self.repo.is_some();
        let repo = self.repo.unwrap_or_default();
        TaskDone {
            task_id: task.id.clone(),
            task_type: Some(task.kind.clone()),
            worker_id: Some(worker_id),
            cost_usd: self.cost_usd,
            total_rounds: self.total_rounds,
            provider_name: self.provider_name,
            provider_model: self.provider_model,
            provider_error_class: self.provider_error_class,
            exhausted_providers: self.exhausted_providers,
            local: task.kind == TaskKind::EvolutionOffline,
            error: self.error,
            evolution_commit_created: has_repo.then_some(repo.commit_created),
            evolution_repo_push_success: has_repo.then_some(repo.push_success),
            evolution_code_tool_calls: has_repo.then_some(repo.code_tool_calls),
            evolution_code_tool_errors: has_repo.then_some(repo.code_tool_errors),
            evolution_head_before: repo.head_before,
            evolution_head_after: repo.head_after,
        }
    }
}

/// Runs one task. Implementations report progress through the context.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, task: &Task, ctx: &WorkerContext) -> anyhow::Result<ExecutionReport>;
}

/// A worker's handle back to the control loop.
#[derive(Clone)]
pub struct WorkerContext {
    worker_id: usize,
    task_id: String,
    events: mpsc::Sender<Value>,
    cancel: watch::Receiver<bool>,
}

impl WorkerContext {
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Send a raw record. A closed channel means the supervisor is gone.
    pub async fn emit(&self, record: Value) {
        if self.events.send(record).await.is_err() {
            tracing::debug!("📪 Worker {}: event channel closed", self.worker_id);
        }
    }

    pub async fn heartbeat(&self, phase: &str) {
        self.emit(events::record(
            EventKind::TaskHeartbeat,
            &TaskHeartbeat {
                task_id: self.task_id.clone(),
                phase: Some(phase.to_string()),
            },
        ))
        .await;
    }

    pub async fn usage(&self, provider: &str, model: &str, usage: Usage) {
        self.emit(events::record(
            EventKind::LlmUsage,
            &LlmUsage {
                task_id: Some(self.task_id.clone()),
                provider: Some(provider.to_string()),
                model: Some(model.to_string()),
                category: Some("task".into()),
                usage,
            },
        ))
        .await;
    }

    pub async fn provider_failure(&self, failure: &ProviderFailure) {
        self.emit(events::record(
            EventKind::ProviderFailure,
            &ProviderFailureEvent::from(failure),
        ))
        .await;
    }

    pub async fn send_message(&self, chat_id: Option<i64>, text: &str) {
        self.emit(events::record(
            EventKind::SendMessage,
            &SendMessage {
                chat_id,
                text: text.to_string(),
            },
        ))
        .await;
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

// ── Tokio runtime ─────────────────────────────────────────

struct WorkerHandle {
    tasks: mpsc::Sender<Task>,
    cancel: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// In-process workers, one tokio task each.
pub struct TokioWorkerRuntime {
    executor: Arc<dyn Executor>,
    events: mpsc::Sender<Value>,
    workers: Mutex<Vec<Option<WorkerHandle>>>,
}

impl TokioWorkerRuntime {
    /// Spawn `size` workers. Must be called inside a tokio runtime.
    pub fn new(size: usize, executor: Arc<dyn Executor>, events: mpsc::Sender<Value>) -> Self {
        let runtime = Self {
            executor,
            events,
            workers: Mutex::new((0..size).map(|_| None).collect()),
        };
        for id in 0..size {
            let handle = runtime.spawn_worker(id);
            runtime.lock()[id] = Some(handle);
        }
        tracing::info!("👷 Started {size} worker(s)");
        runtime
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Option<WorkerHandle>>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn spawn_worker(&self, worker_id: usize) -> WorkerHandle {
        let (task_tx, task_rx) = mpsc::channel(1);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let join = tokio::spawn(worker_loop(
            worker_id,
            task_rx,
            cancel_rx,
            self.executor.clone(),
            self.events.clone(),
        ));
        WorkerHandle {
            tasks: task_tx,
            cancel: cancel_tx,
            join,
        }
    }
}

#[async_trait]
impl WorkerRuntime for TokioWorkerRuntime {
    fn size(&self) -> usize {
        self.lock().len()
    }

    fn is_alive(&self, worker_id: usize) -> bool {
        self.lock()
            .get(worker_id)
            .and_then(Option::as_ref)
            .is_some_and(|h| !h.join.is_finished())
    }

    async fn assign(&self, worker_id: usize, task: Task) -> Result<(), WorkerError> {
        let sender = {
            let workers = self.lock();
            let slot = workers.get(worker_id).ok_or(WorkerError::Unknown(worker_id))?;
            slot.as_ref()
                .ok_or(WorkerError::NotAlive(worker_id))?
                .tasks
                .clone()
        };
        sender.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => WorkerError::Busy(worker_id),
            mpsc::error::TrySendError::Closed(_) => WorkerError::NotAlive(worker_id),
        })
    }

    async fn terminate(&self, worker_id: usize, grace: Duration) {
        let handle = self.lock().get_mut(worker_id).and_then(Option::take);
        let Some(WorkerHandle {
            tasks,
            cancel,
            mut join,
        }) = handle
        else {
            return;
        };
        let _ = cancel.send(true);
        drop(tasks);
        if tokio::time::timeout(grace, &mut join).await.is_err() {
            tracing::warn!("🔪 Worker {worker_id} ignored stop request, aborting");
            join.abort();
        }
        tracing::info!("🛑 Worker {worker_id} terminated");
    }

    async fn respawn(&self, worker_id: usize) -> Result<(), WorkerError> {
        if worker_id >= self.size() {
            return Err(WorkerError::Unknown(worker_id));
        }
        let handle = self.spawn_worker(worker_id);
        let old = self.lock()[worker_id].replace(handle);
        if let Some(old) = old {
            old.join.abort();
        }
        tracing::info!("🔄 Worker {worker_id} respawned");
        Ok(())
    }
}

async fn worker_loop(
    worker_id: usize,
    mut tasks: mpsc::Receiver<Task>,
    mut cancel: watch::Receiver<bool>,
    executor: Arc<dyn Executor>,
    events: mpsc::Sender<Value>,
) {
    while let Some(task) = tasks.recv().await {
        let ctx = WorkerContext {
            worker_id,
            task_id: task.id.clone(),
            events: events.clone(),
            cancel: cancel.clone(),
        };
        ctx.heartbeat("started").await;
        tracing::debug!("▶️ Worker {worker_id} running {} ({})", task.id, task.kind);

        let started = Instant::now();
        let run = AssertUnwindSafe(executor.execute(&task, &ctx)).catch_unwind();
        let report = tokio::select! {
            result = run => match result {
                Ok(Ok(report)) => report,
                Ok(Err(e)) => {
                    tracing::warn!("⚠️ Worker {worker_id}: task {} failed: {e}", task.id);
                    ExecutionReport::failed(e.to_string())
                }
                Err(_) => {
                    tracing::error!("💥 Worker {worker_id}: executor panicked on {}", task.id);
                    ExecutionReport::failed("executor panicked")
                }
            },
            _ = cancel.wait_for(|stop| *stop) => {
                tracing::info!("🛑 Worker {worker_id}: task {} cancelled", task.id);
                return;
            }
        };

        let metrics = TaskMetrics {
            task_id: task.id.clone(),
            task_type: Some(task.kind.to_string()),
            duration_sec: started.elapsed().as_secs_f64(),
            tool_calls: report.tool_calls,
            tool_errors: report.tool_errors,
            provider_name: report.provider_name.clone(),
            provider_error_class: report.provider_error_class,
        };
        let done = report.into_task_done(&task, worker_id);
        ctx.emit(events::record(EventKind::TaskMetrics, &metrics)).await;
        ctx.emit(events::record(EventKind::TaskDone, &done)).await;
    }
    tracing::debug!("👋 Worker {worker_id} exiting");
}

// ── LLM executor ──────────────────────────────────────────

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a long-running autonomous agent. Complete the task you are given and report the result concisely.";

/// Answers each task with one chat completion, rotating providers on quota errors.
pub struct LlmExecutor {
    router: Arc<ProviderRouter>,
    client: OpenAiCompatibleClient,
    system_prompt: String,
}

impl LlmExecutor {
    pub fn new(router: Arc<ProviderRouter>, client: OpenAiCompatibleClient) -> Self {
        Self {
            router,
            client,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }
}

#[async_trait]
impl Executor for LlmExecutor {
    async fn execute(&self, task: &Task, ctx: &WorkerContext) -> anyhow::Result<ExecutionReport> {
        ctx.heartbeat("llm_call").await;
        let messages = vec![
            ChatMessage::system(self.system_prompt.clone()),
            ChatMessage::user(task.text.clone()),
        ];
        let client = &self.client;
        let msgs = messages.as_slice();
        let outcome = run_with_failover(&self.router, move |selection| async move {
            client.chat(&selection, msgs).await
        })
        .await;

        let mut failures = outcome.failures;
        let mut report = ExecutionReport::default();
        match outcome.result {
            Ok((completion, selection)) => {
                for failure in &failures {
                    ctx.provider_failure(failure).await;
                }
                ctx.usage(
                    &selection.name,
                    &selection.model,
                    Usage {
                        cost: completion.cost_usd,
                        prompt_tokens: completion.prompt_tokens,
                        completion_tokens: completion.completion_tokens,
                    },
                )
                .await;
                if task.chat_id.is_some() && !completion.content.trim().is_empty() {
                    ctx.send_message(task.chat_id, &completion.content).await;
                }
                report.cost_usd = completion.cost_usd;
                report.total_rounds = 1;
                report.provider_name = Some(selection.name);
                report.provider_model = Some(selection.model);
                report.output = Some(completion.content);
            }
            Err(FailoverError::Provider {
                provider,
                model,
                source,
            }) => {
                // The last failure is reported through task_done.
                failures.pop();
                for failure in &failures {
                    ctx.provider_failure(failure).await;
                }
                report.provider_name = Some(provider);
                report.provider_model = Some(model);
                report.provider_error_class = Some(source.class());
                report.error = Some(source.to_string());
            }
            Err(FailoverError::Exhausted(e)) => {
                for failure in &failures {
                    ctx.provider_failure(failure).await;
                }
                report.exhausted_providers = e.exhausted.clone();
                report.error = Some(e.to_string());
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_pool_bind_release() {
        let now = Utc::now();
        let mut pool = WorkerPool::new(2);
        pool.bind(0, "a", now).unwrap();
        assert!(matches!(pool.bind(0, "b", now), Err(WorkerError::Busy(0))));
        assert!(matches!(pool.bind(5, "b", now), Err(WorkerError::Unknown(5))));
        assert_eq!(pool.idle_ids(|_| true), vec![1]);
        assert_eq!(pool.idle_ids(|id| id != 1), Vec::<usize>::new());

        assert!(!pool.release(0, "other"));
        assert_eq!(pool.busy_task(0), Some("a"));
        assert!(pool.release(0, "a"));
        assert_eq!(pool.idle_ids(|_| true), vec![0, 1]);
    }

    /// Reports a fixed cost and counts calls.
    struct Scripted {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Executor for Scripted {
        async fn execute(&self, task: &Task, ctx: &WorkerContext) -> anyhow::Result<ExecutionReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ctx.heartbeat("thinking").await;
            match task.text.as_str() {
                "fail" => anyhow::bail!("boom"),
                "panic" => panic!("executor blew up"),
                "hang" => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(ExecutionReport::default())
                }
                _ => Ok(ExecutionReport {
                    cost_usd: 0.5,
                    total_rounds: 2,
                    repo: Some(RepoProgress {
                        commit_created: true,
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
            }
        }
    }

    async fn next_of(rx: &mut mpsc::Receiver<Value>, tag: &str) -> Value {
        loop {
            let rec = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("channel closed");
            if rec["type"] == tag {
                return rec;
            }
        }
    }

    fn runtime(size: usize) -> (TokioWorkerRuntime, mpsc::Receiver<Value>, Arc<Scripted>) {
        let (tx, rx) = mpsc::channel(64);
        let exec = Arc::new(Scripted {
            calls: AtomicUsize::new(0),
        });
        (TokioWorkerRuntime::new(size, exec.clone(), tx), rx, exec)
    }

    #[tokio::test]
    async fn test_runtime_emits_heartbeat_then_done() {
        let (rt, mut rx, exec) = runtime(1);
        assert!(rt.is_alive(0));
        rt.assign(0, Task::new(TaskKind::Evolution, "ok").with_id("t1"))
            .await
            .unwrap();

        let hb = next_of(&mut rx, "task_heartbeat").await;
        assert_eq!(hb["task_id"], "t1");
        let metrics = next_of(&mut rx, "task_metrics").await;
        assert_eq!(metrics["task_type"], "evolution");
        let done = next_of(&mut rx, "task_done").await;
        assert_eq!(done["worker_id"], 0);
        assert_eq!(done["total_rounds"], 2);
        assert_eq!(done["evolution_commit_created"], true);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_errors_and_panics_still_complete() {
        let (rt, mut rx, _) = runtime(1);
        rt.assign(0, Task::new(TaskKind::Interactive, "fail").with_id("f1"))
            .await
            .unwrap();
        let done = next_of(&mut rx, "task_done").await;
        assert_eq!(done["task_id"], "f1");
        assert_eq!(done["error"], "boom");

        rt.assign(0, Task::new(TaskKind::Interactive, "panic").with_id("p1"))
            .await
            .unwrap();
        let done = next_of(&mut rx, "task_done").await;
        assert_eq!(done["task_id"], "p1");
        assert_eq!(done["error"], "executor panicked");
        assert!(rt.is_alive(0));
    }

    #[tokio::test]
    async fn test_terminate_and_respawn() {
        let (rt, mut rx, _) = runtime(2);
        rt.assign(1, Task::new(TaskKind::Interactive, "hang").with_id("h1"))
            .await
            .unwrap();
        next_of(&mut rx, "task_heartbeat").await;

        rt.terminate(1, Duration::from_millis(200)).await;
        assert!(!rt.is_alive(1));
        assert!(matches!(
            rt.assign(1, Task::new(TaskKind::Interactive, "ok")).await,
            Err(WorkerError::NotAlive(1))
        ));

        rt.respawn(1).await.unwrap();
        assert!(rt.is_alive(1));
        rt.assign(1, Task::new(TaskKind::Interactive, "ok").with_id("o1"))
            .await
            .unwrap();
        let done = next_of(&mut rx, "task_done").await;
        assert_eq!(done["task_id"], "o1");
        assert!(matches!(rt.respawn(9).await, Err(WorkerError::Unknown(9))));
    }
}

//! Fakes shared by the supervisor and dispatcher tests.

use async_trait::async_trait;
use overseer_core::config::OverseerConfig;
use overseer_providers::{BackendKind, ProviderEndpoint, ProviderRouter, RouterMode};
use overseer_scheduler::{LogNotifier, Task};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::dedup::{DuplicateJudge, ExistingTask};
use crate::supervisor::Supervisor;
use crate::workers::{WorkerError, WorkerRuntime};

/// Records assignments; workers never run anything.
pub(crate) struct FakeRuntime {
    alive: Mutex<Vec<bool>>,
    assigned: Mutex<Vec<(usize, String)>>,
    terminated: Mutex<Vec<usize>>,
}

impl FakeRuntime {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            alive: Mutex::new(vec![true; size]),
            assigned: Mutex::new(Vec::new()),
            terminated: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn assigned(&self) -> Vec<(usize, String)> {
        self.assigned.lock().unwrap().clone()
    }

    pub(crate) fn terminated(&self) -> Vec<usize> {
        self.terminated.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerRuntime for FakeRuntime {
    fn size(&self) -> usize {
        self.alive.lock().unwrap().len()
    }

    fn is_alive(&self, worker_id: usize) -> bool {
        self.alive
            .lock()
            .unwrap()
            .get(worker_id)
            .copied()
            .unwrap_or(false)
    }

    async fn assign(&self, worker_id: usize, task: Task) -> Result<(), WorkerError> {
        if !self.is_alive(worker_id) {
            return Err(WorkerError::NotAlive(worker_id));
        }
        self.assigned.lock().unwrap().push((worker_id, task.id));
        Ok(())
    }

    async fn terminate(&self, worker_id: usize, _grace: Duration) {
        self.alive.lock().unwrap()[worker_id] = false;
        self.terminated.lock().unwrap().push(worker_id);
    }

    async fn respawn(&self, worker_id: usize) -> Result<(), WorkerError> {
        self.alive.lock().unwrap()[worker_id] = true;
        Ok(())
    }
}

#[derive(Clone)]
pub(crate) enum JudgeReply {
    Accept,
    Duplicate(String),
    Fail,
}

pub(crate) struct FixedJudge(pub JudgeReply);

#[async_trait]
impl DuplicateJudge for FixedJudge {
    async fn find_duplicate(&self, _: &str, _: &[ExistingTask]) -> anyhow::Result<Option<String>> {
        match &self.0 {
            JudgeReply::Accept => Ok(None),
            JudgeReply::Duplicate(id) => Ok(Some(id.clone())),
            JudgeReply::Fail => anyhow::bail!("judge offline"),
        }
    }
}

pub(crate) struct Harness {
    pub sup: Supervisor,
    pub notifier: Arc<LogNotifier>,
    pub runtime: Arc<FakeRuntime>,
    router: Arc<ProviderRouter>,
    judge: JudgeReply,
    dir: PathBuf,
}

impl Harness {
    /// A second supervisor over the same data dir and collaborators.
    pub(crate) fn rebuild(&self) -> Supervisor {
        build(&self.dir, &self.router, &self.runtime, &self.notifier, &self.judge)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn config() -> OverseerConfig {
    OverseerConfig {
        owner_chat_id: Some(1),
        workers: 2,
        ..Default::default()
    }
}

fn build(
    dir: &Path,
    router: &Arc<ProviderRouter>,
    runtime: &Arc<FakeRuntime>,
    notifier: &Arc<LogNotifier>,
    judge: &JudgeReply,
) -> Supervisor {
    Supervisor::new(
        config(),
        dir,
        router.clone(),
        runtime.clone(),
        notifier.clone(),
        Arc::new(FixedJudge(judge.clone())),
    )
}

pub(crate) fn harness(name: &str, judge: JudgeReply) -> Harness {
    let dir = std::env::temp_dir().join(format!(
        "overseer-supervisor-{name}-{}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);

    let endpoint = |name: &str, model: &str| ProviderEndpoint {
        name: name.into(),
        backend: BackendKind::OpenAi,
        base_url: format!("https://{name}.test/v1"),
        api_key: Some("k".into()),
        models: vec![model.into()],
    };
    let router = Arc::new(ProviderRouter::new(
        vec![endpoint("groq", "g1"), endpoint("openrouter", "o1")],
        RouterMode::AdaptiveRr,
        600,
    ));
    let runtime = Arc::new(FakeRuntime::new(2));
    let notifier = Arc::new(LogNotifier::new());
    let sup = build(&dir, &router, &runtime, &notifier, &judge);
    Harness {
        sup,
        notifier,
        runtime,
        router,
        judge,
        dir,
    }
}

//! Task definitions: the core data model for queued work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of work a task is. Drives the default priority.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskKind {
    /// Owner request.
    Interactive,
    /// Self-review.
    Review,
    /// Self-modification cycle.
    Evolution,
    /// Evolution cycle restricted to local, offline work.
    EvolutionOffline,
    Other(String),
}

impl TaskKind {
    /// Lower runs first.
    pub fn default_priority(&self) -> i32 {
        match self {
            TaskKind::Interactive | TaskKind::Review => 0,
            TaskKind::Evolution | TaskKind::EvolutionOffline => 1,
            TaskKind::Other(_) => 2,
        }
    }

    pub fn is_evolution(&self) -> bool {
        matches!(self, TaskKind::Evolution | TaskKind::EvolutionOffline)
    }

    pub fn as_str(&self) -> &str {
        match self {
            TaskKind::Interactive => "interactive",
            TaskKind::Review => "review",
            TaskKind::Evolution => "evolution",
            TaskKind::EvolutionOffline => "evolution_offline",
            TaskKind::Other(name) => name,
        }
    }
}

impl From<String> for TaskKind {
    fn from(s: String) -> Self {
        match s.trim() {
            "interactive" | "task" => TaskKind::Interactive,
            "review" => TaskKind::Review,
            "evolution" => TaskKind::Evolution,
            "evolution_offline" | "evolution_local" => TaskKind::EvolutionOffline,
            _ => TaskKind::Other(s),
        }
    }
}

impl From<TaskKind> for String {
    fn from(kind: TaskKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Link from a timeout retry back to the task it replaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryOf {
    pub original_id: String,
    pub retried_at: DateTime<Utc>,
}

fn first_attempt() -> u32 {
    1
}

/// A unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique across pending and running. A retry gets a fresh id.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    /// `None` until enqueued; then the kind default unless overridden.
    #[serde(default)]
    pub priority: Option<i32>,
    /// Assigned at enqueue; negative for front insertions.
    #[serde(default)]
    pub sequence: i64,
    #[serde(default = "first_attempt")]
    pub attempt: u32,
    /// Free-form payload handed to the executor.
    #[serde(default)]
    pub text: String,
    /// Sub-task nesting level.
    #[serde(default)]
    pub depth: u32,
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Chat that receives notices about this task.
    #[serde(default)]
    pub chat_id: Option<i64>,
    #[serde(default)]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_of: Option<RetryOf>,
    #[serde(default)]
    pub review_reason: Option<String>,
}

impl Task {
    /// Create a task with a fresh id.
    pub fn new(kind: TaskKind, text: impl Into<String>) -> Self {
        Self {
            id: new_task_id(),
            kind,
            priority: None,
            sequence: 0,
            attempt: 1,
            text: text.into(),
            depth: 0,
            parent_id: None,
            chat_id: None,
            queued_at: None,
            retry_of: None,
            review_reason: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_chat(mut self, chat_id: Option<i64>) -> Self {
        self.chat_id = chat_id;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Mark as a sub-task of `parent` at `depth`.
    pub fn with_parent(mut self, parent_id: impl Into<String>, depth: u32) -> Self {
        self.parent_id = Some(parent_id.into());
        self.depth = depth;
        self
    }

    pub fn effective_priority(&self) -> i32 {
        self.priority.unwrap_or_else(|| self.kind.default_priority())
    }

    /// Copy for a timeout retry: new id, next attempt, linked to this task.
    pub fn retry(&self, now: DateTime<Utc>) -> Self {
        Self {
            id: new_task_id(),
            attempt: self.attempt + 1,
            sequence: 0,
            queued_at: None,
            retry_of: Some(RetryOf {
                original_id: self.id.clone(),
                retried_at: now,
            }),
            ..self.clone()
        }
    }
}

/// Book-keeping for a task bound to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningEntry {
    pub task: Task,
    pub worker_id: usize,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    #[serde(default)]
    pub heartbeat_phase: Option<String>,
    #[serde(default)]
    pub soft_notice_sent: bool,
}

impl RunningEntry {
    pub fn new(task: Task, worker_id: usize, now: DateTime<Utc>) -> Self {
        Self {
            task,
            worker_id,
            started_at: now,
            last_heartbeat_at: now,
            heartbeat_phase: None,
            soft_notice_sent: false,
        }
    }
}

/// Short random id: first 8 hex chars of a v4 uuid.
pub fn new_task_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

//! Worker → supervisor event records.
//!
//! Every record on the inbound channel is a JSON object with a `type` tag.
//! The tag set is closed ([`EventKind`]); the payload of each kind is a
//! plain serde struct parsed by its handler.

use chrono::{DateTime, Utc};
use overseer_providers::{ErrorClass, ProviderFailure};
use overseer_scheduler::TaskKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::budget::Usage;

/// Known inbound record tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    LlmUsage,
    TaskHeartbeat,
    TaskDone,
    TaskMetrics,
    ProviderFailure,
    ScheduleTask,
    CancelTask,
    ReviewRequest,
    ToggleEvolution,
    RestartRequest,
    SendMessage,
}

impl EventKind {
    pub const ALL: [EventKind; 11] = [
        EventKind::LlmUsage,
        EventKind::TaskHeartbeat,
        EventKind::TaskDone,
        EventKind::TaskMetrics,
        EventKind::ProviderFailure,
        EventKind::ScheduleTask,
        EventKind::CancelTask,
        EventKind::ReviewRequest,
        EventKind::ToggleEvolution,
        EventKind::RestartRequest,
        EventKind::SendMessage,
    ];

    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == tag)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::LlmUsage => "llm_usage",
            EventKind::TaskHeartbeat => "task_heartbeat",
            EventKind::TaskDone => "task_done",
            EventKind::TaskMetrics => "task_metrics",
            EventKind::ProviderFailure => "provider_failure",
            EventKind::ScheduleTask => "schedule_task",
            EventKind::CancelTask => "cancel_task",
            EventKind::ReviewRequest => "review_request",
            EventKind::ToggleEvolution => "toggle_evolution",
            EventKind::RestartRequest => "restart_request",
            EventKind::SendMessage => "send_message",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build a wire record: the payload's fields plus `type`.
pub fn record<T: Serialize>(kind: EventKind, payload: &T) -> Value {
    let mut obj = match serde_json::to_value(payload) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    obj.insert("type".into(), Value::String(kind.as_str().to_string()));
    Value::Object(obj)
}

/// Spend for one backend call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmUsage {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub usage: Usage,
}

/// Liveness ping from a running task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHeartbeat {
    pub task_id: String,
    #[serde(default)]
    pub phase: Option<String>,
}

/// Completion of one task attempt. Sent exactly once per assignment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskDone {
    pub task_id: String,
    #[serde(default)]
    pub task_type: Option<TaskKind>,
    #[serde(default)]
    pub worker_id: Option<usize>,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub total_rounds: u32,
    /// Provider that served (or last failed) the final call.
    #[serde(default)]
    pub provider_name: Option<String>,
    #[serde(default)]
    pub provider_model: Option<String>,
    /// Set when the final call failed with a non-rotating error.
    #[serde(default)]
    pub provider_error_class: Option<ErrorClass>,
    #[serde(default)]
    pub exhausted_providers: Vec<String>,
    #[serde(default)]
    pub local: bool,
    #[serde(default)]
    pub error: Option<String>,
    // Repository progress markers, present only for evolution work.
    #[serde(default)]
    pub evolution_commit_created: Option<bool>,
    #[serde(default)]
    pub evolution_repo_push_success: Option<bool>,
    #[serde(default)]
    pub evolution_code_tool_calls: Option<u32>,
    #[serde(default)]
    pub evolution_code_tool_errors: Option<u32>,
    #[serde(default)]
    pub evolution_head_before: Option<String>,
    #[serde(default)]
    pub evolution_head_after: Option<String>,
}

impl TaskDone {
    pub fn has_progress_markers(&self) -> bool {
        self.evolution_commit_created.is_some()
            || self.evolution_repo_push_success.is_some()
            || self.evolution_code_tool_calls.is_some()
            || self.evolution_code_tool_errors.is_some()
    }
}

/// Per-task execution metrics, journaled as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub task_id: String,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub duration_sec: f64,
    #[serde(default)]
    pub tool_calls: u32,
    #[serde(default)]
    pub tool_errors: u32,
    #[serde(default)]
    pub provider_name: Option<String>,
    #[serde(default)]
    pub provider_error_class: Option<ErrorClass>,
}

/// One failed backend call that the worker rotated past.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderFailureEvent {
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    pub error_class: ErrorClass,
    #[serde(default)]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: Option<String>,
}

impl From<&ProviderFailure> for ProviderFailureEvent {
    fn from(f: &ProviderFailure) -> Self {
        Self {
            provider: f.provider.clone(),
            model: Some(f.model.clone()),
            error_class: f.error_class,
            cooldown_until: f.cooldown_until,
            message: Some(f.message.clone()),
        }
    }
}

/// Sub-task requested by a running task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleTask {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub depth: u32,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub parent_task_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CancelTask {
    #[serde(default)]
    pub task_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToggleEvolution {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestartRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Free text for the chat transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessage {
    #[serde(default)]
    pub chat_id: Option<i64>,
    pub text: String,
}

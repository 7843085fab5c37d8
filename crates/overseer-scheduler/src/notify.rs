//! Owner notifications.
//!
//! The scheduler only picks a template key and parameters; rendering and
//! delivery belong to the [`Notifier`]. Two implementations ship here: a
//! tracing-backed one with an in-memory history, and a JSON webhook.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

/// Template key plus parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub key: String,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
}

impl Notice {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            params: BTreeMap::new(),
        }
    }

    /// Add a parameter.
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    fn p(&self, name: &str) -> String {
        match self.params.get(name) {
            Some(Value::String(s)) => s.clone(),
            Some(v) => v.to_string(),
            None => "-".to_string(),
        }
    }

    /// Plain English rendering for transports without their own templates.
    pub fn render(&self) -> String {
        let p = |n: &str| self.p(n);
        match self.key.as_str() {
            "task_soft_timeout" => format!(
                "⏳ Task {} ({}) running for {}s, last heartbeat {}s ago.",
                p("task_id"),
                p("task_type"),
                p("runtime"),
                p("heartbeat_lag")
            ),
            "task_hard_timeout_requeued" => format!(
                "⏱️ Task {} killed after {}s on worker {}; retrying (attempt {}).",
                p("task_id"),
                p("runtime"),
                p("worker_id"),
                p("attempt")
            ),
            "task_hard_timeout_stopped" => format!(
                "⏱️ Task {} killed after {}s on worker {}; no retries left.",
                p("task_id"),
                p("runtime"),
                p("worker_id")
            ),
            "review_queued" => format!("🔍 Review queued: {} ({})", p("task_id"), p("reason")),
            "evolution_paused_failures" => format!(
                "⏸️ Evolution paused after {} consecutive failed cycles.",
                p("failures")
            ),
            "evolution_stopped_budget" => format!(
                "💸 Evolution stopped: ${} remaining, reserve is ${}.",
                p("remaining"),
                p("reserve")
            ),
            "evolution_started" => {
                format!("🧬 Evolution cycle #{} started ({}).", p("cycle"), p("task_id"))
            }
            "evolution_offline_started" => format!(
                "🧬 Offline evolution cycle #{} started ({}).",
                p("cycle"),
                p("task_id")
            ),
            "evolution_sleeping_until" => format!(
                "😴 All providers cooling down ({}). Next evolution at {} (in {}s).",
                p("providers"),
                p("wake_at"),
                p("wait_sec")
            ),
            "task_rejected_depth" => format!(
                "🚫 Sub-task rejected: depth {} exceeds {}.",
                p("depth"),
                p("max_depth")
            ),
            "task_rejected_duplicate" => format!(
                "🚫 Sub-task rejected: duplicates {}.",
                p("duplicate_of")
            ),
            "scheduled_task" => format!("📥 Scheduled {}: {}", p("task_id"), p("description")),
            "cancel_result" => format!("🛑 Cancel {}: {}", p("task_id"), p("result")),
            "evolution_via_tool" => format!("🧬 Evolution mode set to {}.", p("enabled")),
            "restart_requested_by_agent" => format!("🔁 Restart requested: {}", p("reason")),
            "evolution_report" => format!(
                "🧬 Evolution #{} {}: cost ${}, rounds {}, failures in a row {}.",
                p("cycle"),
                p("status"),
                p("cost"),
                p("rounds"),
                p("consecutive_failures")
            ),
            "restored_pending_tasks" => {
                format!("♻️ Restored {} pending task(s) from snapshot.", p("count"))
            }
            _ => {
                let params: Vec<String> =
                    self.params.keys().map(|k| format!("{k}={}", self.p(k))).collect();
                format!("[{}] {}", self.key, params.join(" "))
            }
        }
    }
}

/// Chat-transport collaborator.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a templated notice.
    async fn notify(&self, chat_id: i64, notice: &Notice) -> anyhow::Result<()>;

    /// Forward free text.
    async fn send_text(&self, chat_id: i64, text: &str) -> anyhow::Result<()>;
}

/// One delivered message, as kept in [`LogNotifier`] history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Delivered {
    pub chat_id: i64,
    /// Template key, `None` for free text.
    pub key: Option<String>,
    pub text: String,
    pub at: DateTime<Utc>,
}

const HISTORY_LIMIT: usize = 100;

/// Logs every notice and keeps the last 100.
#[derive(Default)]
pub struct LogNotifier {
    history: Mutex<VecDeque<Delivered>>,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, entry: Delivered) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(entry);
        if history.len() > HISTORY_LIMIT {
            history.pop_front();
        }
    }

    pub fn history(&self) -> Vec<Delivered> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Template keys delivered so far, oldest first.
    pub fn keys(&self) -> Vec<String> {
        self.history().into_iter().filter_map(|d| d.key).collect()
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, chat_id: i64, notice: &Notice) -> anyhow::Result<()> {
        let text = notice.render();
        tracing::info!("📢 [{chat_id}] {text}");
        self.record(Delivered {
            chat_id,
            key: Some(notice.key.clone()),
            text,
            at: Utc::now(),
        });
        Ok(())
    }

    async fn send_text(&self, chat_id: i64, text: &str) -> anyhow::Result<()> {
        tracing::info!("💬 [{chat_id}] {text}");
        self.record(Delivered {
            chat_id,
            key: None,
            text: text.to_string(),
            at: Utc::now(),
        });
        Ok(())
    }
}

/// POSTs each notice as JSON.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn post(&self, body: Value) -> anyhow::Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Webhook send failed: {e}"))?;

        if resp.status().is_success() {
            tracing::debug!("✅ Webhook notification sent");
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Webhook error {status}: {body}")
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, chat_id: i64, notice: &Notice) -> anyhow::Result<()> {
        self.post(serde_json::json!({
            "chat_id": chat_id,
            "key": notice.key,
            "params": notice.params,
            "text": notice.render(),
            "ts": Utc::now(),
        }))
        .await
    }

    async fn send_text(&self, chat_id: i64, text: &str) -> anyhow::Result<()> {
        self.post(serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "ts": Utc::now(),
        }))
        .await
    }
}

//! Semantic duplicate detection for requested sub-tasks.
//!
//! Callers treat every error as "not a duplicate" (fail-open).

use async_trait::async_trait;
use chrono::Utc;
use overseer_providers::{ChatMessage, OpenAiCompatibleClient, ProviderRouter, run_with_failover};
use overseer_scheduler::TaskQueue;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

const MAX_EXISTING: usize = 10;
const EXISTING_TEXT_CHARS: usize = 200;
const DESCRIPTION_CHARS: usize = 300;

/// A queued or running task, trimmed for comparison.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExistingTask {
    pub id: String,
    pub text: String,
}

impl ExistingTask {
    /// Pending tasks in queue order, then running ones. Blank texts are skipped.
    pub fn collect(queue: &TaskQueue) -> Vec<Self> {
        let pending = queue.pending().iter();
        let running = queue.running().values().map(|e| &e.task);
        pending
            .chain(running)
            .filter(|t| !t.text.trim().is_empty())
            .map(|t| Self {
                id: t.id.clone(),
                text: truncate_chars(&t.text, EXISTING_TEXT_CHARS),
            })
            .collect()
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[async_trait]
pub trait DuplicateJudge: Send + Sync {
    /// Id of an existing task that `description` duplicates, if any.
    async fn find_duplicate(
        &self,
        description: &str,
        existing: &[ExistingTask],
    ) -> anyhow::Result<Option<String>>;
}

/// Accepts everything.
pub struct NoDuplicateJudge;

#[async_trait]
impl DuplicateJudge for NoDuplicateJudge {
    async fn find_duplicate(&self, _: &str, _: &[ExistingTask]) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

/// Asks a model through the provider router.
pub struct LlmDuplicateJudge {
    router: Arc<ProviderRouter>,
    client: OpenAiCompatibleClient,
}

impl LlmDuplicateJudge {
    pub fn new(router: Arc<ProviderRouter>) -> Self {
        Self {
            router,
            client: OpenAiCompatibleClient::new(Duration::from_secs(20), 50),
        }
    }
}

pub fn build_prompt(description: &str, existing: &[ExistingTask]) -> String {
    let lines: Vec<String> = existing
        .iter()
        .take(MAX_EXISTING)
        .map(|e| format!("- [{}] {}", e.id, e.text))
        .collect();
    format!(
        "Does the new task below repeat the intent of one of the existing tasks?\n\
         New: {}\n\n\
         Existing tasks:\n{}\n\n\
         Reply ONLY with the task ID if duplicate, or NONE if not.",
        truncate_chars(description, DESCRIPTION_CHARS),
        lines.join("\n")
    )
}

/// Map a model answer back to a known id. Anything unrecognised is "no".
pub fn match_answer(answer: &str, existing: &[ExistingTask]) -> Option<String> {
    let answer = answer.trim();
    if answer.is_empty() || answer.eq_ignore_ascii_case("none") {
        return None;
    }
    let lower = answer.to_lowercase();
    existing
        .iter()
        .find(|e| lower.contains(&e.id.to_lowercase()))
        .map(|e| e.id.clone())
}

#[async_trait]
impl DuplicateJudge for LlmDuplicateJudge {
    async fn find_duplicate(
        &self,
        description: &str,
        existing: &[ExistingTask],
    ) -> anyhow::Result<Option<String>> {
        if existing.is_empty() {
            return Ok(None);
        }
        let messages = vec![ChatMessage::user(build_prompt(description, existing))];
        let client = &self.client;
        let msgs = messages.as_slice();
        let outcome = run_with_failover(&self.router, move |selection| async move {
            client.chat(&selection, msgs).await
        })
        .await;

        let now = Utc::now();
        for failure in &outcome.failures {
            self.router.mark_failure_at(
                &failure.provider,
                failure.error_class,
                Some(&failure.model),
                failure.cooldown_until,
                now,
            );
        }
        let (completion, selection) = outcome.result?;
        self.router
            .mark_success_at(&selection.name, Some(&selection.model), now);
        Ok(match_answer(&completion.content, existing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_scheduler::{Task, TaskKind};

    fn existing() -> Vec<ExistingTask> {
        vec![
            ExistingTask {
                id: "ab12cd34".into(),
                text: "refactor queue".into(),
            },
            ExistingTask {
                id: "ef56ab78".into(),
                text: "write docs".into(),
            },
        ]
    }

    #[test]
    fn test_match_answer() {
        let ex = existing();
        assert_eq!(match_answer("NONE", &ex), None);
        assert_eq!(match_answer("  none\n", &ex), None);
        assert_eq!(match_answer("", &ex), None);
        assert_eq!(match_answer("EF56AB78", &ex), Some("ef56ab78".into()));
        assert_eq!(match_answer("Duplicate of [ab12cd34].", &ex), Some("ab12cd34".into()));
        assert_eq!(match_answer("zz99zz99", &ex), None);
    }

    #[test]
    fn test_collect_and_prompt() {
        let mut q = TaskQueue::new(3);
        q.enqueue(Task::new(TaskKind::Interactive, "a".repeat(500)).with_id("p1"), false)
            .unwrap();
        q.enqueue(Task::new(TaskKind::Interactive, "   ").with_id("blank"), false)
            .unwrap();
        q.enqueue(Task::new(TaskKind::Review, "review it").with_id("r1"), false)
            .unwrap();
        let head = q.pop_next().unwrap();
        q.start(head, 0, Utc::now());

        let ex = ExistingTask::collect(&q);
        let ids: Vec<&str> = ex.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "p1"]);
        assert_eq!(ex[1].text.chars().count(), EXISTING_TEXT_CHARS);

        let prompt = build_prompt("new work", &ex);
        assert!(prompt.contains("- [r1] review it"));
        assert!(prompt.ends_with("or NONE if not."));
    }

    #[tokio::test]
    async fn test_no_judge_accepts() {
        assert_eq!(
            NoDuplicateJudge.find_duplicate("x", &existing()).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_llm_judge_without_credentials_fails() {
        let router = Arc::new(ProviderRouter::new(
            Vec::new(),
            overseer_providers::RouterMode::AdaptiveRr,
            600,
        ));
        let judge = LlmDuplicateJudge::new(router);
        assert!(judge.find_duplicate("x", &existing()).await.is_err());
        assert_eq!(judge.find_duplicate("x", &[]).await.unwrap(), None);
    }
}

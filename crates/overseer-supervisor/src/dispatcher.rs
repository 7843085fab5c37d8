//! Worker event dispatch.
//!
//! Every inbound record is a JSON object tagged by `type`. The tag selects
//! one handler from a static table; a handler that errors or panics is
//! journaled and the loop carries on.

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::panic::AssertUnwindSafe;

use crate::events::{
    CancelTask, EventKind, LlmUsage, ProviderFailureEvent, RestartRequest, ReviewRequest,
    ScheduleTask, SendMessage, TaskDone, TaskHeartbeat, TaskMetrics, ToggleEvolution,
};
use crate::supervisor::Supervisor;

pub type Handler = for<'a> fn(&'a mut Supervisor, Value) -> BoxFuture<'a, anyhow::Result<()>>;

const HANDLERS: &[(EventKind, Handler)] = &[
    (EventKind::LlmUsage, on_llm_usage as Handler),
    (EventKind::TaskHeartbeat, on_task_heartbeat as Handler),
    (EventKind::TaskDone, on_task_done as Handler),
    (EventKind::TaskMetrics, on_task_metrics as Handler),
    (EventKind::ProviderFailure, on_provider_failure as Handler),
    (EventKind::ScheduleTask, on_schedule_task as Handler),
    (EventKind::CancelTask, on_cancel_task as Handler),
    (EventKind::ReviewRequest, on_review_request as Handler),
    (EventKind::ToggleEvolution, on_toggle_evolution as Handler),
    (EventKind::RestartRequest, on_restart_request as Handler),
    (EventKind::SendMessage, on_send_message as Handler),
];

fn handler_for(kind: EventKind) -> Option<Handler> {
    HANDLERS
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, handler)| *handler)
}

fn parse<T: DeserializeOwned>(record: Value) -> anyhow::Result<T> {
    Ok(serde_json::from_value(record)?)
}

/// Route one worker record to its handler.
pub async fn dispatch(sup: &mut Supervisor, record: Value) {
    let Some(obj) = record.as_object() else {
        sup.journal.record(
            "invalid_worker_event",
            &json!({"reason": "not_an_object", "event_repr": truncate(&record.to_string())}),
        );
        return;
    };
    let Some(tag) = obj.get("type").and_then(Value::as_str).map(str::to_string) else {
        sup.journal.record(
            "invalid_worker_event",
            &json!({"reason": "missing_type", "event_repr": truncate(&record.to_string())}),
        );
        return;
    };
    let Some(handler) = EventKind::parse(&tag).and_then(handler_for) else {
        tracing::warn!("❓ Unknown worker event type: {tag}");
        sup.journal.record("unknown_worker_event", &json!({"event_type": tag}));
        return;
    };

    let outcome = AssertUnwindSafe(handler(sup, record)).catch_unwind().await;
    let error = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(_) => "handler panicked".to_string(),
    };
    tracing::error!("❌ Handler for {tag} failed: {error}");
    sup.journal.record(
        "worker_event_handler_error",
        &json!({"event_type": tag, "error": error}),
    );
}

fn truncate(s: &str) -> String {
    s.chars().take(500).collect()
}

fn on_llm_usage(sup: &mut Supervisor, record: Value) -> BoxFuture<'_, anyhow::Result<()>> {
    Box::pin(async move {
        sup.apply_usage(parse::<LlmUsage>(record)?);
        Ok(())
    })
}

fn on_task_heartbeat(sup: &mut Supervisor, record: Value) -> BoxFuture<'_, anyhow::Result<()>> {
    Box::pin(async move {
        sup.heartbeat(parse::<TaskHeartbeat>(record)?);
        Ok(())
    })
}

fn on_task_done(sup: &mut Supervisor, record: Value) -> BoxFuture<'_, anyhow::Result<()>> {
    Box::pin(async move {
        sup.handle_task_done(parse::<TaskDone>(record)?).await;
        Ok(())
    })
}

fn on_task_metrics(sup: &mut Supervisor, record: Value) -> BoxFuture<'_, anyhow::Result<()>> {
    Box::pin(async move {
        let metrics = parse::<TaskMetrics>(record)?;
        sup.journal.record("task_metrics_event", &metrics);
        Ok(())
    })
}

fn on_provider_failure(sup: &mut Supervisor, record: Value) -> BoxFuture<'_, anyhow::Result<()>> {
    Box::pin(async move {
        sup.apply_provider_failure(parse::<ProviderFailureEvent>(record)?);
        Ok(())
    })
}

fn on_schedule_task(sup: &mut Supervisor, record: Value) -> BoxFuture<'_, anyhow::Result<()>> {
    Box::pin(async move {
        sup.schedule_subtask(parse::<ScheduleTask>(record)?).await;
        Ok(())
    })
}

fn on_cancel_task(sup: &mut Supervisor, record: Value) -> BoxFuture<'_, anyhow::Result<()>> {
    Box::pin(async move {
        sup.cancel_from_event(parse::<CancelTask>(record)?).await;
        Ok(())
    })
}

fn on_review_request(sup: &mut Supervisor, record: Value) -> BoxFuture<'_, anyhow::Result<()>> {
    Box::pin(async move {
        let req = parse::<ReviewRequest>(record)?;
        let reason = req
            .reason
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| "agent_review_request".to_string());
        sup.queue_review(&reason, false).await;
        Ok(())
    })
}

fn on_toggle_evolution(sup: &mut Supervisor, record: Value) -> BoxFuture<'_, anyhow::Result<()>> {
    Box::pin(async move {
        let toggle = parse::<ToggleEvolution>(record)?;
        sup.set_evolution(toggle.enabled, true).await;
        Ok(())
    })
}

fn on_restart_request(sup: &mut Supervisor, record: Value) -> BoxFuture<'_, anyhow::Result<()>> {
    Box::pin(async move {
        let req = parse::<RestartRequest>(record)?;
        sup.request_restart(req.reason).await;
        Ok(())
    })
}

fn on_send_message(sup: &mut Supervisor, record: Value) -> BoxFuture<'_, anyhow::Result<()>> {
    Box::pin(async move {
        sup.forward_message(parse::<SendMessage>(record)?).await;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{JudgeReply, harness};
    use overseer_scheduler::{Task, TaskKind};

    #[test]
    fn test_every_kind_has_a_handler() {
        for kind in EventKind::ALL {
            assert!(handler_for(kind).is_some(), "no handler for {kind}");
        }
    }

    #[tokio::test]
    async fn test_malformed_records_are_journaled() {
        let mut h = harness("dispatch-bad", JudgeReply::Accept);
        dispatch(&mut h.sup, json!([1, 2])).await;
        dispatch(&mut h.sup, json!({"task_id": "x"})).await;
        dispatch(&mut h.sup, json!({"type": "teleport"})).await;
        // Missing required field: handler error, not a crash.
        dispatch(&mut h.sup, json!({"type": "toggle_evolution"})).await;

        let journal = h.sup.journal.read_all();
        let kinds: Vec<&str> = journal.iter().filter_map(|r| r["type"].as_str()).collect();
        assert_eq!(
            kinds,
            vec![
                "invalid_worker_event",
                "invalid_worker_event",
                "unknown_worker_event",
                "worker_event_handler_error"
            ]
        );
        assert_eq!(journal[0]["reason"], "not_an_object");
        assert_eq!(journal[1]["reason"], "missing_type");
        assert_eq!(journal[3]["event_type"], "toggle_evolution");
    }

    #[tokio::test]
    async fn test_usage_heartbeat_and_failure_records() {
        let mut h = harness("dispatch-usage", JudgeReply::Accept);
        h.sup
            .queue
            .enqueue(Task::new(TaskKind::Interactive, "x").with_id("t1"), false)
            .unwrap();
        let task = h.sup.queue.pop_next().unwrap();
        h.sup.queue.start(task, 0, chrono::Utc::now());

        dispatch(
            &mut h.sup,
            json!({"type": "llm_usage", "task_id": "t1", "provider": "groq", "model": "g1",
                   "usage": {"cost": 0.25, "prompt_tokens": 100, "completion_tokens": 20}}),
        )
        .await;
        dispatch(
            &mut h.sup,
            json!({"type": "task_heartbeat", "task_id": "t1", "phase": "thinking"}),
        )
        .await;
        dispatch(
            &mut h.sup,
            json!({"type": "provider_failure", "provider": "groq", "model": "g1",
                   "error_class": "quota_or_rate_limit",
                   "cooldown_until": "2099-01-01T00:00:00Z"}),
        )
        .await;

        assert!((h.sup.budget.spent_usd - 0.25).abs() < 1e-9);
        assert_eq!(h.sup.budget.prompt_tokens, 100);
        assert_eq!(
            h.sup.queue.running()["t1"].heartbeat_phase.as_deref(),
            Some("thinking")
        );
        assert!(h.sup.router.cooldown_until("groq", chrono::Utc::now()).is_some());
        let journal = h.sup.journal.read_all();
        assert_eq!(journal[0]["type"], "llm_usage");
        assert_eq!(journal.len(), 2);
    }

    #[tokio::test]
    async fn test_agent_requests() {
        let mut h = harness("dispatch-agent", JudgeReply::Accept);
        dispatch(&mut h.sup, json!({"type": "review_request"})).await;
        dispatch(&mut h.sup, json!({"type": "toggle_evolution", "enabled": true})).await;
        dispatch(&mut h.sup, json!({"type": "send_message", "text": "hi there"})).await;
        dispatch(&mut h.sup, json!({"type": "cancel_task", "task_id": "missing"})).await;

        let review = &h.sup.queue.pending()[0];
        assert_eq!(review.kind, TaskKind::Review);
        assert_eq!(review.review_reason.as_deref(), Some("agent_review_request"));
        assert!(h.sup.evolution.enabled);
        assert!(h.sup.restart.is_none());

        let history = h.notifier.history();
        assert!(history.iter().any(|d| d.key.is_none() && d.text == "hi there"));
        let keys = h.notifier.keys();
        assert_eq!(keys, vec!["review_queued", "evolution_via_tool", "cancel_result"]);

        dispatch(&mut h.sup, json!({"type": "restart_request", "reason": "new build"})).await;
        assert_eq!(h.sup.restart.as_deref(), Some("new build"));
    }
}

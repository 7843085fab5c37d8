//! Evolution admission control.
//!
//! Runs once per control-loop iteration. Only an idle queue with evolution
//! enabled is considered; the gates are, in order: provider lazy-sleep,
//! failure circuit breaker, budget reserve. [`admit`] decides and updates
//! [`EvolutionState`]; enqueueing and notifying stay with the caller.

use chrono::{DateTime, Utc};
use overseer_core::config::EvolutionConfig;
use overseer_providers::{ProviderRouter, SleepPlan};
use overseer_scheduler::{Task, TaskKind, TaskQueue};

use crate::evolution::{EvolutionState, evolution_task_text};

/// What the control loop should do about evolution this iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Queue busy, mode off, or no owner to report to.
    Skip,
    /// Every credentialed provider is cooling down.
    Sleep { plan: SleepPlan, notify: bool },
    /// Circuit breaker tripped; mode was switched off.
    PauseFailures { failures: u32 },
    /// Budget below reserve; mode was switched off.
    StopBudget { remaining: f64, reserve: f64 },
    /// Enqueue this task as cycle `cycle`.
    Inject { task: Task, cycle: u64 },
}

pub fn admit(
    queue: &TaskQueue,
    state: &mut EvolutionState,
    cfg: &EvolutionConfig,
    router: &ProviderRouter,
    remaining_budget: f64,
    owner_chat_id: Option<i64>,
    now: DateTime<Utc>,
) -> Admission {
    if !queue.is_idle() || !state.enabled {
        return Admission::Skip;
    }
    let Some(owner) = owner_chat_id else {
        return Admission::Skip;
    };

    let plan = if cfg.lazy_sleep {
        router.sleep_plan(now, cfg.lazy_buffer_secs)
    } else {
        None
    };
    if let Some(plan) = plan {
        let wake_changed = state.sleep_until != Some(plan.wake_at);
        let interval = chrono::Duration::seconds(cfg.lazy_notice_interval_secs as i64);
        let notice_due = state
            .last_sleep_notice_at
            .is_none_or(|at| now - at >= interval);
        let notify = wake_changed || notice_due;

        state.sleep_until = Some(plan.wake_at);
        if notify {
            state.last_sleep_notice_at = Some(now);
        }
        tracing::debug!("😴 Evolution sleeping until {} ({}s)", plan.wake_at, plan.wait_secs);
        return Admission::Sleep { plan, notify };
    }
    if state.sleep_until.is_some() {
        tracing::info!("⏰ Providers available again, evolution resumes");
        state.clear_sleep();
    }

    let limit = cfg.failure_limit.max(1);
    if state.consecutive_failures >= limit {
        state.enabled = false;
        tracing::warn!(
            "⏸️ Evolution paused after {} consecutive failures",
            state.consecutive_failures
        );
        return Admission::PauseFailures {
            failures: state.consecutive_failures,
        };
    }

    if remaining_budget < cfg.budget_reserve_usd {
        state.enabled = false;
        tracing::warn!(
            "💸 Evolution stopped: ${remaining_budget:.2} left, reserve ${:.2}",
            cfg.budget_reserve_usd
        );
        return Admission::StopBudget {
            remaining: remaining_budget,
            reserve: cfg.budget_reserve_usd,
        };
    }

    state.cycle += 1;
    state.last_task_at = Some(now);
    let kind = if cfg.offline {
        TaskKind::EvolutionOffline
    } else {
        TaskKind::Evolution
    };
    let task = Task::new(kind, evolution_task_text(state.cycle)).with_chat(Some(owner));
    tracing::info!("🧬 Evolution cycle #{} admitted ({})", state.cycle, task.id);
    Admission::Inject {
        task,
        cycle: state.cycle,
    }
}

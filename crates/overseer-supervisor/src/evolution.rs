//! Evolution bookkeeping: cycle counter, circuit breaker and lazy-sleep state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::events::TaskDone;

/// Cost above which a marker-less cycle counts as having done real work.
const LEGACY_MIN_COST_USD: f64 = 0.10;

/// How many completed cycle ids are remembered for duplicate detection.
const TRACKED_IDS: usize = 32;

/// Mutable evolution-mode state. Owned by the control loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionState {
    pub enabled: bool,
    pub cycle: u64,
    pub consecutive_failures: u32,
    /// Wake-up time while every provider is cooling down.
    pub sleep_until: Option<DateTime<Utc>>,
    pub last_sleep_notice_at: Option<DateTime<Utc>>,
    pub last_task_at: Option<DateTime<Utc>>,
    /// Most recent first.
    pub tracked_task_ids: VecDeque<String>,
}

impl EvolutionState {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Default::default()
        }
    }

    /// Update the circuit breaker. Returns the failure streak.
    pub fn record_outcome(&mut self, success: bool) -> u32 {
        if success {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }
        self.consecutive_failures
    }

    /// True the first time a completion of `task_id` is seen.
    pub fn claim_completion(&mut self, task_id: &str) -> bool {
        if self.tracked_task_ids.iter().any(|id| id == task_id) {
            return false;
        }
        self.tracked_task_ids.push_front(task_id.to_string());
        self.tracked_task_ids.truncate(TRACKED_IDS);
        true
    }

    pub fn clear_sleep(&mut self) {
        self.sleep_until = None;
        self.last_sleep_notice_at = None;
    }
}

/// Outcome of one evolution cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub success: bool,
    pub reason: &'static str,
}

/// Did the cycle make progress?
///
/// With repository markers: a commit or a successful push. Without them,
/// fall back to "spent real money over at least one round", which never
/// holds for offline cycles.
pub fn judge(done: &TaskDone, offline: bool) -> Verdict {
    if done.has_progress_markers() {
        let success = done.evolution_commit_created.unwrap_or(false)
            || done.evolution_repo_push_success.unwrap_or(false);
        Verdict {
            success,
            reason: if success { "repo_progress" } else { "no_repo_progress" },
        }
    } else {
        let success = !offline && done.cost_usd > LEGACY_MIN_COST_USD && done.total_rounds >= 1;
        Verdict {
            success,
            reason: if success {
                "legacy_cost_heuristic"
            } else {
                "legacy_no_progress"
            },
        }
    }
}

/// Instructions for one evolution cycle.
pub fn evolution_task_text(cycle: u64) -> String {
    format!(
        "EVOLUTION #{cycle}\n\
         Goal: land one small, safe, worthwhile improvement in this repository.\n\
         Rules:\n\
         1) Change something real in the repo (code, config or docs). An empty cycle is a failure.\n\
         2) Keep the change narrow and explain why it is needed.\n\
         3) Only touch what the change requires.\n\
         4) End by committing and pushing when that path is available.\n\
         When blocked, ship the smallest change that removes the blocker instead of only replying."
    )
}

pub fn review_task_text(reason: &str) -> String {
    let reason = reason.trim();
    format!(
        "REVIEW: {}",
        if reason.is_empty() { "owner request" } else { reason }
    )
}

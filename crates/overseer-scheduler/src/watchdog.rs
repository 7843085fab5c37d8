//! Timeout & heartbeat watchdog.
//!
//! Two tiers per in-flight task: a one-shot soft notice, then hard eviction
//! with a bounded front-of-queue retry. Heartbeat lag is reported but never
//! evicts on its own.
//!
//! `scan` only touches the queue. Terminating and respawning the worker,
//! notifying and persisting are left to the caller, driven by the report.

use chrono::{DateTime, Utc};
use overseer_core::config::WatchdogConfig;
use overseer_core::time::secs_between;
use serde::Serialize;

use crate::queue::TaskQueue;

/// First-tier notice for a long-running task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SoftTimeout {
    pub task_id: String,
    pub task_type: String,
    pub chat_id: Option<i64>,
    pub runtime_sec: f64,
    pub heartbeat_lag_sec: f64,
}

/// Structured record of a hard-timeout eviction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HardTimeout {
    pub task_id: String,
    pub task_type: String,
    pub worker_id: usize,
    pub runtime_sec: f64,
    pub heartbeat_lag_sec: f64,
    pub heartbeat_stale: bool,
    pub attempt: u32,
    pub requeued: bool,
    pub new_attempt: u32,
    pub max_retries: u32,
    /// Id of the retry task when requeued.
    pub retry_task_id: Option<String>,
    #[serde(skip)]
    pub chat_id: Option<i64>,
}

/// Everything one scan decided.
#[derive(Debug, Default)]
pub struct WatchdogReport {
    pub soft: Vec<SoftTimeout>,
    pub hard: Vec<HardTimeout>,
}

impl WatchdogReport {
    pub fn is_empty(&self) -> bool {
        self.soft.is_empty() && self.hard.is_empty()
    }
}

/// Timeout thresholds.
#[derive(Debug, Clone)]
pub struct Watchdog {
    pub soft_timeout_secs: f64,
    pub hard_timeout_secs: f64,
    pub heartbeat_stale_secs: f64,
    pub max_retries: u32,
}

impl Watchdog {
    pub fn from_config(cfg: &WatchdogConfig) -> Self {
        Self {
            soft_timeout_secs: cfg.soft_timeout_secs as f64,
            hard_timeout_secs: cfg.hard_timeout_secs as f64,
            heartbeat_stale_secs: cfg.heartbeat_stale_secs as f64,
            max_retries: cfg.max_retries,
        }
    }

    /// Check every in-flight task against `now`.
    pub fn scan(&self, queue: &mut TaskQueue, now: DateTime<Utc>) -> WatchdogReport {
        let mut report = WatchdogReport::default();
        let mut evict = Vec::new();

        for (task_id, entry) in queue.running_mut().iter_mut() {
            let runtime = secs_between(entry.started_at, now);
            let lag = secs_between(entry.last_heartbeat_at, now);

            if runtime >= self.soft_timeout_secs && !entry.soft_notice_sent {
                entry.soft_notice_sent = true;
                tracing::info!("⏳ Task {task_id} running {runtime:.0}s (soft timeout)");
                report.soft.push(SoftTimeout {
                    task_id: task_id.clone(),
                    task_type: entry.task.kind.to_string(),
                    chat_id: entry.task.chat_id,
                    runtime_sec: runtime,
                    heartbeat_lag_sec: lag,
                });
            }

            if runtime >= self.hard_timeout_secs {
                evict.push((task_id.clone(), runtime, lag));
            }
        }

        for (task_id, runtime, lag) in evict {
            let Some(entry) = queue.finish(&task_id) else {
                continue;
            };
            let attempt = entry.task.attempt;
            let mut record = HardTimeout {
                task_id: task_id.clone(),
                task_type: entry.task.kind.to_string(),
                worker_id: entry.worker_id,
                runtime_sec: (runtime * 100.0).round() / 100.0,
                heartbeat_lag_sec: (lag * 100.0).round() / 100.0,
                heartbeat_stale: lag >= self.heartbeat_stale_secs,
                attempt,
                requeued: false,
                new_attempt: attempt,
                max_retries: self.max_retries,
                retry_task_id: None,
                chat_id: entry.task.chat_id,
            };

            if attempt <= self.max_retries {
                match queue.enqueue_at(entry.task.retry(now), true, now) {
                    Ok(retry) => {
                        record.requeued = true;
                        record.new_attempt = retry.attempt;
                        record.retry_task_id = Some(retry.id);
                    }
                    Err(e) => tracing::warn!("⚠️ Could not requeue {task_id}: {e}"),
                }
            }

            tracing::warn!(
                "⏱️ Hard timeout: task {task_id} on worker {} after {runtime:.0}s (requeued={})",
                record.worker_id,
                record.requeued
            );
            report.hard.push(record);
        }

        report
    }
}

//! Priority task queue: pending tasks plus the in-flight map.
//!
//! Ordering is `(priority, sequence)` ascending: lower priority first, FIFO
//! within a priority. Front insertions take a negated sequence so the most
//! recent front insert runs before everything else at its priority.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::snapshot::{PendingRow, QueueSnapshot, RunningRow};
use crate::task::{RunningEntry, Task, TaskKind};

/// Why a task was not admitted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("task depth {depth} exceeds ceiling {ceiling}")]
    DepthExceeded { depth: u32, ceiling: u32 },
    #[error("task id {0} already queued or running")]
    DuplicateId(String),
}

/// What `cancel` removed.
#[derive(Debug, Clone, PartialEq)]
pub enum Cancelled {
    Pending(Task),
    /// The caller still owns terminating the bound worker.
    Running(RunningEntry),
}

/// Pending + running tasks. Owned by the control loop.
#[derive(Debug)]
pub struct TaskQueue {
    pending: Vec<Task>,
    running: BTreeMap<String, RunningEntry>,
    seq: i64,
    depth_ceiling: u32,
}

impl TaskQueue {
    pub fn new(depth_ceiling: u32) -> Self {
        Self {
            pending: Vec::new(),
            running: BTreeMap::new(),
            seq: 0,
            depth_ceiling,
        }
    }

    pub fn depth_ceiling(&self) -> u32 {
        self.depth_ceiling
    }

    pub fn enqueue(&mut self, task: Task, front: bool) -> Result<Task, QueueError> {
        self.enqueue_at(task, front, Utc::now())
    }

    /// Admit a task: assign sequence, default priority and `queued_at`, then re-sort.
    pub fn enqueue_at(
        &mut self,
        mut task: Task,
        front: bool,
        now: DateTime<Utc>,
    ) -> Result<Task, QueueError> {
        if task.depth > self.depth_ceiling {
            return Err(QueueError::DepthExceeded {
                depth: task.depth,
                ceiling: self.depth_ceiling,
            });
        }
        if self.contains(&task.id) {
            return Err(QueueError::DuplicateId(task.id));
        }

        self.seq += 1;
        task.sequence = if front { -self.seq } else { self.seq };
        task.priority = Some(task.effective_priority());
        task.attempt = task.attempt.max(1);
        task.queued_at = Some(now);

        tracing::debug!(
            "📥 Enqueue {} [{}] prio={} seq={} (pending: {})",
            task.id,
            task.kind,
            task.effective_priority(),
            task.sequence,
            self.pending.len()
        );
        self.pending.push(task.clone());
        self.pending
            .sort_by_key(|t| (t.effective_priority(), t.sequence));
        Ok(task)
    }

    /// Whether `id` is pending or running.
    pub fn contains(&self, id: &str) -> bool {
        self.running.contains_key(id) || self.pending.iter().any(|t| t.id == id)
    }

    /// Whether any pending or running task has this kind.
    pub fn has_kind(&self, kind: &TaskKind) -> bool {
        self.pending.iter().any(|t| &t.kind == kind)
            || self.running.values().any(|e| &e.task.kind == kind)
    }

    /// Dequeue the head of the pending list.
    pub fn pop_next(&mut self) -> Option<Task> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.remove(0))
        }
    }

    /// Record that `task` is now running on `worker_id`.
    pub fn start(&mut self, task: Task, worker_id: usize, now: DateTime<Utc>) -> &RunningEntry {
        let id = task.id.clone();
        tracing::debug!("▶️ Task {id} → worker {worker_id}");
        self.running
            .insert(id.clone(), RunningEntry::new(task, worker_id, now));
        &self.running[&id]
    }

    /// Drop the in-flight entry on completion.
    pub fn finish(&mut self, task_id: &str) -> Option<RunningEntry> {
        self.running.remove(task_id)
    }

    /// Refresh liveness; `false` when the task is not in flight.
    pub fn heartbeat(&mut self, task_id: &str, phase: Option<String>, now: DateTime<Utc>) -> bool {
        match self.running.get_mut(task_id) {
            Some(entry) => {
                entry.last_heartbeat_at = now;
                if phase.is_some() {
                    entry.heartbeat_phase = phase;
                }
                true
            }
            None => false,
        }
    }

    /// Remove a pending task, or the in-flight entry for a running one.
    pub fn cancel(&mut self, task_id: &str) -> Option<Cancelled> {
        if let Some(pos) = self.pending.iter().position(|t| t.id == task_id) {
            return Some(Cancelled::Pending(self.pending.remove(pos)));
        }
        self.running.remove(task_id).map(Cancelled::Running)
    }

    /// Keep only pending tasks matching `keep`; returns how many were dropped.
    pub fn retain_pending<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&Task) -> bool,
    {
        let before = self.pending.len();
        self.pending.retain(|t| keep(t));
        before - self.pending.len()
    }

    pub fn pending(&self) -> &[Task] {
        &self.pending
    }

    pub fn running(&self) -> &BTreeMap<String, RunningEntry> {
        &self.running
    }

    pub fn running_mut(&mut self) -> &mut BTreeMap<String, RunningEntry> {
        &mut self.running
    }

    /// Nothing pending and nothing in flight.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.running.is_empty()
    }

    /// Serializable copy of pending + running.
    pub fn snapshot(&self, reason: &str, now: DateTime<Utc>) -> QueueSnapshot {
        QueueSnapshot {
            ts: now,
            reason: reason.to_string(),
            pending_count: self.pending.len(),
            running_count: self.running.len(),
            pending: self.pending.iter().map(PendingRow::from_task).collect(),
            running: self
                .running
                .values()
                .map(|e| RunningRow::from_entry(e, now))
                .collect(),
        }
    }

    /// Re-enqueue pending rows from a snapshot.
    ///
    /// No-op when anything is already pending or the snapshot is older than
    /// `max_age_secs`. Running rows are not resumed.
    pub fn restore(&mut self, snap: &QueueSnapshot, max_age_secs: u64, now: DateTime<Utc>) -> usize {
        if !self.pending.is_empty() {
            return 0;
        }
        let age = (now - snap.ts).num_seconds();
        if age > max_age_secs as i64 {
            tracing::info!("⏭️ Snapshot too old ({age}s), not restoring");
            return 0;
        }

        let mut restored = 0;
        for row in &snap.pending {
            if row.task.id.trim().is_empty() {
                continue;
            }
            match self.enqueue_at(row.task.clone(), false, now) {
                Ok(_) => restored += 1,
                Err(e) => tracing::warn!("⚠️ Skipping snapshot row {}: {e}", row.id),
            }
        }
        restored
    }
}

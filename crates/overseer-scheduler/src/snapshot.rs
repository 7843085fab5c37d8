//! Queue snapshot: best-effort crash recovery.
//!
//! One JSON document holding pending and running rows, rewritten whole on
//! every queue change. Writes go to a sibling temp file first and are renamed
//! into place, so a reader never sees a torn file.

use chrono::{DateTime, Utc};
use overseer_core::error::Result;
use overseer_core::time::secs_between;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::task::{RunningEntry, Task};

/// Persisted queue state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub pending_count: usize,
    #[serde(default)]
    pub running_count: usize,
    #[serde(default)]
    pub pending: Vec<PendingRow>,
    #[serde(default)]
    pub running: Vec<RunningRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRow {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub priority: Option<i32>,
    pub attempt: u32,
    pub queued_at: Option<DateTime<Utc>>,
    pub queue_seq: i64,
    pub task: Task,
}

impl PendingRow {
    pub fn from_task(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            kind: task.kind.to_string(),
            priority: task.priority,
            attempt: task.attempt,
            queued_at: task.queued_at,
            queue_seq: task.sequence,
            task: task.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningRow {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub priority: Option<i32>,
    pub attempt: u32,
    pub worker_id: usize,
    pub runtime_sec: f64,
    pub heartbeat_lag_sec: f64,
    pub soft_sent: bool,
    pub task: Task,
}

impl RunningRow {
    pub fn from_entry(entry: &RunningEntry, now: DateTime<Utc>) -> Self {
        Self {
            id: entry.task.id.clone(),
            kind: entry.task.kind.to_string(),
            priority: entry.task.priority,
            attempt: entry.task.attempt,
            worker_id: entry.worker_id,
            runtime_sec: round2(secs_between(entry.started_at, now)),
            heartbeat_lag_sec: round2(secs_between(entry.last_heartbeat_at, now)),
            soft_sent: entry.soft_notice_sent,
            task: entry.task.clone(),
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// File-backed snapshot store.
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data_dir>/state/queue_snapshot.json`
    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join("state").join("queue_snapshot.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write atomically: temp file in the same directory, then rename.
    pub fn save(&self, snap: &QueueSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(snap)?;
        let tmp = self.path.with_extension(format!("json.tmp-{}", std::process::id()));
        std::fs::write(&tmp, json)?;
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        tracing::debug!(
            "💾 Snapshot ({}) saved: {} pending, {} running",
            snap.reason,
            snap.pending_count,
            snap.running_count
        );
        Ok(())
    }

    /// Save and swallow errors; snapshots are best-effort.
    pub fn save_logged(&self, snap: &QueueSnapshot) {
        if let Err(e) = self.save(snap) {
            tracing::warn!("⚠️ Failed to persist queue snapshot (reason={}): {e}", snap.reason);
        }
    }

    /// Load the last snapshot. Missing or unreadable files yield `None`.
    pub fn load(&self) -> Option<QueueSnapshot> {
        if !self.path.exists() {
            return None;
        }
        match std::fs::read_to_string(&self.path) {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(snap) => Some(snap),
                Err(e) => {
                    tracing::warn!("⚠️ Failed to parse {}: {e}", self.path.display());
                    None
                }
            },
            Err(e) => {
                tracing::warn!("⚠️ Failed to read {}: {e}", self.path.display());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::TaskQueue;
    use crate::task::TaskKind;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("overseer-snap-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_save_load_and_restore() {
        let dir = temp_dir("roundtrip");
        let store = SnapshotStore::in_dir(&dir);
        assert!(store.load().is_none());

        let now = Utc::now();
        let mut q = TaskQueue::new(3);
        q.enqueue_at(Task::new(TaskKind::Interactive, "a").with_id("a1"), false, now)
            .unwrap();
        q.enqueue_at(Task::new(TaskKind::Review, "b").with_id("b1"), false, now)
            .unwrap();
        let running = q.pop_next().unwrap();
        q.start(running, 0, now);
        store.save(&q.snapshot("unit", now)).unwrap();

        let snap = store.load().unwrap();
        assert_eq!(snap.reason, "unit");
        assert_eq!(snap.pending.len(), 1);
        assert_eq!(snap.running.len(), 1);
        assert_eq!(snap.running[0].worker_id, 0);

        let mut fresh = TaskQueue::new(3);
        assert_eq!(fresh.restore(&snap, 900, now), 1);
        assert_eq!(fresh.pending()[0].id, "b1");

        // No temp files left behind.
        let leftovers = std::fs::read_dir(dir.join("state"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_corrupt_snapshot_is_ignored() {
        let dir = temp_dir("corrupt");
        let store = SnapshotStore::in_dir(&dir);
        std::fs::create_dir_all(dir.join("state")).unwrap();
        std::fs::write(store.path(), "{not json").unwrap();
        assert!(store.load().is_none());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_save_replaces_previous() {
        let dir = temp_dir("replace");
        let store = SnapshotStore::in_dir(&dir);
        let q = TaskQueue::new(3);
        let now = Utc::now();
        store.save(&q.snapshot("first", now)).unwrap();
        store.save(&q.snapshot("second", now)).unwrap();
        assert_eq!(store.load().unwrap().reason, "second");
        std::fs::remove_dir_all(&dir).ok();
    }
}

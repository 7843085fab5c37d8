//! # Overseer Scheduler
//!
//! Task model, priority queue and the pieces that keep it honest.
//!
//! ## Architecture
//! ```text
//! TaskQueue
//!   ├── pending: sorted by (priority, sequence), front inserts get -seq
//!   ├── running: task id → RunningEntry (worker, heartbeat, soft notice)
//!   └── snapshot()/restore() ⇄ SnapshotStore (temp file + rename)
//!
//! Watchdog::scan (every tick)
//!   ├── soft timeout → one notice, task keeps running
//!   └── hard timeout → evict, requeue at front (bounded) or drop
//!
//! Notifier (log / webhook) · Journal (JSONL records)
//! ```

pub mod journal;
pub mod notify;
pub mod queue;
pub mod snapshot;
pub mod task;
pub mod watchdog;

pub use journal::Journal;
pub use notify::{Delivered, LogNotifier, Notice, Notifier, WebhookNotifier};
pub use queue::{Cancelled, QueueError, TaskQueue};
pub use snapshot::{QueueSnapshot, SnapshotStore};
pub use task::{RetryOf, RunningEntry, Task, TaskKind, new_task_id};
pub use watchdog::{HardTimeout, SoftTimeout, Watchdog, WatchdogReport};

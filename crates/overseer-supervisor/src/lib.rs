//! # Overseer Supervisor
//!
//! The single control loop that owns scheduler state.
//!
//! ```text
//! workers ──(JSON records)──► inbound channel ──► dispatcher (tag → handler)
//! handle  ──(Command)───────► command channel ──┐
//! watchdog tick ────────────────────────────────┤
//!                                               ▼
//!                                     Supervisor::run loop
//!                                       ├── assign pending → idle workers
//!                                       └── evolution admission control
//! ```

pub mod admission;
pub mod budget;
pub mod dedup;
pub mod dispatcher;
pub mod events;
pub mod evolution;
pub mod state;
pub mod supervisor;
pub mod workers;

#[cfg(test)]
mod test_support;

pub use admission::{Admission, admit};
pub use budget::{Budget, Usage};
pub use dedup::{DuplicateJudge, ExistingTask, LlmDuplicateJudge, NoDuplicateJudge};
pub use dispatcher::dispatch;
pub use events::TaskDone;
pub use evolution::EvolutionState;
pub use state::{StateStore, SupervisorState};
pub use supervisor::{Command, RunOutcome, StatusReport, Supervisor, SupervisorHandle};
pub use workers::{
    ExecutionReport, Executor, LlmExecutor, TokioWorkerRuntime, WorkerContext, WorkerError,
    WorkerPool, WorkerRuntime,
};

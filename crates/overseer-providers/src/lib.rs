//! # Overseer Providers
//!
//! Interchangeable model-inference backends and the router that picks between them.
//!
//! ```text
//! registry (static endpoints + env credentials)
//!   └── ProviderRouter::select() ──► ProviderSelection
//!         ├── cooldown / exclusion filtering
//!         ├── adaptive round-robin scoring
//!         └── ExhaustedError when nothing is usable
//! failover::run_with_failover() ── retries quota failures on the next selection
//! ```

pub mod classify;
pub mod failover;
pub mod openai_compatible;
pub mod registry;
pub mod router;

pub use classify::{ErrorClass, ProviderError};
pub use failover::{FailoverError, FailoverOutcome, ProviderFailure, run_with_failover};
pub use openai_compatible::{ChatCompletion, ChatMessage, OpenAiCompatibleClient};
pub use registry::{BackendKind, ProviderEndpoint, resolve_endpoints};
pub use router::{
    ExhaustedError, ProviderRouter, ProviderSelection, ProviderStat, RouterEvent, RouterMode,
    RouterSnapshot, SleepPlan,
};

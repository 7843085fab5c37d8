//! Durable supervisor state: budget spend and evolution bookkeeping.
//!
//! Lives next to the queue snapshot and uses the same temp-file-then-rename
//! write, so a restart resumes the spend total and the circuit breaker
//! instead of starting from zero.

use chrono::{DateTime, Utc};
use overseer_core::config::OverseerConfig;
use overseer_core::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::budget::Budget;
use crate::evolution::EvolutionState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorState {
    pub ts: DateTime<Utc>,
    pub budget: Budget,
    pub evolution: EvolutionState,
}

impl SupervisorState {
    /// Split into live state. The budget ceiling always comes from config.
    pub fn resume(self, config: &OverseerConfig) -> (Budget, EvolutionState) {
        let mut budget = self.budget;
        budget.total_usd = config.total_budget_usd;
        (budget, self.evolution)
    }
}

/// File-backed store for [`SupervisorState`].
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data_dir>/state/state.json`
    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join("state").join("state.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, state: &SupervisorState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension(format!("json.tmp-{}", std::process::id()));
        std::fs::write(&tmp, json)?;
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn save_logged(&self, state: &SupervisorState) {
        if let Err(e) = self.save(state) {
            tracing::warn!("⚠️ Failed to persist supervisor state: {e}");
        }
    }

    /// Missing or unreadable files yield `None`.
    pub fn load(&self) -> Option<SupervisorState> {
        if !self.path.exists() {
            return None;
        }
        let json = match std::fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!("⚠️ Failed to read {}: {e}", self.path.display());
                return None;
            }
        };
        match serde_json::from_str(&json) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!("⚠️ Failed to parse {}: {e}", self.path.display());
                None
            }
        }
    }
}

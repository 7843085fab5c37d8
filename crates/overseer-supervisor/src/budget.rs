//! Spend tracking fed by `llm_usage` events.

use serde::{Deserialize, Serialize};

/// Usage reported for one backend call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

/// Running totals against a fixed budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    pub total_usd: f64,
    pub spent_usd: f64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub calls: u64,
}

impl Budget {
    pub fn new(total_usd: f64) -> Self {
        Self {
            total_usd,
            spent_usd: 0.0,
            prompt_tokens: 0,
            completion_tokens: 0,
            calls: 0,
        }
    }

    pub fn add(&mut self, usage: &Usage) {
        // Negative or NaN costs would inflate the remaining budget.
        if usage.cost.is_finite() && usage.cost > 0.0 {
            self.spent_usd += usage.cost;
        }
        self.prompt_tokens = self.prompt_tokens.saturating_add(usage.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(usage.completion_tokens);
        self.calls = self.calls.saturating_add(1);
    }

    pub fn remaining(&self) -> f64 {
        self.total_usd - self.spent_usd
    }
}

//! Overseer configuration system.
//!
//! Values come from `~/.overseer/config.toml` (every field has a default) and
//! are then overridden by `OVERSEER_*` environment variables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{OverseerError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverseerConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub owner_chat_id: Option<i64>,
    #[serde(default = "default_total_budget")]
    pub total_budget_usd: f64,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub evolution: EvolutionConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

fn default_data_dir() -> String { "~/.overseer".into() }
fn default_workers() -> usize { 2 }
fn default_total_budget() -> f64 { 100.0 }

impl Default for OverseerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            workers: default_workers(),
            owner_chat_id: None,
            total_budget_usd: default_total_budget(),
            router: RouterConfig::default(),
            watchdog: WatchdogConfig::default(),
            queue: QueueConfig::default(),
            evolution: EvolutionConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

impl OverseerConfig {
    /// Load config from the default path, falling back to defaults, then apply env overrides.
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Load config from a specific path (no env overrides).
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| OverseerError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Overseer home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".overseer")
    }

    /// Apply `OVERSEER_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup: &lookup };

        if let Some(v) = env.string("OVERSEER_DATA_DIR") {
            self.data_dir = v;
        }
        if let Some(v) = env.int("OVERSEER_MAX_WORKERS") {
            self.workers = v.max(1) as usize;
        }
        if let Some(v) = env.int("OVERSEER_OWNER_CHAT_ID") {
            self.owner_chat_id = Some(v);
        }
        if let Some(v) = env.float("OVERSEER_TOTAL_BUDGET") {
            self.total_budget_usd = v;
        }

        // Router
        if let Some(order) = env.list("OVERSEER_PROVIDER_ORDER") {
            self.router.order = order.into_iter().map(|p| p.to_lowercase()).collect();
        }
        if let Some(v) = env.string("OVERSEER_MULTI_API_MODE") {
            self.router.mode = v.to_lowercase();
        }
        if let Some(v) = env.int("OVERSEER_PROVIDER_COOLDOWN_SEC") {
            self.router.cooldown_secs = v.max(1) as u64;
        }
        for provider in self.router.order.clone() {
            let key = format!("OVERSEER_{}_MODEL_POOL", provider.to_uppercase());
            if let Some(pool) = env.list(&key) {
                self.router.model_pools.insert(provider, pool);
            }
        }

        // Watchdog
        if let Some(v) = env.int("OVERSEER_SOFT_TIMEOUT_SEC") {
            self.watchdog.soft_timeout_secs = v.max(1) as u64;
        }
        if let Some(v) = env.int("OVERSEER_HARD_TIMEOUT_SEC") {
            self.watchdog.hard_timeout_secs = v.max(1) as u64;
        }
        if let Some(v) = env.int("OVERSEER_HEARTBEAT_STALE_SEC") {
            self.watchdog.heartbeat_stale_secs = v.max(1) as u64;
        }
        if let Some(v) = env.int("OVERSEER_QUEUE_MAX_RETRIES") {
            self.watchdog.max_retries = v.max(0) as u32;
        }

        // Queue
        if let Some(v) = env.int("OVERSEER_TASK_DEPTH_CEILING") {
            self.queue.depth_ceiling = v.max(0) as u32;
        }

        // Evolution
        if let Some(v) = env.bool("OVERSEER_EVOLUTION_ENABLED") {
            self.evolution.enabled = v;
        }
        if let Some(v) = env.int("OVERSEER_EVOLUTION_FAILURE_LIMIT") {
            self.evolution.failure_limit = v.max(1) as u32;
        }
        if let Some(v) = env.float("OVERSEER_EVOLUTION_BUDGET_RESERVE") {
            self.evolution.budget_reserve_usd = v;
        }
        if let Some(v) = env.bool("OVERSEER_OFFLINE_EVOLUTION") {
            self.evolution.offline = v;
        }
        if let Some(v) = env.bool("OVERSEER_EVOLUTION_NOTIFY_START") {
            self.evolution.notify_start = v;
        }
        if let Some(v) = env.bool("OVERSEER_LAZY_MODE") {
            self.evolution.lazy_sleep = v;
        }
        if let Some(v) = env.int("OVERSEER_LAZY_BUFFER_SEC") {
            self.evolution.lazy_buffer_secs = v.clamp(0, 3600) as u64;
        }
        if let Some(v) = env.int("OVERSEER_LAZY_NOTICE_INTERVAL_SEC") {
            self.evolution.lazy_notice_interval_secs = v.clamp(30, 3600) as u64;
        }

        // Notify
        if let Some(v) = env.string("OVERSEER_NOTIFY_WEBHOOK_URL") {
            self.notify.webhook_url = Some(v);
        }
    }
}

/// Provider router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_provider_order")]
    pub order: Vec<String>,
    #[serde(default = "default_router_mode")]
    pub mode: String,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Per-provider model pool overrides (provider name → models).
    #[serde(default)]
    pub model_pools: BTreeMap<String, Vec<String>>,
}

fn default_provider_order() -> Vec<String> {
    vec!["groq", "openrouter", "cloudflare", "hf"]
        .into_iter().map(String::from).collect()
}
fn default_router_mode() -> String { "adaptive_rr".into() }
fn default_cooldown_secs() -> u64 { 600 }

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            order: default_provider_order(),
            mode: default_router_mode(),
            cooldown_secs: default_cooldown_secs(),
            model_pools: BTreeMap::new(),
        }
    }
}

/// Timeout and heartbeat watchdog configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_soft_timeout")]
    pub soft_timeout_secs: u64,
    #[serde(default = "default_hard_timeout")]
    pub hard_timeout_secs: u64,
    #[serde(default = "default_heartbeat_stale")]
    pub heartbeat_stale_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_secs: u64,
}

fn default_soft_timeout() -> u64 { 600 }
fn default_hard_timeout() -> u64 { 1800 }
fn default_heartbeat_stale() -> u64 { 120 }
fn default_max_retries() -> u32 { 1 }
fn default_tick_secs() -> u64 { 5 }
fn default_cancel_grace() -> u64 { 5 }

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            soft_timeout_secs: default_soft_timeout(),
            hard_timeout_secs: default_hard_timeout(),
            heartbeat_stale_secs: default_heartbeat_stale(),
            max_retries: default_max_retries(),
            tick_secs: default_tick_secs(),
            cancel_grace_secs: default_cancel_grace(),
        }
    }
}

/// Task queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_depth_ceiling")]
    pub depth_ceiling: u32,
    #[serde(default = "default_snapshot_max_age")]
    pub snapshot_max_age_secs: u64,
}

fn default_depth_ceiling() -> u32 { 3 }
fn default_snapshot_max_age() -> u64 { 900 }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            depth_ceiling: default_depth_ceiling(),
            snapshot_max_age_secs: default_snapshot_max_age(),
        }
    }
}

/// Evolution (self-modification) admission control.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_failure_limit")]
    pub failure_limit: u32,
    #[serde(default = "default_budget_reserve")]
    pub budget_reserve_usd: f64,
    #[serde(default)]
    pub offline: bool,
    #[serde(default = "bool_true")]
    pub lazy_sleep: bool,
    #[serde(default = "default_lazy_buffer")]
    pub lazy_buffer_secs: u64,
    #[serde(default = "default_lazy_notice_interval")]
    pub lazy_notice_interval_secs: u64,
    #[serde(default)]
    pub notify_start: bool,
}

fn bool_true() -> bool { true }
fn default_failure_limit() -> u32 { 1 }
fn default_budget_reserve() -> f64 { 50.0 }
fn default_lazy_buffer() -> u64 { 30 }
fn default_lazy_notice_interval() -> u64 { 300 }

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_limit: default_failure_limit(),
            budget_reserve_usd: default_budget_reserve(),
            offline: false,
            lazy_sleep: true,
            lazy_buffer_secs: default_lazy_buffer(),
            lazy_notice_interval_secs: default_lazy_notice_interval(),
            notify_start: false,
        }
    }
}

/// Outbound notification configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// Typed access to string-valued overrides.
struct EnvReader<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<'_, F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn int(&self, key: &str) -> Option<i64> {
        let raw = self.string(key)?;
        match raw.parse::<i64>() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("⚠️ Ignoring non-integer {key}={raw}");
                None
            }
        }
    }

    fn float(&self, key: &str) -> Option<f64> {
        let raw = self.string(key)?;
        match raw.parse::<f64>() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("⚠️ Ignoring non-numeric {key}={raw}");
                None
            }
        }
    }

    fn bool(&self, key: &str) -> Option<bool> {
        let raw = self.string(key)?;
        Some(matches!(
            raw.to_lowercase().as_str(),
            "1" | "true" | "yes" | "on" | "y"
        ))
    }

    fn list(&self, key: &str) -> Option<Vec<String>> {
        let raw = self.string(key)?;
        let items: Vec<String> = raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if items.is_empty() { None } else { Some(items) }
    }
}

//! Provider Router: picks backend + model for the next call.
//!
//! Keeps rolling success/failure statistics per provider and per
//! provider+model, with time-boxed cooldowns. Selection walks the configured
//! order, drops anything without credentials, excluded for the current
//! attempt, or cooling down, then ranks what is left.
//!
//! The stats table is shared between the control loop and workers, so every
//! read and mutation goes through one lock.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use crate::classify::ErrorClass;
use crate::registry::{BackendKind, ProviderEndpoint};
use overseer_core::time::utc_iso;

/// Max number of per-model block entries reported for one provider.
const MAX_MODEL_BLOCKS: usize = 4;

/// Ranking strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterMode {
    /// Rank by `(fail - success, last_selected_at, order_index)`.
    #[default]
    AdaptiveRr,
    /// First usable provider, first usable model.
    Ordered,
}

impl RouterMode {
    /// Parse a mode name; unknown names fall back to adaptive.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "ordered" | "order" | "priority" => Self::Ordered,
            _ => Self::AdaptiveRr,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdaptiveRr => "adaptive_rr",
            Self::Ordered => "ordered",
        }
    }
}

/// Rolling statistics for one provider or one provider+model key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderStat {
    pub success_count: u64,
    pub fail_count: u64,
    pub last_error_class: Option<ErrorClass>,
    pub last_selected_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Never moves backwards.
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl ProviderStat {
    fn score(&self) -> i64 {
        self.fail_count as i64 - self.success_count as i64
    }

    fn cooling_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.cooldown_until.filter(|until| *until > now)
    }

    fn record_failure(
        &mut self,
        class: ErrorClass,
        now: DateTime<Utc>,
        cooldown_until: Option<DateTime<Utc>>,
    ) {
        self.fail_count += 1;
        self.last_error_class = Some(class);
        self.last_failure_at = Some(now);
        if let Some(until) = cooldown_until {
            self.cooldown_until = Some(self.cooldown_until.map_or(until, |cur| cur.max(until)));
        }
    }

    fn record_success(&mut self, now: DateTime<Utc>) {
        self.success_count += 1;
        self.last_success_at = Some(now);
        self.last_error_class = None;
    }
}

/// The backend + model chosen for one call. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSelection {
    pub name: String,
    pub backend: BackendKind,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

/// Observability events produced by the router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RouterEvent {
    #[serde(rename = "free_provider_selected")]
    Selected { provider: String, model: String },
    #[serde(rename = "free_provider_switched")]
    Switched {
        from: String,
        to: String,
        model: String,
        mode: RouterMode,
    },
    #[serde(rename = "free_provider_exhausted")]
    Exhausted {
        provider: String,
        model: Option<String>,
        error_class: ErrorClass,
        cooldown_until: Option<DateTime<Utc>>,
    },
}

impl RouterEvent {
    /// Wire tag of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Selected { .. } => "free_provider_selected",
            Self::Switched { .. } => "free_provider_switched",
            Self::Exhausted { .. } => "free_provider_exhausted",
        }
    }
}

/// No provider is usable for this attempt.
#[derive(Debug, Clone, Error)]
#[error("all providers exhausted: excluded={}", join_or_none(.exhausted))]
pub struct ExhaustedError {
    /// Providers excluded by the caller for this attempt.
    pub exhausted: Vec<String>,
    /// Why each configured provider was unusable.
    pub unavailable_reasons: BTreeMap<String, String>,
}

/// Earliest point at which some credentialed provider leaves cooldown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SleepPlan {
    pub wake_at: DateTime<Utc>,
    pub wait_secs: u64,
    /// Cooling providers, soonest first.
    pub providers: Vec<String>,
}

/// Point-in-time copy of router state, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct RouterSnapshot {
    pub mode: RouterMode,
    pub order: Vec<String>,
    pub last_selected: Option<String>,
    pub providers: BTreeMap<String, ProviderStat>,
    /// Keyed by `provider::model`.
    pub models: BTreeMap<String, ProviderStat>,
}

#[derive(Default)]
struct RouterState {
    providers: HashMap<String, ProviderStat>,
    models: HashMap<(String, String), ProviderStat>,
    last_selected: Option<String>,
}

impl RouterState {
    fn provider(&mut self, name: &str) -> &mut ProviderStat {
        self.providers.entry(name.to_string()).or_default()
    }

    fn model(&mut self, provider: &str, model: &str) -> &mut ProviderStat {
        self.models
            .entry((provider.to_string(), model.to_string()))
            .or_default()
    }
}

/// Adaptive multi-backend router.
pub struct ProviderRouter {
    endpoints: Vec<ProviderEndpoint>,
    mode: RouterMode,
    cooldown: Duration,
    state: Mutex<RouterState>,
}

impl ProviderRouter {
    /// Create a router over resolved endpoints, in configured order.
    pub fn new(endpoints: Vec<ProviderEndpoint>, mode: RouterMode, cooldown_secs: u64) -> Self {
        Self {
            endpoints,
            mode,
            cooldown: Duration::seconds(cooldown_secs.max(1) as i64),
            state: Mutex::new(RouterState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        // A panicking holder cannot leave the counters half-written.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mode(&self) -> RouterMode {
        self.mode
    }

    pub fn order(&self) -> Vec<String> {
        self.endpoints.iter().map(|e| e.name.clone()).collect()
    }

    /// How long `mark_exhausted` cools a provider down.
    pub fn cooldown_window(&self) -> Duration {
        self.cooldown
    }

    pub fn endpoint(&self, name: &str) -> Option<&ProviderEndpoint> {
        self.endpoints.iter().find(|e| e.name == name)
    }

    pub fn last_selected(&self) -> Option<String> {
        self.lock().last_selected.clone()
    }

    /// Select with the current clock.
    pub fn select(
        &self,
        exclude: &[String],
        exclude_models: &BTreeMap<String, Vec<String>>,
    ) -> Result<(ProviderSelection, RouterEvent), ExhaustedError> {
        self.select_at(exclude, exclude_models, Utc::now())
    }

    /// Select the next backend + model as of `now`.
    pub fn select_at(
        &self,
        exclude: &[String],
        exclude_models: &BTreeMap<String, Vec<String>>,
        now: DateTime<Utc>,
    ) -> Result<(ProviderSelection, RouterEvent), ExhaustedError> {
        let excluded: HashSet<String> = exclude
            .iter()
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        let mut skip: BTreeMap<String, HashSet<&str>> = BTreeMap::new();
        for (provider, models) in exclude_models {
            skip.entry(provider.trim().to_lowercase())
                .or_default()
                .extend(models.iter().map(|m| m.trim()));
        }

        let mut state = self.lock();
        let mut unavailable = BTreeMap::new();
        let mut candidates: Vec<(usize, Vec<String>)> = Vec::new();

        for (idx, endpoint) in self.endpoints.iter().enumerate() {
            let name = endpoint.name.as_str();
            if excluded.contains(name) {
                unavailable.insert(name.to_string(), "already_exhausted_in_this_cycle".into());
                continue;
            }
            if !endpoint.has_credentials() {
                unavailable.insert(name.to_string(), "missing_credentials".into());
                continue;
            }
            if let Some(until) = state.providers.get(name).and_then(|s| s.cooling_at(now)) {
                unavailable.insert(name.to_string(), format!("cooldown_until={}", utc_iso(until)));
                continue;
            }
            if endpoint.models.is_empty() {
                unavailable.insert(name.to_string(), "empty_model_pool".into());
                continue;
            }

            let skip_models = skip.get(name);

            let mut available = Vec::new();
            let mut blocked = Vec::new();
            for model in &endpoint.models {
                if skip_models.is_some_and(|s| s.contains(model.as_str())) {
                    blocked.push(format!("{model}:already_exhausted_in_this_cycle"));
                    continue;
                }
                let key = (name.to_string(), model.clone());
                if let Some(until) = state.models.get(&key).and_then(|s| s.cooling_at(now)) {
                    blocked.push(format!("{model}:cooldown_until={}", utc_iso(until)));
                    continue;
                }
                available.push(model.clone());
            }

            if available.is_empty() {
                let reason = if blocked.is_empty() {
                    "all_models_unavailable".to_string()
                } else {
                    blocked
                        .into_iter()
                        .take(MAX_MODEL_BLOCKS)
                        .collect::<Vec<_>>()
                        .join(";")
                };
                unavailable.insert(name.to_string(), reason);
                continue;
            }
            candidates.push((idx, available));
        }

        if candidates.is_empty() {
            let exhausted = self
                .endpoints
                .iter()
                .filter(|e| excluded.contains(&e.name))
                .map(|e| e.name.clone())
                .collect();
            tracing::warn!("🚫 No usable provider: {:?}", unavailable);
            return Err(ExhaustedError {
                exhausted,
                unavailable_reasons: unavailable,
            });
        }

        let (provider_idx, available) = match self.mode {
            RouterMode::Ordered => candidates.swap_remove(0),
            RouterMode::AdaptiveRr => {
                let best = candidates
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, (idx, _))| {
                        let stat = state.providers.get(&self.endpoints[*idx].name);
                        rank(stat, *idx)
                    })
                    .map(|(pos, _)| pos)
                    .unwrap_or(0);
                candidates.swap_remove(best)
            }
        };
        let endpoint = &self.endpoints[provider_idx];

        let model = match self.mode {
            RouterMode::Ordered => available[0].clone(),
            RouterMode::AdaptiveRr => {
                let pool_index =
                    |m: &str| endpoint.models.iter().position(|x| x == m).unwrap_or(0);
                available
                    .iter()
                    .min_by_key(|m| {
                        let stat = state.models.get(&(endpoint.name.clone(), (*m).clone()));
                        rank(stat, pool_index(m))
                    })
                    .cloned()
                    .unwrap_or_else(|| available[0].clone())
            }
        };

        let previous = state.last_selected.replace(endpoint.name.clone());
        state.provider(&endpoint.name).last_selected_at = Some(now);
        state.model(&endpoint.name, &model).last_selected_at = Some(now);
        drop(state);

        let event = match previous {
            Some(prev) if prev != endpoint.name => {
                tracing::info!("🔄 Provider switch: {prev} → {} ({model})", endpoint.name);
                RouterEvent::Switched {
                    from: prev,
                    to: endpoint.name.clone(),
                    model: model.clone(),
                    mode: self.mode,
                }
            }
            _ => RouterEvent::Selected {
                provider: endpoint.name.clone(),
                model: model.clone(),
            },
        };

        let selection = ProviderSelection {
            name: endpoint.name.clone(),
            backend: endpoint.backend,
            base_url: endpoint.base_url.clone(),
            api_key: endpoint.api_key.clone().unwrap_or_default(),
            model,
        };
        Ok((selection, event))
    }

    pub fn mark_success(&self, provider: &str, model: Option<&str>) {
        self.mark_success_at(provider, model, Utc::now());
    }

    pub fn mark_success_at(&self, provider: &str, model: Option<&str>, now: DateTime<Utc>) {
        let mut state = self.lock();
        state.provider(provider).record_success(now);
        if let Some(model) = model.filter(|m| !m.is_empty()) {
            state.model(provider, model).record_success(now);
        }
    }

    /// Record a failure. `cooldown_until` only ever extends an existing cooldown.
    pub fn mark_failure(
        &self,
        provider: &str,
        error_class: ErrorClass,
        model: Option<&str>,
        cooldown_until: Option<DateTime<Utc>>,
    ) -> RouterEvent {
        self.mark_failure_at(provider, error_class, model, cooldown_until, Utc::now())
    }

    pub fn mark_failure_at(
        &self,
        provider: &str,
        error_class: ErrorClass,
        model: Option<&str>,
        cooldown_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> RouterEvent {
        let model = model.filter(|m| !m.is_empty());
        let mut state = self.lock();
        state
            .provider(provider)
            .record_failure(error_class, now, cooldown_until);
        if let Some(model) = model {
            state
                .model(provider, model)
                .record_failure(error_class, now, cooldown_until);
        }
        drop(state);

        tracing::debug!("⚠️ Provider {provider} failed: {error_class}");
        RouterEvent::Exhausted {
            provider: provider.to_string(),
            model: model.map(String::from),
            error_class,
            cooldown_until,
        }
    }

    /// Failure plus a full cooldown window starting now.
    pub fn mark_exhausted(
        &self,
        provider: &str,
        error_class: ErrorClass,
        model: Option<&str>,
    ) -> RouterEvent {
        self.mark_exhausted_at(provider, error_class, model, Utc::now())
    }

    pub fn mark_exhausted_at(
        &self,
        provider: &str,
        error_class: ErrorClass,
        model: Option<&str>,
        now: DateTime<Utc>,
    ) -> RouterEvent {
        let until = now + self.cooldown;
        tracing::info!("🧊 Provider {provider} cooling down until {}", utc_iso(until));
        self.mark_failure_at(provider, error_class, model, Some(until), now)
    }

    /// Provider-level cooldown end, if still in the future.
    pub fn cooldown_until(&self, provider: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.lock()
            .providers
            .get(provider)
            .and_then(|s| s.cooling_at(now))
    }

    /// `None` when some credentialed provider is usable now (or none has credentials);
    /// otherwise the earliest wake-up plus `buffer_secs`.
    pub fn sleep_plan(&self, now: DateTime<Utc>, buffer_secs: u64) -> Option<SleepPlan> {
        let state = self.lock();
        let mut waiting: Vec<(String, DateTime<Utc>)> = Vec::new();
        for endpoint in self.endpoints.iter().filter(|e| e.has_credentials()) {
            match state.providers.get(&endpoint.name).and_then(|s| s.cooling_at(now)) {
                Some(until) => waiting.push((endpoint.name.clone(), until)),
                None => return None,
            }
        }
        drop(state);

        waiting.sort_by_key(|(_, until)| *until);
        let earliest = waiting.first()?.1;
        let wake_at = earliest + Duration::seconds(buffer_secs as i64);
        let wait_secs = (wake_at - now).num_seconds().max(1) as u64;
        Some(SleepPlan {
            wake_at,
            wait_secs,
            providers: waiting.into_iter().map(|(name, _)| name).collect(),
        })
    }

    pub fn state_snapshot(&self) -> RouterSnapshot {
        let state = self.lock();
        RouterSnapshot {
            mode: self.mode,
            order: self.order(),
            last_selected: state.last_selected.clone(),
            providers: state
                .providers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            models: state
                .models
                .iter()
                .map(|((p, m), v)| (format!("{p}::{m}"), v.clone()))
                .collect(),
        }
    }
}

fn join_or_none(names: &[String]) -> String {
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(",")
    }
}

/// Lower sorts first: fewer net failures, least recently selected, earlier in order.
fn rank(stat: Option<&ProviderStat>, order_idx: usize) -> (i64, i64, usize) {
    let score = stat.map_or(0, ProviderStat::score);
    let last = stat
        .and_then(|s| s.last_selected_at)
        .map_or(i64::MIN, |t| t.timestamp_micros());
    (score, last, order_idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn endpoint(name: &str, key: Option<&str>, models: &[&str]) -> ProviderEndpoint {
        ProviderEndpoint {
            name: name.into(),
            backend: BackendKind::OpenAi,
            base_url: format!("https://{name}.test/v1"),
            api_key: key.map(String::from),
            models: models.iter().map(|m| m.to_string()).collect(),
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn no_models() -> BTreeMap<String, Vec<String>> {
        BTreeMap::new()
    }

    fn two_providers() -> ProviderRouter {
        ProviderRouter::new(
            vec![
                endpoint("groq", Some("g"), &["g1"]),
                endpoint("openrouter", Some("o"), &["o1"]),
            ],
            RouterMode::AdaptiveRr,
            600,
        )
    }

    #[test]
    fn test_only_credentialed_provider_selected() {
        let router = ProviderRouter::new(
            vec![
                endpoint("groq", None, &["g1"]),
                endpoint("openrouter", Some("o"), &["o1"]),
            ],
            RouterMode::AdaptiveRr,
            600,
        );
        let (sel, event) = router.select_at(&[], &no_models(), t0()).unwrap();
        assert_eq!(sel.name, "openrouter");
        assert_eq!(sel.model, "o1");
        assert_eq!(event.kind(), "free_provider_selected");
    }

    #[test]
    fn test_no_credentials_lists_every_provider() {
        let router = ProviderRouter::new(
            vec![
                endpoint("groq", None, &["g1"]),
                endpoint("openrouter", None, &["o1"]),
                endpoint("hf", Some("  "), &["h1"]),
            ],
            RouterMode::AdaptiveRr,
            600,
        );
        let err = router.select_at(&[], &no_models(), t0()).unwrap_err();
        assert_eq!(err.unavailable_reasons.len(), 3);
        for name in ["groq", "openrouter", "hf"] {
            assert_eq!(err.unavailable_reasons[name], "missing_credentials");
        }
    }

    #[test]
    fn test_adaptive_prefers_fewer_failures() {
        let router = two_providers();
        for _ in 0..3 {
            router.mark_failure_at("groq", ErrorClass::ProviderApiError, None, None, t0());
        }
        let (sel, _) = router.select_at(&[], &no_models(), t0()).unwrap();
        assert_eq!(sel.name, "openrouter");
    }

    #[test]
    fn test_adaptive_round_robins_on_ties() {
        let router = two_providers();
        let (first, e1) = router.select_at(&[], &no_models(), t0()).unwrap();
        let (second, e2) = router
            .select_at(&[], &no_models(), t0() + Duration::seconds(1))
            .unwrap();
        assert_eq!(first.name, "groq");
        assert_eq!(second.name, "openrouter");
        assert_eq!(e1.kind(), "free_provider_selected");
        assert_eq!(
            e2,
            RouterEvent::Switched {
                from: "groq".into(),
                to: "openrouter".into(),
                model: "o1".into(),
                mode: RouterMode::AdaptiveRr,
            }
        );
    }

    #[test]
    fn test_ordered_mode_sticks_to_first() {
        let router = ProviderRouter::new(
            vec![
                endpoint("groq", Some("g"), &["g1", "g2"]),
                endpoint("openrouter", Some("o"), &["o1"]),
            ],
            RouterMode::Ordered,
            600,
        );
        for i in 0..3 {
            let (sel, event) = router
                .select_at(&[], &no_models(), t0() + Duration::seconds(i))
                .unwrap();
            assert_eq!((sel.name.as_str(), sel.model.as_str()), ("groq", "g1"));
            assert_eq!(event.kind(), "free_provider_selected");
        }
    }

    #[test]
    fn test_exhausted_provider_skipped_until_cooldown_elapses() {
        let router = ProviderRouter::new(
            vec![endpoint("groq", Some("g"), &["g1"])],
            RouterMode::AdaptiveRr,
            600,
        );
        router.mark_exhausted_at("groq", ErrorClass::QuotaOrRateLimit, None, t0());

        let err = router
            .select_at(&[], &no_models(), t0() + Duration::seconds(10))
            .unwrap_err();
        assert!(err.unavailable_reasons["groq"].starts_with("cooldown_until="));

        let (sel, _) = router
            .select_at(&[], &no_models(), t0() + Duration::seconds(601))
            .unwrap();
        assert_eq!(sel.name, "groq");
    }

    #[test]
    fn test_cooldown_never_moves_backwards() {
        let router = two_providers();
        let late = t0() + Duration::seconds(900);
        router.mark_failure_at("groq", ErrorClass::QuotaOrRateLimit, None, Some(late), t0());
        router.mark_failure_at(
            "groq",
            ErrorClass::QuotaOrRateLimit,
            None,
            Some(t0() + Duration::seconds(60)),
            t0(),
        );
        assert_eq!(router.cooldown_until("groq", t0()), Some(late));
    }

    #[test]
    fn test_unavailable_reasons() {
        let router = ProviderRouter::new(
            vec![
                endpoint("groq", Some("g"), &["g1"]),
                endpoint("openrouter", Some("o"), &["o1"]),
                endpoint("hf", Some("h"), &[]),
            ],
            RouterMode::AdaptiveRr,
            600,
        );
        router.mark_exhausted_at("groq", ErrorClass::QuotaOrRateLimit, None, t0());
        let err = router
            .select_at(&["openrouter".to_string()], &no_models(), t0())
            .unwrap_err();
        assert_eq!(err.exhausted, vec!["openrouter"]);
        assert_eq!(
            err.unavailable_reasons["openrouter"],
            "already_exhausted_in_this_cycle"
        );
        assert_eq!(err.unavailable_reasons["hf"], "empty_model_pool");
        assert!(err.unavailable_reasons["groq"].starts_with("cooldown_until="));
        assert!(err.to_string().contains("excluded=openrouter"));
    }

    #[test]
    fn test_model_level_blocks() {
        let router = ProviderRouter::new(
            vec![endpoint("groq", Some("g"), &["g1", "g2"])],
            RouterMode::AdaptiveRr,
            600,
        );
        // Model cooling down while the provider itself is usable.
        router.lock().model("groq", "g2").cooldown_until = Some(t0() + Duration::seconds(600));

        let (sel, _) = router.select_at(&[], &no_models(), t0()).unwrap();
        assert_eq!(sel.model, "g1");

        let mut models = BTreeMap::new();
        models.insert("groq".to_string(), vec!["g1".to_string()]);
        let err = router.select_at(&[], &models, t0()).unwrap_err();
        assert!(err.unavailable_reasons["groq"]
            .starts_with("g1:already_exhausted_in_this_cycle;g2:cooldown_until="));
    }

    #[test]
    fn test_model_exclusions_ignore_provider_case() {
        let router = two_providers();
        let mut models = BTreeMap::new();
        models.insert(" GROQ".to_string(), vec!["g1".to_string()]);
        for _ in 0..3 {
            let (sel, _) = router.select_at(&[], &models, t0()).unwrap();
            assert_eq!(sel.name, "openrouter");
        }

        models.insert("OpenRouter".to_string(), vec!["o1".to_string()]);
        let err = router.select_at(&[], &models, t0()).unwrap_err();
        assert_eq!(
            err.unavailable_reasons["groq"],
            "g1:already_exhausted_in_this_cycle"
        );
    }

    #[test]
    fn test_model_block_list_is_capped() {
        let router = ProviderRouter::new(
            vec![endpoint("groq", Some("g"), &["a", "b", "c", "d", "e"])],
            RouterMode::AdaptiveRr,
            600,
        );
        let mut models = BTreeMap::new();
        models.insert(
            "groq".to_string(),
            ["a", "b", "c", "d", "e"].iter().map(|s| s.to_string()).collect(),
        );
        let err = router.select_at(&[], &models, t0()).unwrap_err();
        assert_eq!(err.unavailable_reasons["groq"].split(';').count(), 4);
    }

    #[test]
    fn test_model_ranking_within_provider() {
        let router = ProviderRouter::new(
            vec![endpoint("groq", Some("g"), &["m1", "m2"])],
            RouterMode::AdaptiveRr,
            600,
        );
        router.mark_failure_at("groq", ErrorClass::ProviderApiError, Some("m1"), None, t0());
        let (sel, _) = router.select_at(&[], &no_models(), t0()).unwrap();
        assert_eq!(sel.model, "m2");
    }

    #[test]
    fn test_success_clears_error_class() {
        let router = two_providers();
        router.mark_failure_at("groq", ErrorClass::AuthError, Some("g1"), None, t0());
        router.mark_success_at("groq", Some("g1"), t0());
        let snap = router.state_snapshot();
        let stat = &snap.providers["groq"];
        assert_eq!((stat.success_count, stat.fail_count), (1, 1));
        assert!(stat.last_error_class.is_none());
        assert!(snap.models.contains_key("groq::g1"));
    }

    #[test]
    fn test_sleep_plan() {
        let router = ProviderRouter::new(
            vec![
                endpoint("groq", Some("g"), &["g1"]),
                endpoint("openrouter", Some("o"), &["o1"]),
                endpoint("hf", None, &["h1"]),
            ],
            RouterMode::AdaptiveRr,
            600,
        );
        assert!(router.sleep_plan(t0(), 30).is_none());

        router.mark_exhausted_at("groq", ErrorClass::QuotaOrRateLimit, None, t0());
        // openrouter still ready
        assert!(router.sleep_plan(t0(), 30).is_none());

        let sooner = t0() + Duration::seconds(120);
        router.mark_failure_at("openrouter", ErrorClass::QuotaOrRateLimit, None, Some(sooner), t0());
        let plan = router.sleep_plan(t0(), 30).unwrap();
        assert_eq!(plan.wake_at, sooner + Duration::seconds(30));
        assert_eq!(plan.wait_secs, 150);
        assert_eq!(plan.providers, vec!["openrouter", "groq"]);
    }

    #[test]
    fn test_sleep_plan_without_credentials_is_none() {
        let router = ProviderRouter::new(
            vec![endpoint("groq", None, &["g1"])],
            RouterMode::AdaptiveRr,
            600,
        );
        assert!(router.sleep_plan(t0(), 30).is_none());
    }

    #[test]
    fn test_event_wire_format() {
        let event = RouterEvent::Selected {
            provider: "groq".into(),
            model: "g1".into(),
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "free_provider_selected");
        assert_eq!(RouterMode::parse("ORDERED"), RouterMode::Ordered);
        assert_eq!(RouterMode::parse("whatever"), RouterMode::AdaptiveRr);
    }
}

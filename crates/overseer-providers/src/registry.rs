//! Provider registry: maps provider names to endpoint configurations.
//!
//! Every backend is OpenAI-compatible; providers differ only by base URL,
//! where their credentials live and which models they serve for free.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Wire flavour spoken by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Plain OpenAI chat-completions API.
    OpenAi,
    /// OpenRouter (OpenAI-compatible with extra routing headers).
    OpenRouter,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::OpenAi => "openai",
            BackendKind::OpenRouter => "openrouter",
        }
    }
}

/// Static configuration for a known provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Provider identifier.
    pub name: &'static str,
    pub backend: BackendKind,
    /// Base URL; `{account_id}` is substituted from `account_env_keys`.
    pub base_url: &'static str,
    /// Environment variable names to try for the API key (in order).
    pub env_keys: &'static [&'static str],
    /// Environment variable names for an account id, when the URL needs one.
    pub account_env_keys: &'static [&'static str],
    /// Model pool used when no override is configured.
    pub default_models: &'static [&'static str],
}

// ─── Provider Definitions ────────────────────────────────────────────────────

static PROVIDERS: &[ProviderConfig] = &[
    ProviderConfig {
        name: "groq",
        backend: BackendKind::OpenAi,
        base_url: "https://api.groq.com/openai/v1",
        env_keys: &["OVERSEER_GROQ_API_KEY", "GROQ_API_KEY"],
        account_env_keys: &[],
        default_models: &["llama-3.1-8b-instant"],
    },
    ProviderConfig {
        name: "openrouter",
        backend: BackendKind::OpenRouter,
        base_url: "https://openrouter.ai/api/v1",
        env_keys: &["OVERSEER_OPENROUTER_API_KEY", "OPENROUTER_API_KEY"],
        account_env_keys: &[],
        default_models: &["meta-llama/llama-3.3-70b-instruct:free"],
    },
    ProviderConfig {
        name: "cloudflare",
        backend: BackendKind::OpenAi,
        base_url: "https://api.cloudflare.com/client/v4/accounts/{account_id}/ai/v1",
        env_keys: &["OVERSEER_CLOUDFLARE_API_TOKEN"],
        account_env_keys: &["OVERSEER_CLOUDFLARE_ACCOUNT_ID"],
        default_models: &["@cf/meta/llama-3.1-8b-instruct"],
    },
    ProviderConfig {
        name: "hf",
        backend: BackendKind::OpenAi,
        base_url: "https://router.huggingface.co/v1",
        env_keys: &["OVERSEER_HF_TOKEN", "HUGGINGFACEHUB_API_TOKEN"],
        account_env_keys: &[],
        default_models: &["openai/gpt-oss-20b"],
    },
];

/// Look up a provider config by name.
pub fn get_provider_config(name: &str) -> Option<&'static ProviderConfig> {
    let lookup = match name {
        "huggingface" => "hf",
        "cf" | "workers-ai" => "cloudflare",
        other => other,
    };
    PROVIDERS.iter().find(|p| p.name == lookup)
}

/// List all known provider names.
pub fn all_provider_names() -> Vec<&'static str> {
    PROVIDERS.iter().map(|p| p.name).collect()
}

/// A provider resolved at startup: where it lives, its credential (if any) and model pool.
#[derive(Debug, Clone)]
pub struct ProviderEndpoint {
    pub name: String,
    pub backend: BackendKind,
    pub base_url: String,
    /// `None` when no credential was found; the router treats the provider as unavailable.
    pub api_key: Option<String>,
    pub models: Vec<String>,
}

impl ProviderEndpoint {
    pub fn has_credentials(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }
}

/// Resolve endpoints for the configured order from the process environment.
pub fn resolve_endpoints(
    order: &[String],
    model_pools: &BTreeMap<String, Vec<String>>,
) -> Vec<ProviderEndpoint> {
    resolve_endpoints_with(order, model_pools, |key| std::env::var(key).ok())
}

/// Resolve endpoints using an arbitrary credential lookup.
///
/// Unknown provider names still produce an endpoint (without credentials or
/// models) so the router can report them as unavailable.
pub fn resolve_endpoints_with<F>(
    order: &[String],
    model_pools: &BTreeMap<String, Vec<String>>,
    lookup: F,
) -> Vec<ProviderEndpoint>
where
    F: Fn(&str) -> Option<String>,
{
    let first_set = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| lookup(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()))
    };

    order
        .iter()
        .map(|name| {
            let Some(registry) = get_provider_config(name) else {
                tracing::warn!("⚠️ Unknown provider in order: {name}");
                return ProviderEndpoint {
                    name: name.clone(),
                    backend: BackendKind::OpenAi,
                    base_url: String::new(),
                    api_key: None,
                    models: model_pools.get(name).map(|p| dedup_pool(p)).unwrap_or_default(),
                };
            };

            let mut api_key = first_set(registry.env_keys);
            let mut base_url = registry.base_url.to_string();
            if !registry.account_env_keys.is_empty() {
                match first_set(registry.account_env_keys) {
                    Some(account_id) => base_url = base_url.replace("{account_id}", &account_id),
                    // Token without an account id is not a usable credential.
                    None => api_key = None,
                }
            }

            let models = match model_pools.get(name) {
                Some(pool) if !pool.is_empty() => dedup_pool(pool),
                _ => registry.default_models.iter().map(|m| m.to_string()).collect(),
            };

            ProviderEndpoint {
                name: name.clone(),
                backend: registry.backend,
                base_url,
                api_key,
                models,
            }
        })
        .collect()
}

/// Trim, drop empties and de-duplicate while keeping first-seen order.
pub fn dedup_pool(pool: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(pool.len());
    for model in pool {
        let model = model.trim();
        if model.is_empty() || out.iter().any(|m| m == model) {
            continue;
        }
        out.push(model.to_string());
    }
    out
}

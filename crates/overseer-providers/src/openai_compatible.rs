//! OpenAI-compatible chat-completions client.
//!
//! One client serves every backend in the registry; they differ only by base
//! URL, key and model. Non-2xx answers become [`ProviderError`] with the
//! status kept so the router can classify them.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;

use crate::classify::ProviderError;
use crate::registry::BackendKind;
use crate::router::ProviderSelection;

/// One chat message in OpenAI wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// Parsed completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatCompletion {
    pub content: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Upstream-reported cost, when the backend sends one (OpenRouter does).
    pub cost_usd: f64,
    pub finish_reason: Option<String>,
}

/// HTTP client shared across selections.
#[derive(Clone)]
pub struct OpenAiCompatibleClient {
    client: reqwest::Client,
    max_tokens: u32,
}

impl Default for OpenAiCompatibleClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(120), 2048)
    }
}

impl OpenAiCompatibleClient {
    pub fn new(timeout: Duration, max_tokens: u32) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, max_tokens }
    }

    /// Send one chat-completions request to the selected backend.
    pub async fn chat(
        &self,
        selection: &ProviderSelection,
        messages: &[ChatMessage],
    ) -> Result<ChatCompletion, ProviderError> {
        if selection.api_key.is_empty() {
            return Err(ProviderError::new(
                Some(401),
                format!("{}: api key missing", selection.name),
            ));
        }

        let body = json!({
            "model": selection.model,
            "messages": messages,
            "max_tokens": self.max_tokens,
        });
        let url = format!("{}/chat/completions", selection.base_url.trim_end_matches('/'));

        let mut req = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", selection.api_key))
            .json(&body);
        if selection.backend == BackendKind::OpenRouter {
            req = req.header("X-Title", "overseer");
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            tracing::debug!("❌ {} API error {}: {}", selection.name, status, text);
            return Err(ProviderError::new(
                Some(status.as_u16()),
                format!("{} API error {}: {}", selection.name, status, text),
            ));
        }

        let json: Value = resp.json().await?;
        parse_completion(&json)
    }
}

/// Extract content and usage from a chat-completions response body.
pub fn parse_completion(json: &Value) -> Result<ChatCompletion, ProviderError> {
    if let Some(err) = json.get("error") {
        let message = err["message"].as_str().unwrap_or("unknown error").to_string();
        let status = err["code"].as_u64().and_then(|c| u16::try_from(c).ok());
        return Err(ProviderError::new(status, message));
    }

    let choice = json["choices"]
        .get(0)
        .ok_or_else(|| ProviderError::new(None, "No choices in response"))?;

    let usage = &json["usage"];
    Ok(ChatCompletion {
        content: choice["message"]["content"].as_str().unwrap_or("").to_string(),
        prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
        completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
        cost_usd: usage["cost"].as_f64().unwrap_or(0.0),
        finish_reason: choice["finish_reason"].as_str().map(String::from),
    })
}

//! Upstream error classification.
//!
//! Pure mapping from a failed backend call to a small fixed set of classes.
//! Only [`ErrorClass::QuotaOrRateLimit`] means "try the next provider".

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classified upstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    QuotaOrRateLimit,
    AuthError,
    PermissionError,
    NotFound,
    ProviderUpstreamError,
    ModelNotFound,
    ProviderApiError,
}

const QUOTA_MARKERS: &[&str] = &[
    "429",
    "rate limit",
    "ratelimit",
    "too many requests",
    "insufficient_quota",
    "quota",
    "credit",
    "credits",
    "neurons",
    "monthly included",
    "daily limit",
];

impl ErrorClass {
    /// Classify from an optional HTTP status and the error text.
    pub fn classify(status: Option<u16>, text: &str) -> Self {
        match status {
            Some(429) | Some(402) => return Self::QuotaOrRateLimit,
            Some(401) => return Self::AuthError,
            Some(403) => return Self::PermissionError,
            Some(404) => return Self::NotFound,
            Some(code) if code >= 500 => return Self::ProviderUpstreamError,
            _ => {}
        }

        let text = text.to_lowercase();
        if QUOTA_MARKERS.iter().any(|m| text.contains(m)) {
            return Self::QuotaOrRateLimit;
        }
        if text.contains("invalid api key") || text.contains("unauthorized") {
            return Self::AuthError;
        }
        if text.contains("model") && text.contains("not found") {
            return Self::ModelNotFound;
        }
        Self::ProviderApiError
    }

    /// Whether this class marks the provider as temporarily unusable.
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaOrRateLimit)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QuotaOrRateLimit => "quota_or_rate_limit",
            Self::AuthError => "auth_error",
            Self::PermissionError => "permission_error",
            Self::NotFound => "not_found",
            Self::ProviderUpstreamError => "provider_upstream_error",
            Self::ModelNotFound => "model_not_found",
            Self::ProviderApiError => "provider_api_error",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed backend call, as seen by the router.
#[derive(Debug, Clone, Error)]
#[error("{}provider error: {message}", .status.map(|s| format!("[{s}] ")).unwrap_or_default())]
pub struct ProviderError {
    /// HTTP status when the upstream answered at all.
    pub status: Option<u16>,
    pub message: String,
}

impl ProviderError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        ErrorClass::classify(self.status, &self.message)
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        Self {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

//! Provider Failover: retry a backend call on the next selection when the
//! current provider is out of quota.
//!
//! Only [`ErrorClass::QuotaOrRateLimit`] rotates; every other class stops the
//! attempt. Failures are collected as telemetry for the caller to report,
//! the router's statistics are not touched here beyond selection bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;

use crate::classify::{ErrorClass, ProviderError};
use crate::router::{ExhaustedError, ProviderRouter, ProviderSelection, RouterEvent};

/// One failed call, as reported back to the control loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderFailure {
    pub provider: String,
    pub model: String,
    pub error_class: ErrorClass,
    /// Set for quota failures: when the provider may be retried.
    pub cooldown_until: Option<DateTime<Utc>>,
    pub message: String,
}

/// Why the attempt ended without a result.
#[derive(Debug, thiserror::Error)]
pub enum FailoverError {
    #[error(transparent)]
    Exhausted(#[from] ExhaustedError),
    #[error("{provider}/{model}: {source}")]
    Provider {
        provider: String,
        model: String,
        #[source]
        source: ProviderError,
    },
}

impl FailoverError {
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            Self::Exhausted(_) => None,
            Self::Provider { source, .. } => Some(source.class()),
        }
    }
}

/// Result of one attempt plus everything observed along the way.
#[derive(Debug)]
pub struct FailoverOutcome<T> {
    pub result: Result<(T, ProviderSelection), FailoverError>,
    pub failures: Vec<ProviderFailure>,
    pub events: Vec<RouterEvent>,
}

impl<T> FailoverOutcome<T> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Select, call, and on quota failure retry with the next selection.
///
/// A quota failure excludes that model for the rest of the attempt, and the
/// provider as well once none of its models remain.
pub async fn run_with_failover<T, F, Fut>(router: &ProviderRouter, mut call: F) -> FailoverOutcome<T>
where
    F: FnMut(ProviderSelection) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut exclude: Vec<String> = Vec::new();
    let mut exclude_models: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut failures = Vec::new();
    let mut events = Vec::new();

    loop {
        let (selection, event) = match router.select(&exclude, &exclude_models) {
            Ok(picked) => picked,
            Err(e) => {
                return FailoverOutcome {
                    result: Err(e.into()),
                    failures,
                    events,
                };
            }
        };
        events.push(event);

        match call(selection.clone()).await {
            Ok(value) => {
                return FailoverOutcome {
                    result: Ok((value, selection)),
                    failures,
                    events,
                };
            }
            Err(err) => {
                let class = err.class();
                let cooldown_until = class
                    .is_quota()
                    .then(|| Utc::now() + router.cooldown_window());
                failures.push(ProviderFailure {
                    provider: selection.name.clone(),
                    model: selection.model.clone(),
                    error_class: class,
                    cooldown_until,
                    message: err.message.clone(),
                });

                if !class.is_quota() {
                    tracing::warn!(
                        "⚠️ Provider {} failed ({class}), not rotating: {}",
                        selection.name,
                        err
                    );
                    return FailoverOutcome {
                        result: Err(FailoverError::Provider {
                            provider: selection.name,
                            model: selection.model,
                            source: err,
                        }),
                        failures,
                        events,
                    };
                }

                tracing::info!(
                    "🔁 {}/{} out of quota, trying next provider",
                    selection.name,
                    selection.model
                );
                let blocked = exclude_models.entry(selection.name.clone()).or_default();
                blocked.push(selection.model.clone());
                let pool_spent = router
                    .endpoint(&selection.name)
                    .is_none_or(|ep| ep.models.iter().all(|m| blocked.contains(m)));
                if pool_spent {
                    exclude.push(selection.name);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{BackendKind, ProviderEndpoint};
    use crate::router::RouterMode;

    fn router() -> ProviderRouter {
        let ep = |name: &str, models: &[&str]| ProviderEndpoint {
            name: name.into(),
            backend: BackendKind::OpenAi,
            base_url: String::new(),
            api_key: Some("k".into()),
            models: models.iter().map(|m| m.to_string()).collect(),
        };
        ProviderRouter::new(
            vec![ep("groq", &["g1", "g2"]), ep("openrouter", &["o1"])],
            RouterMode::Ordered,
            600,
        )
    }

    #[tokio::test]
    async fn test_first_call_succeeds() {
        let router = router();
        let out = run_with_failover(&router, |sel| async move { Ok::<_, ProviderError>(sel.model) }).await;
        let (value, sel) = out.result.unwrap();
        assert_eq!(value, "g1");
        assert_eq!(sel.name, "groq");
        assert!(out.failures.is_empty());
        assert_eq!(out.events.len(), 1);
    }

    #[tokio::test]
    async fn test_quota_rotates_through_models_then_providers() {
        let router = router();
        let out = run_with_failover(&router, |sel| async move {
            if sel.name == "groq" {
                Err(ProviderError::new(Some(429), "too many requests"))
            } else {
                Ok(sel.model)
            }
        })
        .await;
        let (value, sel) = out.result.unwrap();
        assert_eq!(value, "o1");
        assert_eq!(sel.name, "openrouter");
        assert_eq!(out.failures.len(), 2);
        assert_eq!(out.failures[0].model, "g1");
        assert_eq!(out.failures[1].model, "g2");
        assert!(out.failures.iter().all(|f| f.cooldown_until.is_some()));
        assert_eq!(out.events.last().unwrap().kind(), "free_provider_switched");
    }

    #[tokio::test]
    async fn test_non_quota_error_stops() {
        let router = router();
        let out = run_with_failover(&router, |_| async {
            Err::<(), _>(ProviderError::new(Some(401), "bad key"))
        })
        .await;
        assert_eq!(out.failures.len(), 1);
        assert!(out.failures[0].cooldown_until.is_none());
        match out.result {
            Err(FailoverError::Provider { provider, .. }) => assert_eq!(provider, "groq"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_everything_out_of_quota_is_exhausted() {
        let router = router();
        let out = run_with_failover(&router, |_| async {
            Err::<(), _>(ProviderError::new(None, "daily limit reached"))
        })
        .await;
        assert_eq!(out.failures.len(), 3);
        match out.result {
            Err(FailoverError::Exhausted(e)) => {
                assert_eq!(e.exhausted, vec!["groq", "openrouter"]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}

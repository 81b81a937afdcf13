//! Ordered failover across provider bindings.
//!
//! A failover chain is an ordered sequence of `{provider, model}` pairs.
//! One call tries each binding in turn and stops at the first success.
//! Within a single pass the same provider is never tried twice; cross-pass
//! retries belong to the step-level retry policy.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::{CompletionRequest, CompletionResponse, ProviderError, ProviderRegistry};

/// One entry in a failover chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderBinding {
    pub provider: String,
    pub model: String,
}

/// Outcome of one attempt within a failover pass, kept for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub provider: String,
    pub model: String,
    pub elapsed: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Sequential failover over an ordered set of bindings.
pub struct FailoverChain<'a> {
    registry: &'a ProviderRegistry,
    bindings: &'a [ProviderBinding],
    /// Bounds each individual attempt. `None` leaves the provider's own
    /// transport timeout in charge.
    pub attempt_timeout: Option<Duration>,
}

impl<'a> FailoverChain<'a> {
    pub fn new(registry: &'a ProviderRegistry, bindings: &'a [ProviderBinding]) -> Self {
        Self {
            registry,
            bindings,
            attempt_timeout: None,
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Run one failover pass. Returns the first successful response along
    /// with the per-attempt records, or the last error once the chain is
    /// exhausted.
    pub async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> (Result<CompletionResponse, ProviderError>, Vec<AttemptRecord>) {
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut tried: HashSet<&str> = HashSet::new();
        let mut last_error: Option<ProviderError> = None;

        for binding in self.bindings {
            if !tried.insert(binding.provider.as_str()) {
                tracing::debug!(provider = %binding.provider, "skipping duplicate provider in failover pass");
                continue;
            }

            let provider = match self.registry.get(&binding.provider) {
                Ok(p) => p,
                Err(err) => {
                    attempts.push(AttemptRecord {
                        provider: binding.provider.clone(),
                        model: binding.model.clone(),
                        elapsed: Duration::ZERO,
                        error: Some(err.to_string()),
                    });
                    last_error = Some(err);
                    continue;
                }
            };

            let mut bound_request = request.clone();
            bound_request.model = binding.model.clone();

            let started = Instant::now();
            let result = match self.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, provider.complete(&bound_request)).await {
                    Ok(inner) => inner,
                    Err(_) => Err(ProviderError::Timeout {
                        provider: binding.provider.clone(),
                        elapsed: limit,
                    }),
                },
                None => provider.complete(&bound_request).await,
            };
            let elapsed = started.elapsed();

            match result {
                Ok(response) => {
                    attempts.push(AttemptRecord {
                        provider: binding.provider.clone(),
                        model: binding.model.clone(),
                        elapsed,
                        error: None,
                    });
                    return (Ok(response), attempts);
                }
                Err(err) => {
                    tracing::warn!(
                        provider = %binding.provider,
                        model = %binding.model,
                        error = %err,
                        "failover attempt failed"
                    );
                    attempts.push(AttemptRecord {
                        provider: binding.provider.clone(),
                        model: binding.model.clone(),
                        elapsed,
                        error: Some(err.to_string()),
                    });
                    last_error = Some(err);
                }
            }
        }

        let err = last_error.unwrap_or_else(|| ProviderError::Unknown("empty failover chain".into()));
        (Err(err), attempts)
    }
}

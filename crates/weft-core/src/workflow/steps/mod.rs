//! Step mode handlers.
//!
//! Each handler receives the merged execution context for its step and
//! returns the step's textual output. Handlers never write to the shared
//! variable store; the orchestrator captures their output at the step
//! boundary.

pub mod basic;
pub mod consensus;
pub mod for_each;
pub mod parallel;
pub mod template;
pub mod transform;

use std::time::Duration;

use crate::error::WeftError;
use crate::provider::ProviderBinding;
use crate::workflow::schema::ExecutionContext;

/// A fully-merged execution context, ready to drive a provider call.
#[derive(Debug, Clone)]
pub struct ResolvedExecution {
    /// Ordered failover chain (a single provider becomes a one-entry chain).
    pub bindings: Vec<ProviderBinding>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub timeout: Option<Duration>,
    /// `None` = every registered server, `Some([])` = no tools.
    pub servers: Option<Vec<String>>,
}

/// Merge execution layers, highest precedence first, and resolve the
/// provider bindings.
pub fn resolve_execution(layers: &[&ExecutionContext]) -> Result<ResolvedExecution, WeftError> {
    let merged = layers
        .iter()
        .rev()
        .fold(ExecutionContext::default(), |acc, layer| {
            layer.merged_over(&acc)
        });

    let bindings = if !merged.providers.is_empty() {
        merged
            .providers
            .iter()
            .map(|binding| ProviderBinding {
                provider: binding.provider.clone(),
                model: if binding.model.is_empty() {
                    merged.model.clone().unwrap_or_default()
                } else {
                    binding.model.clone()
                },
            })
            .collect()
    } else if let Some(provider) = &merged.provider {
        vec![ProviderBinding {
            provider: provider.clone(),
            model: merged.model.clone().unwrap_or_default(),
        }]
    } else {
        return Err(WeftError::WorkflowInvalid(
            "no provider configured at any level of the execution chain".into(),
        ));
    };

    Ok(ResolvedExecution {
        bindings,
        temperature: merged.temperature,
        max_tokens: merged.max_tokens,
        timeout: merged.timeout,
        servers: merged.servers,
    })
}

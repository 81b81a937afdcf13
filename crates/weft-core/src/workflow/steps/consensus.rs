//! Consensus voting across provider configurations.
//!
//! Every execution entry gets the same resolved prompt; responses are
//! normalized and grouped, and the quorum rule decides whether the step
//! succeeds. Tallying happens after all responders complete, in execution
//! order, so the result is deterministic regardless of arrival order.

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::resolve_execution;
use crate::error::WeftError;
use crate::provider::{ChatMessage, CompletionRequest, FailoverChain};
use crate::workflow::orchestrator::{cancellable, Engine};
use crate::workflow::resolver::VariableStore;
use crate::workflow::schema::{ConsensusSpec, Step, Workflow};

/// One provider's vote, kept in the structured consensus record.
#[derive(Debug, Clone, Serialize)]
struct Vote {
    provider: String,
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct ConsensusRecord<'a> {
    winner: Option<&'a str>,
    votes: &'a [Vote],
    agreement: f64,
    confidence: &'static str,
}

pub(crate) async fn run_consensus(
    engine: &Engine,
    spec: &ConsensusSpec,
    step: &Step,
    workflow: &Workflow,
    store: &VariableStore,
    cancel: &CancellationToken,
) -> Result<String, WeftError> {
    let prompt = store.resolve_string(&spec.prompt)?;

    let vote_futures = spec.executions.iter().map(|mode_local| {
        let prompt = prompt.clone();
        async move {
            let exec = match resolve_execution(&[mode_local, &step.execution, &workflow.execution])
            {
                Ok(exec) => exec,
                Err(err) => {
                    return Vote {
                        provider: mode_local.provider.clone().unwrap_or_default(),
                        model: mode_local.model.clone().unwrap_or_default(),
                        response: None,
                        error: Some(err.to_string()),
                    }
                }
            };

            let request = CompletionRequest {
                model: String::new(),
                messages: vec![ChatMessage::user(prompt)],
                system: None,
                tools: Vec::new(),
                temperature: exec.temperature,
                max_tokens: exec.max_tokens,
                stream: false,
            };

            let chain = FailoverChain::new(&engine.providers, &exec.bindings)
                .with_attempt_timeout(exec.timeout);
            let (result, _attempts) = chain.complete(&request).await;

            let (provider, model) = exec
                .bindings
                .first()
                .map(|b| (b.provider.clone(), b.model.clone()))
                .unwrap_or_default();
            match result {
                Ok(response) => Vote {
                    provider,
                    model,
                    response: Some(response.content),
                    error: None,
                },
                Err(err) => Vote {
                    provider,
                    model,
                    response: None,
                    error: Some(err.to_string()),
                },
            }
        }
    });

    let gather = futures::future::join_all(vote_futures);
    let votes: Vec<Vote> = match spec.timeout {
        Some(limit) => cancellable(cancel, async {
            tokio::time::timeout(limit, gather)
                .await
                .map_err(|_| WeftError::ConsensusTimeout(limit))
        })
        .await?,
        None => cancellable(cancel, async { Ok(gather.await) }).await?,
    };

    let total = votes.len();
    let responders = votes.iter().filter(|v| v.response.is_some()).count();
    let denominator = if spec.allow_partial { responders } else { total };

    // group by normalized answer, execution order; ties go to the earliest
    let mut groups: Vec<(String, usize, String)> = Vec::new();
    for vote in &votes {
        if let Some(response) = &vote.response {
            let norm = normalize(response);
            match groups.iter_mut().find(|(key, _, _)| key == &norm) {
                Some((_, count, _)) => *count += 1,
                None => groups.push((norm, 1, response.clone())),
            }
        }
    }
    let mut agree = 0usize;
    let mut winner: Option<String> = None;
    for (_, count, original) in &groups {
        if *count > agree {
            agree = *count;
            winner = Some(original.clone());
        }
    }

    let satisfied = spec.require.satisfied(agree, denominator);
    tracing::info!(
        agree,
        denominator,
        total,
        require = spec.require.as_str(),
        satisfied,
        "consensus tallied"
    );

    if !satisfied {
        return Err(WeftError::ConsensusUnmet {
            required: spec.require.as_str().to_string(),
            agree,
            total: denominator,
        });
    }

    let agreement = if denominator > 0 {
        agree as f64 / denominator as f64
    } else {
        0.0
    };
    let confidence = if agree == denominator { "high" } else { "good" };

    let record = ConsensusRecord {
        winner: winner.as_deref(),
        votes: &votes,
        agreement,
        confidence,
    };
    serde_json::to_string(&record).map_err(|e| {
        WeftError::WorkflowInvalid(format!("failed to serialize consensus record: {}", e))
    })
}

/// Trim, lowercase, strip surrounding quotes.
fn normalize(response: &str) -> String {
    let trimmed = response.trim().to_lowercase();
    let stripped = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| {
            trimmed
                .strip_prefix('\'')
                .and_then(|s| s.strip_suffix('\''))
        })
        .unwrap_or(&trimmed);
    stripped.to_string()
}

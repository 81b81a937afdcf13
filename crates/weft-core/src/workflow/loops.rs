//! Workflow-level loops: bounded, LLM-adjudicated repetition of a
//! sub-workflow.
//!
//! Each iteration re-enters the orchestrator with a fresh store seeded from
//! the loop's `with` map and the `loop.*` bindings, then a short
//! adjudication prompt asks the provider whether the `until` criterion is
//! satisfied. Iterations are strictly sequential.

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::orchestrator::{cancellable, Engine, LoopOutcome};
use super::resolver::{value_to_string, VariableStore};
use super::schema::{FailurePolicy, Loop, Workflow};
use super::steps::resolve_execution;
use crate::error::WeftError;
use crate::provider::{ChatMessage, CompletionRequest, FailoverChain};

const HISTORY_SEPARATOR: &str = "\n---\n";

pub(crate) async fn run_loop(
    engine: &Engine,
    lp: &Loop,
    workflow: &Workflow,
    store: &mut VariableStore,
    depth: usize,
    cancel: &CancellationToken,
) -> Result<LoopOutcome, WeftError> {
    let target = match engine.library.load(&lp.workflow) {
        Ok(target) => target,
        Err(err) => return fail(lp, 0, err, store),
    };

    let parent_stdin = store.get("stdin").map(value_to_string).unwrap_or_default();
    let mut history: Vec<String> = Vec::new();
    let mut last_output: Option<String> = None;
    let mut previous_output: Option<String> = None;
    let mut last_error: Option<String> = None;

    for iteration in 1..=lp.max_iterations {
        if cancel.is_cancelled() {
            return Err(WeftError::Cancelled);
        }

        let seed = iteration_seed(lp, iteration, &last_output, &previous_output, &history);

        let mut attempt = 0u32;
        let report = loop {
            let result = engine
                .run_inner(
                    &target,
                    parent_stdin.clone(),
                    seed.clone(),
                    depth + 1,
                    cancel.clone(),
                )
                .await;

            let message = match result {
                Ok(report) if report.success => break Ok(report),
                Ok(report) => report
                    .first_error()
                    .unwrap_or("no step succeeded")
                    .to_string(),
                Err(WeftError::Cancelled) => return Err(WeftError::Cancelled),
                Err(err) => err.to_string(),
            };

            if lp.on_failure == FailurePolicy::Retry && attempt < engine.config.loop_retry_cap {
                attempt += 1;
                tracing::warn!(
                    name = %lp.name,
                    iteration,
                    attempt,
                    error = %message,
                    "loop iteration failed, retrying"
                );
                continue;
            }
            break Err(message);
        };

        match report {
            Ok(report) => {
                let output = report.final_output.unwrap_or_default();
                previous_output = last_output.take();
                last_output = Some(output.clone());
                if lp.accumulate {
                    history.push(output.clone());
                } else {
                    history = vec![output.clone()];
                }

                if adjudicate(engine, lp, workflow, &output, &history, cancel).await? {
                    tracing::info!(name = %lp.name, iteration, "loop termination criterion met");
                    return finish(lp, iteration, false, last_output, None, store);
                }
            }
            Err(message) => {
                tracing::warn!(name = %lp.name, iteration, error = %message, "loop iteration failed");
                match lp.on_failure {
                    FailurePolicy::Halt => {
                        return Err(WeftError::LoopFailedHalt {
                            name: lp.name.clone(),
                            message,
                        })
                    }
                    // retry exhausted its cap above; both fall through to
                    // record-and-advance
                    FailurePolicy::Retry | FailurePolicy::Continue => {
                        last_error = Some(message);
                    }
                }
            }
        }
    }

    tracing::info!(
        name = %lp.name,
        max_iterations = lp.max_iterations,
        "loop exhausted without satisfying its criterion"
    );
    finish(lp, lp.max_iterations, true, last_output, last_error, store)
}

fn iteration_seed(
    lp: &Loop,
    iteration: u32,
    last_output: &Option<String>,
    previous_output: &Option<String>,
    history: &[String],
) -> Vec<(String, Value)> {
    let mut seed: Vec<(String, Value)> = lp
        .with
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let mut loop_obj = serde_json::Map::new();
    loop_obj.insert("iteration".into(), Value::from(iteration));
    if let Some(output) = last_output {
        loop_obj.insert("output".into(), Value::String(output.clone()));
    }
    if iteration > 1 {
        if let Some(previous) = previous_output {
            loop_obj.insert(
                "last".into(),
                serde_json::json!({ "output": previous }),
            );
        }
    }
    loop_obj.insert(
        "history".into(),
        Value::String(history.join(HISTORY_SEPARATOR)),
    );
    seed.push(("loop".into(), Value::Object(loop_obj)));
    seed
}

/// Ask the provider whether the `until` criterion holds. Anything other
/// than a clear yes keeps the loop going; adjudication failures are logged
/// and treated as "not yet".
async fn adjudicate(
    engine: &Engine,
    lp: &Loop,
    workflow: &Workflow,
    output: &str,
    history: &[String],
    cancel: &CancellationToken,
) -> Result<bool, WeftError> {
    let exec = match resolve_execution(&[&workflow.execution]) {
        Ok(exec) => exec,
        Err(err) => {
            tracing::warn!(name = %lp.name, error = %err, "no provider for loop adjudication");
            return Ok(false);
        }
    };

    let prompt = format!(
        "You are judging whether an iterative process has met its completion \
         criterion.\n\nCriterion: {}\n\nLatest output:\n{}\n\nAll outputs so \
         far:\n{}\n\nHas the criterion been met? Answer with a single word: \
         yes or no.",
        lp.until,
        output,
        history.join(HISTORY_SEPARATOR)
    );

    let request = CompletionRequest {
        model: String::new(),
        messages: vec![ChatMessage::user(prompt)],
        system: None,
        tools: Vec::new(),
        temperature: Some(0.0),
        max_tokens: Some(16),
        stream: false,
    };

    let chain =
        FailoverChain::new(&engine.providers, &exec.bindings).with_attempt_timeout(exec.timeout);
    let (result, _attempts) =
        cancellable(cancel, async { Ok(chain.complete(&request).await) }).await?;

    match result {
        Ok(response) => {
            let answer = response.content.trim().to_lowercase();
            Ok(answer.starts_with("yes"))
        }
        Err(err) => {
            tracing::warn!(name = %lp.name, error = %err, "adjudication call failed");
            Ok(false)
        }
    }
}

fn finish(
    lp: &Loop,
    iterations: u32,
    exhausted: bool,
    output: Option<String>,
    error: Option<String>,
    store: &mut VariableStore,
) -> Result<LoopOutcome, WeftError> {
    store.set(
        lp.name.clone(),
        serde_json::json!({
            "output": output,
            "iterations": iterations,
            "exhausted": exhausted,
        }),
    );
    Ok(LoopOutcome {
        name: lp.name.clone(),
        iterations,
        exhausted,
        output,
        error,
    })
}

fn fail(
    lp: &Loop,
    iterations: u32,
    err: WeftError,
    store: &mut VariableStore,
) -> Result<LoopOutcome, WeftError> {
    if lp.on_failure == FailurePolicy::Halt {
        return Err(WeftError::LoopFailedHalt {
            name: lp.name.clone(),
            message: err.to_string(),
        });
    }
    tracing::warn!(name = %lp.name, error = %err, "loop failed before running");
    store.set(lp.name.clone(), Value::Null);
    Ok(LoopOutcome {
        name: lp.name.clone(),
        iterations,
        exhausted: false,
        output: None,
        error: Some(err.to_string()),
    })
}

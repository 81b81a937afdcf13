//! Parallel fan-out over sub-steps.
//!
//! Each sub-step runs against its own clone of the variable store; results
//! come back through the join and are aggregated in declaration order, so
//! the shared store is never touched from a worker.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::WeftError;
use crate::workflow::orchestrator::Engine;
use crate::workflow::resolver::VariableStore;
use crate::workflow::schema::{Combine, ParallelSpec, Workflow};

pub(crate) async fn run_parallel(
    engine: &Engine,
    spec: &ParallelSpec,
    continue_on_error: bool,
    workflow: &Workflow,
    snapshot: &VariableStore,
    depth: usize,
    cancel: &CancellationToken,
) -> Result<String, WeftError> {
    let semaphore = (spec.max_concurrent > 0)
        .then(|| Arc::new(Semaphore::new(spec.max_concurrent)));

    let futures = spec.steps.iter().map(|sub| {
        let semaphore = semaphore.clone();
        let store = snapshot.clone();
        async move {
            let _permit = match &semaphore {
                Some(s) => s.acquire().await.ok(),
                None => None,
            };
            engine
                .execute_substep(sub, workflow, store, depth, cancel)
                .await
        }
    });

    // join_all preserves declaration order regardless of completion order
    let results = futures::future::join_all(futures).await;

    let mut outputs: Vec<String> = Vec::with_capacity(results.len());
    for (sub, result) in spec.steps.iter().zip(results) {
        match result {
            Ok(output) => outputs.push(output),
            Err(WeftError::Cancelled) => return Err(WeftError::Cancelled),
            Err(err) => {
                if continue_on_error {
                    tracing::warn!(substep = %sub.name, error = %err, "sub-step failed, keeping error marker");
                    outputs.push(format!("[error] {}", err));
                } else {
                    return Err(err);
                }
            }
        }
    }

    match spec.aggregate.combine {
        Combine::Merge => Ok(outputs.join("\n")),
        Combine::Array => Ok(serde_json::to_string(&outputs).unwrap_or_default()),
    }
}

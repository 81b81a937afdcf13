//! Template steps: run another workflow as a sub-step.
//!
//! The sub-workflow gets a fresh variable store seeded from
//! `template_input` (or the current stdin); execution inheritance does not
//! cross the workflow boundary. Nesting depth is bounded by the engine
//! config.

use tokio_util::sync::CancellationToken;

use crate::error::WeftError;
use crate::workflow::orchestrator::Engine;
use crate::workflow::resolver::{value_to_string, VariableStore};
use crate::workflow::schema::Workflow;

pub(crate) async fn run_template(
    engine: &Engine,
    target: &str,
    template_input: Option<&str>,
    _workflow: &Workflow,
    store: &VariableStore,
    depth: usize,
    cancel: &CancellationToken,
) -> Result<String, WeftError> {
    let sub = engine.library.load(target)?;

    let input = match template_input {
        Some(expr) => store.resolve_string(expr)?,
        None => store.get("stdin").map(value_to_string).unwrap_or_default(),
    };

    tracing::debug!(target, depth, "entering sub-workflow");
    let report = engine
        .run_inner(&sub, input, Vec::new(), depth + 1, cancel.clone())
        .await?;

    if !report.success {
        return Err(WeftError::SubWorkflowFailed {
            workflow: target.to_string(),
            message: report
                .first_error()
                .unwrap_or("no step succeeded")
                .to_string(),
        });
    }

    Ok(report.final_output.unwrap_or_default())
}

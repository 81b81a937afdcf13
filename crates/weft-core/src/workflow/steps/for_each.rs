//! Loop-item steps: run a prompt once per element of a sequence.

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{basic, resolve_execution};
use crate::error::WeftError;
use crate::workflow::orchestrator::{Engine, ModeOutput};
use crate::workflow::resolver::VariableStore;
use crate::workflow::schema::{FailurePolicy, Step, Workflow};

const DEFAULT_ITEM_NAME: &str = "item";

pub(crate) async fn run_for_each(
    engine: &Engine,
    step: &Step,
    expr: &str,
    run: &str,
    workflow: &Workflow,
    store: &mut VariableStore,
    cancel: &CancellationToken,
) -> Result<ModeOutput, WeftError> {
    let items = resolve_sequence(store, expr)?;
    let item_name = step.item_name.as_deref().unwrap_or(DEFAULT_ITEM_NAME);
    let continue_on_error = step
        .on_error
        .as_ref()
        .map(|e| e.on_failure == FailurePolicy::Continue)
        .unwrap_or(false);

    let exec = resolve_execution(&[&step.execution, &workflow.execution])?;
    let total = items.len();
    let mut outputs: Vec<Value> = Vec::with_capacity(total);
    let mut all_attempts = Vec::new();

    for (index, item) in items.into_iter().enumerate() {
        store.set(item_name, item);
        store.set("index", Value::from(index));
        store.set("first", Value::Bool(index == 0));
        store.set("last", Value::Bool(index + 1 == total));

        let result = async {
            let prompt = store.resolve_string(run)?;
            let system = step
                .system_prompt
                .as_deref()
                .map(|s| store.resolve_string(s))
                .transpose()?;
            basic::run_completion(engine, &exec, prompt, system, cancel).await
        }
        .await;

        match result {
            Ok(mode_output) => {
                all_attempts.extend(mode_output.attempts);
                outputs.push(Value::String(mode_output.output));
            }
            Err(WeftError::Cancelled) => {
                cleanup(store, item_name);
                return Err(WeftError::Cancelled);
            }
            Err(err) => {
                if continue_on_error {
                    tracing::warn!(step = %step.name, index, error = %err, "iteration failed, recording error entry");
                    outputs.push(serde_json::json!({ "error": err.to_string() }));
                } else {
                    cleanup(store, item_name);
                    return Err(err);
                }
            }
        }
    }

    cleanup(store, item_name);
    Ok(ModeOutput {
        output: serde_json::to_string(&outputs).unwrap_or_default(),
        attempts: all_attempts,
    })
}

/// Iteration variables are scoped to the loop body.
fn cleanup(store: &mut VariableStore, item_name: &str) {
    store.remove(item_name);
    store.remove("index");
    store.remove("first");
    store.remove("last");
}

/// Resolve the `for_each` expression to a sequence, parsing JSON strings
/// when needed. Accepts both `{{items}}` and bare `items` forms.
fn resolve_sequence(store: &VariableStore, expr: &str) -> Result<Vec<Value>, WeftError> {
    let inner = expr
        .trim()
        .strip_prefix("{{")
        .and_then(|s| s.strip_suffix("}}"))
        .unwrap_or(expr)
        .trim();

    let value = store.evaluate_expr(inner)?;
    let value = match value {
        Value::String(s) => serde_json::from_str::<Value>(&s)
            .unwrap_or(Value::String(s)),
        other => other,
    };

    match value {
        Value::Array(items) => Ok(items),
        other => Err(WeftError::ExpressionMalformed {
            expr: expr.to_string(),
            reason: format!(
                "for_each expects a sequence, found {}",
                type_name(&other)
            ),
        }),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_sequence_accepts_json_strings() {
        let mut store = VariableStore::new();
        store.set("items", json!([1, 2, 3]));
        store.set("encoded", json!("[\"a\", \"b\"]"));
        store.set("scalar", json!(7));

        assert_eq!(resolve_sequence(&store, "{{items}}").unwrap().len(), 3);
        assert_eq!(resolve_sequence(&store, "items").unwrap().len(), 3);
        assert_eq!(resolve_sequence(&store, "{{encoded}}").unwrap().len(), 2);
        assert!(matches!(
            resolve_sequence(&store, "{{scalar}}"),
            Err(WeftError::ExpressionMalformed { .. })
        ));
    }
}

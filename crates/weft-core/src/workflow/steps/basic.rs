//! Basic step execution: one completion loop with tool-call cycles.

use tokio_util::sync::CancellationToken;

use super::ResolvedExecution;
use crate::error::WeftError;
use crate::provider::{ChatMessage, CompletionRequest, FailoverChain};
use crate::tools::ToolManager;
use crate::workflow::orchestrator::{cancellable, Engine, ModeOutput};

/// Resolve tools, run the completion, and execute any tool calls the model
/// returns, feeding results back as tool-role messages. The cycle is
/// bounded by the engine's tool-iteration cap to prevent runaway loops.
pub(crate) async fn run_completion(
    engine: &Engine,
    exec: &ResolvedExecution,
    prompt: String,
    system: Option<String>,
    cancel: &CancellationToken,
) -> Result<ModeOutput, WeftError> {
    let view = engine.tools.view(exec.servers.as_deref());
    let tool_schemas = view.list_tools();

    let mut messages = vec![ChatMessage::user(prompt)];
    let mut all_attempts = Vec::new();
    let mut last_content = String::new();

    for iteration in 0..engine.config.tool_iteration_cap {
        let request = CompletionRequest {
            model: String::new(), // bound per failover entry
            messages: messages.clone(),
            system: system.clone(),
            tools: tool_schemas.clone(),
            temperature: exec.temperature,
            max_tokens: exec.max_tokens,
            stream: false,
        };

        let chain = FailoverChain::new(&engine.providers, &exec.bindings)
            .with_attempt_timeout(exec.timeout);
        let (result, attempts) =
            cancellable(cancel, async { Ok(chain.complete(&request).await) }).await?;
        all_attempts.extend(attempts);
        let response = result?;
        last_content = response.content.clone();

        if response.tool_calls.is_empty() {
            return Ok(ModeOutput {
                output: response.content,
                attempts: all_attempts,
            });
        }

        tracing::debug!(
            iteration,
            calls = response.tool_calls.len(),
            "executing tool calls"
        );
        messages.push(ChatMessage::assistant(
            response.content.clone(),
            response.tool_calls.clone(),
        ));
        for call in &response.tool_calls {
            let result_text = match cancellable(cancel, async {
                view.call(&call.name, call.arguments.clone())
                    .await
                    .map_err(WeftError::from)
            })
            .await
            {
                Ok(text) => text,
                Err(WeftError::Cancelled) => return Err(WeftError::Cancelled),
                Err(err) => {
                    tracing::warn!(tool = %call.name, error = %err, "tool call failed");
                    format!("Error: {}", err)
                }
            };
            messages.push(ChatMessage::tool_result(&call.id, result_text));
        }
    }

    tracing::warn!(
        cap = engine.config.tool_iteration_cap,
        "tool iteration cap reached, returning last content"
    );
    Ok(ModeOutput {
        output: last_content,
        attempts: all_attempts,
    })
}

//! End-to-end engine tests with scripted stub providers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use weft_core::provider::{
    CompletionRequest, CompletionResponse, Provider, ProviderError, ProviderRegistry, ToolCall,
};
use weft_core::tools::{ToolError, ToolManager, ToolRegistry, ToolSchema};
use weft_core::workflow::loader::load_workflow_str;
use weft_core::workflow::orchestrator::StepStatus;
use weft_core::{Engine, MemoryLibrary, WeftError};

type Handler =
    Box<dyn Fn(&CompletionRequest) -> Result<CompletionResponse, ProviderError> + Send + Sync>;

struct StubProvider {
    name: String,
    handler: Handler,
    requests: Mutex<Vec<CompletionRequest>>,
}

#[async_trait]
impl Provider for StubProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        self.requests.lock().unwrap().push(request.clone());
        (self.handler)(request)
    }
}

fn stub(
    name: &str,
    handler: impl Fn(&CompletionRequest) -> Result<CompletionResponse, ProviderError>
        + Send
        + Sync
        + 'static,
) -> Arc<StubProvider> {
    Arc::new(StubProvider {
        name: name.to_string(),
        handler: Box::new(handler),
        requests: Mutex::new(Vec::new()),
    })
}

fn text(content: &str) -> Result<CompletionResponse, ProviderError> {
    Ok(CompletionResponse {
        content: content.to_string(),
        model: "stub-model".to_string(),
        ..Default::default()
    })
}

fn last_user_prompt(request: &CompletionRequest) -> String {
    request
        .messages
        .iter()
        .rev()
        .find(|m| matches!(m.role, weft_core::provider::Role::User))
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

fn engine_with(providers: Vec<Arc<StubProvider>>) -> Engine {
    engine_full(providers, ToolRegistry::new(), MemoryLibrary::new())
}

fn engine_full(
    providers: Vec<Arc<StubProvider>>,
    tools: ToolRegistry,
    library: MemoryLibrary,
) -> Engine {
    let mut registry = ProviderRegistry::new();
    for p in providers {
        registry.register(p);
    }
    Engine::new(Arc::new(registry), tools, Arc::new(library))
}

// ─── scenario 1: simple pipeline ────────────────────────────────────────

#[tokio::test]
async fn simple_pipeline_threads_output_forward() {
    let provider = stub("p", |req| {
        let prompt = last_user_prompt(req);
        if prompt == "hello" {
            text("world")
        } else {
            text(&prompt)
        }
    });
    let engine = engine_with(vec![provider]);

    let wf = load_workflow_str(
        r#"
$schema: workflow/v2.0
name: pipeline
execution:
  provider: p
  model: stub-model
steps:
  - name: A
    run: "hello"
  - name: B
    needs: [A]
    run: "echo {{A}}"
"#,
    )
    .unwrap();

    let report = engine
        .run(&wf, "", CancellationToken::new())
        .await
        .unwrap();
    assert!(report.success);
    assert_eq!(report.final_output.as_deref(), Some("echo world"));
    assert_eq!(report.steps.len(), 2);
    assert_eq!(report.steps[0].name, "A");
    assert_eq!(report.steps[0].status, StepStatus::Success);
    assert_eq!(report.steps[1].name, "B");
    assert_eq!(report.steps[1].status, StepStatus::Success);
}

// ─── scenario 2: failover to the second provider ────────────────────────

#[tokio::test]
async fn failover_second_provider_succeeds() {
    let p1 = stub("p1", |_| {
        Err(ProviderError::RateLimit {
            provider: "p1".into(),
            retry_after: None,
        })
    });
    let p2 = stub("p2", |_| text("ok"));
    let p3 = stub("p3", |_| text("should not be reached"));
    let p3_handle = p3.clone();
    let engine = engine_with(vec![p1, p2, p3]);

    let wf = load_workflow_str(
        r#"
$schema: workflow/v2.0
name: failover
execution:
  providers:
    - provider: p1
      model: m1
    - provider: p2
      model: m2
    - provider: p3
      model: m3
steps:
  - name: only
    run: "go"
"#,
    )
    .unwrap();

    let report = engine
        .run(&wf, "", CancellationToken::new())
        .await
        .unwrap();
    assert!(report.success);
    assert_eq!(report.final_output.as_deref(), Some("ok"));

    // the record notes the failed first attempt, and p3 was never tried
    let attempts = &report.steps[0].attempts;
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].provider, "p1");
    assert!(attempts[0].error.is_some());
    assert_eq!(attempts[1].provider, "p2");
    assert!(attempts[1].error.is_none());
    assert!(p3_handle.requests.lock().unwrap().is_empty());
}

// ─── scenarios 3 & 4: consensus ─────────────────────────────────────────

fn consensus_workflow(require: &str) -> String {
    format!(
        r#"
$schema: workflow/v2.0
name: vote
execution:
  provider: a
  model: m
steps:
  - name: vote
    on_error:
      on_failure: continue
    consensus:
      prompt: "Approve?"
      require: {}
      executions:
        - provider: a
          model: m
        - provider: b
          model: m
        - provider: c
          model: m
  - name: after
    run: "saw:{{vote}}"
"#,
        require
    )
}

fn consensus_engine() -> Engine {
    engine_with(vec![
        // provider `a` also serves the follow-up step, which echoes
        stub("a", |req| {
            let prompt = last_user_prompt(req);
            if prompt == "Approve?" {
                text("YES")
            } else {
                text(&prompt)
            }
        }),
        stub("b", |_| text("YES")),
        stub("c", |_| text("NO")),
    ])
}

#[tokio::test]
async fn consensus_majority_passes() {
    let engine = consensus_engine();
    let wf = load_workflow_str(&consensus_workflow("majority")).unwrap();
    let report = engine
        .run(&wf, "", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.steps[0].status, StepStatus::Success);
    let record: Value =
        serde_json::from_str(report.steps[0].output.as_deref().unwrap()).unwrap();
    assert_eq!(record["winner"], "YES");
    assert!((record["agreement"].as_f64().unwrap() - 2.0 / 3.0).abs() < 1e-9);
    assert_eq!(record["confidence"], "good");
    assert_eq!(record["votes"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn consensus_unanimous_fails_and_continue_keeps_going() {
    let engine = consensus_engine();
    let wf = load_workflow_str(&consensus_workflow("unanimous")).unwrap();
    let report = engine
        .run(&wf, "", CancellationToken::new())
        .await
        .unwrap();

    assert!(!report.success);
    assert_eq!(report.steps[0].status, StepStatus::Failed);
    assert!(report.steps[0]
        .error
        .as_deref()
        .unwrap()
        .contains("consensus unmet"));

    // the workflow continued; the failed step's output resolved to null
    assert_eq!(report.steps[1].status, StepStatus::Success);
    assert_eq!(report.steps[1].output.as_deref(), Some("saw:"));
}

// ─── scenario 5: loop with LLM-evaluated exit ───────────────────────────

#[tokio::test]
async fn loop_terminates_when_adjudicator_says_yes() {
    let work_calls = Arc::new(AtomicU32::new(0));
    let adjudications = Arc::new(Mutex::new(Vec::<String>::new()));
    let work_calls_in = work_calls.clone();
    let adjudications_in = adjudications.clone();

    let provider = stub("p", move |req| {
        let prompt = last_user_prompt(req);
        if prompt.contains("completion") && prompt.contains("Criterion") {
            adjudications_in.lock().unwrap().push(prompt.clone());
            let yes = prompt.contains("Latest output:\npassing");
            text(if yes { "yes" } else { "no" })
        } else {
            let n = work_calls_in.fetch_add(1, Ordering::SeqCst);
            text(if n < 2 { "failing" } else { "passing" })
        }
    });

    let target = load_workflow_str(
        r#"
$schema: workflow/v2.0
name: test-pass
execution:
  provider: p
  model: m
steps:
  - name: attempt
    run: "run the tests"
"#,
    )
    .unwrap();
    let mut library = MemoryLibrary::new();
    library.insert(target);

    let engine = engine_full(vec![provider], ToolRegistry::new(), library);
    let wf = load_workflow_str(
        r#"
$schema: workflow/v2.0
name: fixer
execution:
  provider: p
  model: m
loops:
  - name: fix
    workflow: test-pass
    max_iterations: 3
    until: "All tests pass"
"#,
    )
    .unwrap();

    let report = engine
        .run(&wf, "", CancellationToken::new())
        .await
        .unwrap();
    assert!(report.success);

    let lp = &report.loops[0];
    assert_eq!(lp.iterations, 3);
    assert!(!lp.exhausted);
    assert_eq!(lp.output.as_deref(), Some("passing"));
    assert_eq!(report.final_output.as_deref(), Some("passing"));

    // the final adjudication saw the full history joined by the separator
    let prompts = adjudications.lock().unwrap();
    assert_eq!(prompts.len(), 3);
    assert!(prompts[2].contains("failing\n---\nfailing\n---\npassing"));
}

#[tokio::test]
async fn loop_exhausts_at_max_iterations() {
    let provider = stub("p", |req| {
        let prompt = last_user_prompt(req);
        if prompt.contains("Criterion") {
            text("no")
        } else {
            text("still failing")
        }
    });

    let target = load_workflow_str(
        r#"
$schema: workflow/v2.0
name: work
execution:
  provider: p
  model: m
steps:
  - name: attempt
    run: "try"
"#,
    )
    .unwrap();
    let mut library = MemoryLibrary::new();
    library.insert(target);

    let engine = engine_full(vec![provider], ToolRegistry::new(), library);
    let wf = load_workflow_str(
        r#"
$schema: workflow/v2.0
name: outer
execution:
  provider: p
  model: m
loops:
  - name: grind
    workflow: work
    max_iterations: 2
    until: "It works"
"#,
    )
    .unwrap();

    let report = engine
        .run(&wf, "", CancellationToken::new())
        .await
        .unwrap();
    let lp = &report.loops[0];
    assert_eq!(lp.iterations, 2);
    assert!(lp.exhausted);
    assert_eq!(lp.output.as_deref(), Some("still failing"));
}

// ─── dependency discipline ──────────────────────────────────────────────

#[tokio::test]
async fn skipped_dependency_satisfies_needs() {
    let provider = stub("p", |req| text(&last_user_prompt(req)));
    let engine = engine_with(vec![provider]);

    let wf = load_workflow_str(
        r#"
$schema: workflow/v2.0
name: skips
execution:
  provider: p
  model: m
steps:
  - name: gated
    if: "false"
    run: "never"
  - name: after
    needs: [gated]
    run: "ran anyway"
"#,
    )
    .unwrap();

    let report = engine
        .run(&wf, "", CancellationToken::new())
        .await
        .unwrap();
    assert!(report.success);
    assert_eq!(report.steps[0].status, StepStatus::Skipped);
    assert_eq!(report.steps[1].status, StepStatus::Success);
}

#[tokio::test]
async fn failed_dependency_blocks_dependent() {
    let provider = stub("p", |req| {
        let prompt = last_user_prompt(req);
        if prompt == "boom" {
            Err(ProviderError::Rejected {
                provider: "p".into(),
                status: 400,
                message: "bad".into(),
            })
        } else {
            text("fine")
        }
    });
    let engine = engine_with(vec![provider]);

    let wf = load_workflow_str(
        r#"
$schema: workflow/v2.0
name: blocked
execution:
  provider: p
  model: m
steps:
  - name: breaks
    on_error:
      on_failure: continue
    run: "boom"
  - name: dependent
    needs: [breaks]
    on_error:
      on_failure: continue
    run: "should not run"
"#,
    )
    .unwrap();

    let report = engine
        .run(&wf, "", CancellationToken::new())
        .await
        .unwrap();
    assert!(!report.success);
    assert_eq!(report.steps[1].status, StepStatus::Failed);
    assert!(report.steps[1]
        .error
        .as_deref()
        .unwrap()
        .contains("needs 'breaks'"));
}

// ─── inheritance (P2) ───────────────────────────────────────────────────

#[tokio::test]
async fn step_overrides_propagate_to_requests() {
    let provider = stub("p", |_| text("done"));
    let handle = provider.clone();
    let engine = engine_with(vec![provider]);

    let wf = load_workflow_str(
        r#"
$schema: workflow/v2.0
name: inherit
execution:
  provider: p
  model: m
  temperature: 0.3
  max_tokens: 100
steps:
  - name: default
    run: "a"
  - name: hot
    temperature: 0.9
    run: "b"
"#,
    )
    .unwrap();

    engine
        .run(&wf, "", CancellationToken::new())
        .await
        .unwrap();

    let requests = handle.requests.lock().unwrap();
    assert_eq!(requests[0].temperature, Some(0.3));
    assert_eq!(requests[0].max_tokens, Some(100));
    assert_eq!(requests[1].temperature, Some(0.9));
    assert_eq!(requests[1].max_tokens, Some(100));
}

// ─── parallel fan-out ───────────────────────────────────────────────────

#[tokio::test]
async fn parallel_collects_in_declaration_order() {
    let provider = stub("p", |req| {
        let prompt = last_user_prompt(req);
        text(&format!("r:{}", prompt))
    });
    let engine = engine_with(vec![provider]);

    let wf = load_workflow_str(
        r#"
$schema: workflow/v2.0
name: fan
execution:
  provider: p
  model: m
steps:
  - name: spread
    parallel:
      max_concurrent: 2
      steps:
        - name: one
          run: "1"
        - name: two
          run: "2"
        - name: three
          run: "3"
"#,
    )
    .unwrap();

    let report = engine
        .run(&wf, "", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        report.final_output.as_deref(),
        Some("[\"r:1\",\"r:2\",\"r:3\"]")
    );
}

#[tokio::test]
async fn parallel_merge_combines_with_newlines() {
    let provider = stub("p", |req| text(&last_user_prompt(req)));
    let engine = engine_with(vec![provider]);

    let wf = load_workflow_str(
        r#"
$schema: workflow/v2.0
name: fan
execution:
  provider: p
  model: m
steps:
  - name: spread
    parallel:
      aggregate:
        combine: merge
      steps:
        - name: one
          run: "alpha"
        - name: two
          run: "beta"
"#,
    )
    .unwrap();

    let report = engine
        .run(&wf, "", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.final_output.as_deref(), Some("alpha\nbeta"));
}

// ─── for_each ───────────────────────────────────────────────────────────

#[tokio::test]
async fn for_each_binds_iteration_variables() {
    let provider = stub("p", |req| text(&last_user_prompt(req)));
    let engine = engine_with(vec![provider]);

    let wf = load_workflow_str(
        r#"
$schema: workflow/v2.0
name: each
execution:
  provider: p
  model: m
steps:
  - name: walk
    for_each: "{{input_data}}"
    item_name: city
    run: "{{index}}:{{city}}:{{first}}:{{last}}"
"#,
    )
    .unwrap();

    let report = engine
        .run(&wf, "[\"oslo\", \"lima\"]", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        report.final_output.as_deref(),
        Some("[\"0:oslo:true:false\",\"1:lima:false:true\"]")
    );
}

// ─── template recursion ─────────────────────────────────────────────────

#[tokio::test]
async fn template_recursion_is_bounded() {
    let provider = stub("p", |_| text("x"));

    let recursive = load_workflow_str(
        r#"
$schema: workflow/v2.0
name: ouroboros
execution:
  provider: p
  model: m
steps:
  - name: again
    template: ouroboros
"#,
    )
    .unwrap();
    let mut library = MemoryLibrary::new();
    library.insert(recursive.clone());

    let engine = engine_full(vec![provider], ToolRegistry::new(), library);
    let report = engine
        .run(&recursive, "", CancellationToken::new())
        .await
        .unwrap();
    assert!(!report.success);
    assert!(report
        .first_error()
        .unwrap()
        .contains("recursion limit"));
}

#[tokio::test]
async fn template_output_becomes_step_output() {
    let provider = stub("p", |req| {
        let prompt = last_user_prompt(req);
        text(&format!("sub:{}", prompt))
    });

    let inner = load_workflow_str(
        r#"
$schema: workflow/v2.0
name: inner
execution:
  provider: p
  model: m
steps:
  - name: work
    run: "{{stdin}}"
"#,
    )
    .unwrap();
    let mut library = MemoryLibrary::new();
    library.insert(inner);

    let engine = engine_full(vec![provider], ToolRegistry::new(), library);
    let wf = load_workflow_str(
        r#"
$schema: workflow/v2.0
name: outer
execution:
  provider: p
  model: m
steps:
  - name: call
    template: inner
    template_input: "payload"
"#,
    )
    .unwrap();

    let report = engine
        .run(&wf, "", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.final_output.as_deref(), Some("sub:payload"));
}

// ─── retry ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn step_retry_recovers_from_transient_failure() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_in = calls.clone();
    let provider = stub("p", move |_| {
        if calls_in.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(ProviderError::Transport {
                provider: "p".into(),
                message: "connection reset".into(),
            })
        } else {
            text("recovered")
        }
    });
    let engine = engine_with(vec![provider]);

    let wf = load_workflow_str(
        r#"
$schema: workflow/v2.0
name: retry
execution:
  provider: p
  model: m
steps:
  - name: flaky
    on_error:
      on_failure: retry
      max_retries: 2
      initial_delay: "10ms"
    run: "go"
"#,
    )
    .unwrap();

    let report = engine
        .run(&wf, "", CancellationToken::new())
        .await
        .unwrap();
    assert!(report.success);
    assert_eq!(report.final_output.as_deref(), Some("recovered"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// ─── tool-call loop ─────────────────────────────────────────────────────

struct LookupTool;

#[async_trait]
impl ToolManager for LookupTool {
    fn list_tools(&self) -> Vec<ToolSchema> {
        vec![ToolSchema {
            name: "lookup".into(),
            description: "Look up a value".into(),
            parameters: serde_json::json!({"type": "object"}),
        }]
    }

    async fn call(&self, name: &str, arguments: Value) -> Result<String, ToolError> {
        if name == "lookup" {
            Ok(format!("looked-up:{}", arguments["q"].as_str().unwrap_or("")))
        } else {
            Err(ToolError::new(name, "unknown"))
        }
    }
}

#[tokio::test]
async fn tool_calls_feed_back_into_completion() {
    let provider = stub("p", |req| {
        let has_tool_result = req
            .messages
            .iter()
            .any(|m| matches!(m.role, weft_core::provider::Role::Tool));
        if has_tool_result {
            let result = req
                .messages
                .iter()
                .rev()
                .find(|m| matches!(m.role, weft_core::provider::Role::Tool))
                .map(|m| m.content.clone())
                .unwrap_or_default();
            text(&format!("final:{}", result))
        } else {
            Ok(CompletionResponse {
                content: String::new(),
                tool_calls: vec![ToolCall {
                    id: "c1".into(),
                    name: "lookup".into(),
                    arguments: serde_json::json!({"q": "answer"}),
                }],
                usage: None,
                model: "m".into(),
            })
        }
    });

    let mut tools = ToolRegistry::new();
    tools.register("search", Arc::new(LookupTool));
    let engine = engine_full(vec![provider], tools, MemoryLibrary::new());

    let wf = load_workflow_str(
        r#"
$schema: workflow/v2.0
name: tooling
execution:
  provider: p
  model: m
  servers: [search]
steps:
  - name: ask
    run: "what is the answer?"
"#,
    )
    .unwrap();

    let report = engine
        .run(&wf, "", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        report.final_output.as_deref(),
        Some("final:looked-up:answer")
    );
}

#[tokio::test]
async fn empty_servers_list_disables_tools() {
    let provider = stub("p", |req| {
        assert!(req.tools.is_empty());
        text("no tools")
    });

    let mut tools = ToolRegistry::new();
    tools.register("search", Arc::new(LookupTool));
    let engine = engine_full(vec![provider], tools, MemoryLibrary::new());

    let wf = load_workflow_str(
        r#"
$schema: workflow/v2.0
name: bare
execution:
  provider: p
  model: m
  servers: [search]
steps:
  - name: ask
    servers: []
    run: "hi"
"#,
    )
    .unwrap();

    let report = engine
        .run(&wf, "", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.final_output.as_deref(), Some("no tools"));
}

// ─── cancellation ───────────────────────────────────────────────────────

#[tokio::test]
async fn cancelled_token_stops_the_workflow() {
    let provider = stub("p", |_| text("never"));
    let engine = engine_with(vec![provider]);

    let wf = load_workflow_str(
        r#"
$schema: workflow/v2.0
name: cancelled
execution:
  provider: p
  model: m
steps:
  - name: a
    run: "x"
"#,
    )
    .unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let result = engine.run(&wf, "", token).await;
    assert!(matches!(result, Err(WeftError::Cancelled)));
}

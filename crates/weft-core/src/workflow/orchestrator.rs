//! Workflow orchestrator — drives a single workflow execution.
//!
//! The engine iterates steps in declared order, checks conditions and
//! dependencies, dispatches each step to its mode handler, and captures
//! outputs into the variable store at step boundaries. Parallel and
//! consensus handlers fan out internally but deliver results back here, so
//! the store is only ever mutated from the orchestrator's task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::loader::WorkflowLibrary;
use super::loops;
use super::resolver::VariableStore;
use super::schema::{ExecutionContext, FailurePolicy, OutputSpec, Step, StepMode, Workflow};
use super::steps::{self, basic, consensus, for_each, parallel, template, transform};
use crate::error::WeftError;
use crate::provider::{AttemptRecord, ProviderRegistry, RetryPolicy};
use crate::tools::ToolRegistry;

/// Engine-wide limits.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum `template` nesting depth.
    pub max_template_depth: usize,
    /// Cap on completion/tool-call cycles within one basic step.
    pub tool_iteration_cap: usize,
    /// Retry cap for a loop iteration under `on_failure: retry`.
    pub loop_retry_cap: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_template_depth: 8,
            tool_iteration_cap: 5,
            loop_retry_cap: 2,
        }
    }
}

/// Terminal state of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Skipped,
    Failed,
}

/// Per-step record in the workflow report.
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub name: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed: Duration,
    /// Provider attempts (failover passes included), for basic-like steps.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<AttemptRecord>,
}

/// Per-loop record in the workflow report.
#[derive(Debug, Clone, Serialize)]
pub struct LoopOutcome {
    pub name: String,
    pub iterations: u32,
    /// True when `max_iterations` ran out before `until` was satisfied.
    pub exhausted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Structured result of one workflow execution.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowReport {
    pub workflow: String,
    pub steps: Vec<StepOutcome>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub loops: Vec<LoopOutcome>,
    pub success: bool,
    pub elapsed: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_output: Option<String>,
}

impl WorkflowReport {
    pub fn first_error(&self) -> Option<&str> {
        self.steps
            .iter()
            .filter_map(|s| s.error.as_deref())
            .chain(self.loops.iter().filter_map(|l| l.error.as_deref()))
            .next()
    }
}

/// Output of one mode handler invocation.
pub(crate) struct ModeOutput {
    pub output: String,
    pub attempts: Vec<AttemptRecord>,
}

impl ModeOutput {
    pub fn plain(output: String) -> Self {
        Self {
            output,
            attempts: Vec::new(),
        }
    }
}

/// The workflow execution engine.
pub struct Engine {
    pub(crate) providers: Arc<ProviderRegistry>,
    pub(crate) tools: ToolRegistry,
    pub(crate) library: Arc<dyn WorkflowLibrary>,
    pub(crate) config: EngineConfig,
}

impl Engine {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        tools: ToolRegistry,
        library: Arc<dyn WorkflowLibrary>,
    ) -> Self {
        Self {
            providers,
            tools,
            library,
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Execute a workflow to completion (or cancellation).
    pub async fn run(
        &self,
        workflow: &Workflow,
        input: impl Into<String>,
        cancel: CancellationToken,
    ) -> Result<WorkflowReport, WeftError> {
        self.run_inner(workflow, input.into(), Vec::new(), 0, cancel)
            .await
    }

    /// Recursive entry point shared by `run`, template steps, and loops.
    pub(crate) fn run_inner<'a>(
        &'a self,
        workflow: &'a Workflow,
        input: String,
        seed: Vec<(String, Value)>,
        depth: usize,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<WorkflowReport, WeftError>> {
        async move {
            if depth > self.config.max_template_depth {
                return Err(WeftError::RecursionLimit {
                    workflow: workflow.name.clone(),
                    limit: self.config.max_template_depth,
                });
            }

            let started = Instant::now();
            tracing::info!(workflow = %workflow.name, depth, "workflow started");

            let mut store = seed_store(workflow, &input);
            for (name, value) in seed {
                store.set(name, value);
            }

            let mut executed: HashMap<String, StepStatus> = HashMap::new();
            let mut outcomes: Vec<StepOutcome> = Vec::new();
            let mut loop_outcomes: Vec<LoopOutcome> = Vec::new();
            let mut final_output: Option<String> = None;
            let mut success = true;

            for step in &workflow.steps {
                if cancel.is_cancelled() {
                    return Err(WeftError::Cancelled);
                }

                let outcome = self
                    .run_step(step, workflow, &mut store, &executed, depth, &cancel)
                    .await?;

                executed.insert(step.name.clone(), outcome.status);
                match outcome.status {
                    StepStatus::Success => {
                        final_output = outcome.output.clone();
                    }
                    StepStatus::Skipped => {}
                    StepStatus::Failed => {
                        success = false;
                        let halts = step
                            .on_error
                            .as_ref()
                            .map(|e| e.on_failure != FailurePolicy::Continue)
                            .unwrap_or(true);
                        if halts {
                            tracing::warn!(
                                workflow = %workflow.name,
                                step = %step.name,
                                "step failed, halting workflow"
                            );
                            outcomes.push(outcome);
                            return Ok(WorkflowReport {
                                workflow: workflow.name.clone(),
                                steps: outcomes,
                                loops: loop_outcomes,
                                success: false,
                                elapsed: started.elapsed(),
                                final_output,
                            });
                        }
                        // continue: the failure is recorded; the step's
                        // output slot stays null
                        store.set(step.name.clone(), Value::Null);
                    }
                }
                outcomes.push(outcome);
            }

            for lp in &workflow.loops {
                if cancel.is_cancelled() {
                    return Err(WeftError::Cancelled);
                }
                let outcome =
                    loops::run_loop(self, lp, workflow, &mut store, depth, &cancel).await?;
                if outcome.error.is_some() {
                    success = false;
                }
                if let Some(output) = &outcome.output {
                    final_output = Some(output.clone());
                }
                loop_outcomes.push(outcome);
            }

            let report = WorkflowReport {
                workflow: workflow.name.clone(),
                steps: outcomes,
                loops: loop_outcomes,
                success,
                elapsed: started.elapsed(),
                final_output,
            };
            tracing::info!(
                workflow = %workflow.name,
                success = report.success,
                elapsed = ?report.elapsed,
                "workflow finished"
            );
            Ok(report)
        }
        .boxed()
    }

    /// Run one step through condition, dependency, dispatch, retry, and
    /// output capture. Only `Cancelled` escapes as a hard error.
    async fn run_step(
        &self,
        step: &Step,
        workflow: &Workflow,
        store: &mut VariableStore,
        executed: &HashMap<String, StepStatus>,
        depth: usize,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, WeftError> {
        let started = Instant::now();

        // 1. condition
        if let Some(condition) = &step.condition {
            match store.evaluate_condition(condition) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(step = %step.name, "skipped (condition not met)");
                    return Ok(StepOutcome {
                        name: step.name.clone(),
                        status: StepStatus::Skipped,
                        output: None,
                        error: None,
                        elapsed: started.elapsed(),
                        attempts: Vec::new(),
                    });
                }
                Err(err) => {
                    return Ok(self.failed_outcome(step, err, started, Vec::new()));
                }
            }
        }

        // 2. dependencies: every listed step must have terminated without
        // failing (skips satisfy)
        for dep in &step.needs {
            let satisfied = matches!(
                executed.get(dep),
                Some(StepStatus::Success) | Some(StepStatus::Skipped)
            );
            if !satisfied {
                let err = WeftError::DependencyNotSatisfied {
                    step: step.name.clone(),
                    dependency: dep.clone(),
                };
                return Ok(self.failed_outcome(step, err, started, Vec::new()));
            }
        }

        // 3/4/5. dispatch with step-level retry
        let on_error = step.on_error.clone().unwrap_or_default();
        let retries = if on_error.on_failure == FailurePolicy::Retry {
            on_error.max_retries
        } else {
            0
        };
        let retry_policy = RetryPolicy::new(
            on_error.max_retries,
            on_error.retry_backoff,
            on_error.initial_delay.unwrap_or(Duration::from_secs(1)),
        );

        let mut attempts_log: Vec<AttemptRecord> = Vec::new();
        let mut attempt = 0u32;
        loop {
            match self
                .execute_mode(step, workflow, store, depth, cancel)
                .await
            {
                Ok(mode_output) => {
                    attempts_log.extend(mode_output.attempts);
                    if let Err(err) = record_output(step, &mode_output.output, store) {
                        return Ok(self.failed_outcome(step, err, started, attempts_log));
                    }
                    tracing::debug!(step = %step.name, elapsed = ?started.elapsed(), "step succeeded");
                    return Ok(StepOutcome {
                        name: step.name.clone(),
                        status: StepStatus::Success,
                        output: Some(mode_output.output),
                        error: None,
                        elapsed: started.elapsed(),
                        attempts: attempts_log,
                    });
                }
                Err(WeftError::Cancelled) => return Err(WeftError::Cancelled),
                Err(err) => {
                    attempt += 1;
                    if attempt <= retries {
                        let delay = retry_policy.delay_for(attempt);
                        tracing::warn!(
                            step = %step.name,
                            attempt,
                            ?delay,
                            error = %err,
                            "step failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Ok(self.failed_outcome(step, err, started, attempts_log));
                }
            }
        }
    }

    fn failed_outcome(
        &self,
        step: &Step,
        err: WeftError,
        started: Instant,
        attempts: Vec<AttemptRecord>,
    ) -> StepOutcome {
        tracing::warn!(step = %step.name, error = %err, "step failed");
        StepOutcome {
            name: step.name.clone(),
            status: StepStatus::Failed,
            output: None,
            error: Some(err.to_string()),
            elapsed: started.elapsed(),
            attempts,
        }
    }

    /// Dispatch a step to its mode handler.
    pub(crate) fn execute_mode<'a>(
        &'a self,
        step: &'a Step,
        workflow: &'a Workflow,
        store: &'a mut VariableStore,
        depth: usize,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<ModeOutput, WeftError>> {
        async move {
            let mode = step.mode().ok_or_else(|| {
                WeftError::WorkflowInvalid(format!("step '{}' has no valid mode", step.name))
            })?;

            match mode {
                StepMode::Basic { run } => {
                    let exec =
                        steps::resolve_execution(&[&step.execution, &workflow.execution])?;
                    let prompt = store.resolve_string(run)?;
                    let system = step
                        .system_prompt
                        .as_deref()
                        .map(|s| store.resolve_string(s))
                        .transpose()?;
                    basic::run_completion(self, &exec, prompt, system, cancel).await
                }
                StepMode::Parallel(spec) => {
                    let continue_on_error = step
                        .on_error
                        .as_ref()
                        .map(|e| e.on_failure == FailurePolicy::Continue)
                        .unwrap_or(false);
                    let snapshot = store.clone();
                    parallel::run_parallel(
                        self,
                        spec,
                        continue_on_error,
                        workflow,
                        &snapshot,
                        depth,
                        cancel,
                    )
                    .await
                    .map(ModeOutput::plain)
                }
                StepMode::ForEach { for_each: expr, run } => {
                    for_each::run_for_each(self, step, expr, run, workflow, store, cancel).await
                }
                StepMode::Consensus(spec) => {
                    consensus::run_consensus(self, spec, step, workflow, store, cancel)
                        .await
                        .map(ModeOutput::plain)
                }
                StepMode::Template { workflow: target } => template::run_template(
                    self,
                    target,
                    step.template_input.as_deref(),
                    workflow,
                    store,
                    depth,
                    cancel,
                )
                .await
                .map(ModeOutput::plain),
                StepMode::Transform(spec) => {
                    transform::run_transform(spec, store).map(ModeOutput::plain)
                }
                StepMode::Use { definition } => {
                    let def = workflow.step_definitions.get(definition).ok_or_else(|| {
                        WeftError::WorkflowInvalid(format!(
                            "step '{}' uses undeclared definition '{}'",
                            step.name, definition
                        ))
                    })?;

                    for (name, value) in &step.inputs {
                        let resolved = store.resolve_string(value)?;
                        store.set(name.clone(), Value::String(resolved));
                    }

                    let def_ctx = ExecutionContext {
                        servers: def.servers.clone(),
                        temperature: def.temperature,
                        ..Default::default()
                    };
                    let exec = steps::resolve_execution(&[
                        &def_ctx,
                        &step.execution,
                        &workflow.execution,
                    ])?;
                    let prompt = store.resolve_string(&def.prompt)?;
                    let system = def
                        .system_prompt
                        .as_deref()
                        .map(|s| store.resolve_string(s))
                        .transpose()?;
                    basic::run_completion(self, &exec, prompt, system, cancel).await
                }
            }
        }
        .boxed()
    }

    /// Execute a parallel sub-step against its own store clone; used by the
    /// parallel handler. The sub-step's `if` is honored, `needs` is not
    /// meaningful inside a fan-out.
    pub(crate) async fn execute_substep(
        &self,
        sub: &Step,
        workflow: &Workflow,
        mut store: VariableStore,
        depth: usize,
        cancel: &CancellationToken,
    ) -> Result<String, WeftError> {
        if let Some(condition) = &sub.condition {
            if !store.evaluate_condition(condition)? {
                return Ok(String::new());
            }
        }
        let output = self
            .execute_mode(sub, workflow, &mut store, depth, cancel)
            .await?;
        Ok(output.output)
    }
}

/// Seed the store with built-ins and the workflow input.
fn seed_store(workflow: &Workflow, input: &str) -> VariableStore {
    let mut store = VariableStore::new();
    store.set("stdin", Value::String(input.to_string()));
    store.set(
        "input_data",
        serde_json::from_str::<Value>(input).unwrap_or_else(|_| Value::String(input.to_string())),
    );
    store.set(
        "template",
        serde_json::json!({
            "name": workflow.name,
            "version": workflow.version,
        }),
    );
    store.set(
        "execution",
        serde_json::json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }),
    );
    store
}

/// Store a step's output under its name and its declared `output` binding.
fn record_output(step: &Step, output: &str, store: &mut VariableStore) -> Result<(), WeftError> {
    store.set(step.name.clone(), Value::String(output.to_string()));

    match &step.output {
        None => {}
        Some(OutputSpec::Name(name)) => {
            store.set(name.clone(), Value::String(output.to_string()));
        }
        Some(OutputSpec::Fields(fields)) => {
            // each field extracts from the output parsed as JSON, bound as
            // `output`; an extraction that fails binds the full output
            let parsed = serde_json::from_str::<Value>(output)
                .unwrap_or_else(|_| Value::String(output.to_string()));
            let mut scope = store.clone();
            scope.set("output", parsed);
            for (field, expr) in fields {
                let value = match scope.resolve_string(expr) {
                    Ok(resolved) => Value::String(resolved),
                    Err(err) => {
                        tracing::debug!(
                            step = %step.name,
                            field = %field,
                            error = %err,
                            "output extraction failed, binding full output"
                        );
                        Value::String(output.to_string())
                    }
                };
                store.set(field.clone(), value);
            }
        }
    }
    Ok(())
}

/// Race a future against the cancellation token.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl std::future::Future<Output = Result<T, WeftError>>,
) -> Result<T, WeftError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(WeftError::Cancelled),
        result = fut => result,
    }
}

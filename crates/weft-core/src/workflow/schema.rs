//! YAML schema types for workflow definitions (schema `workflow/v2.0`).
//!
//! ```yaml
//! $schema: workflow/v2.0
//! name: triage
//! version: "1.2"
//!
//! execution:
//!   provider: anthropic
//!   model: claude-sonnet-4-20250514
//!   temperature: 0.2
//!   timeout: "60s"
//!   servers: [search]
//!
//! steps:
//!   - name: classify
//!     run: "Classify this report: {{stdin}}"
//!   - name: escalate
//!     needs: [classify]
//!     if: "{{classify}} == 'urgent'"
//!     run: "Draft an escalation for: {{stdin}}"
//! ```
//!
//! Exactly one mode discriminator is allowed per step: `run`, `parallel`,
//! `for_each`, `consensus`, `template`, `transform`, or `use`.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::provider::{Backoff, ProviderBinding};
use crate::util::duration_opt;

/// The exact schema literal a v2 workflow must carry.
pub const SCHEMA_V2: &str = "workflow/v2.0";

/// Top-level workflow document. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Must equal [`SCHEMA_V2`] exactly; the loader rejects anything else.
    #[serde(rename = "$schema", default)]
    pub schema: String,

    pub name: String,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Default execution context inherited by every step.
    #[serde(default)]
    pub execution: ExecutionContext,

    /// Environment passed to sub-processes (sandbox runs).
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Step library files merged into `step_definitions`.
    #[serde(default)]
    pub includes: Vec<String>,

    #[serde(default)]
    pub steps: Vec<Step>,

    #[serde(default)]
    pub loops: Vec<Loop>,

    #[serde(default)]
    pub step_definitions: HashMap<String, StepDefinition>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Workflow {
    /// Parse a workflow from a YAML string. Validation is the loader's job.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }
}

/// Execution settings at any level of the inheritance chain.
///
/// Precedence, highest first: mode-local → step → workflow → built-ins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Ordered failover chain; takes precedence over `provider` when set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub providers: Vec<ProviderBinding>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default, with = "duration_opt", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    /// Tool servers visible to the step. `None` inherits; `Some([])`
    /// disables tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servers: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<LogLevel>,
}

impl ExecutionContext {
    pub fn is_empty(&self) -> bool {
        self.provider.is_none()
            && self.providers.is_empty()
            && self.model.is_none()
            && self.temperature.is_none()
            && self.max_tokens.is_none()
            && self.timeout.is_none()
            && self.servers.is_none()
            && self.logging.is_none()
    }

    /// Overlay `self` (higher precedence) onto `base`.
    ///
    /// `provider`/`providers` move as a pair: setting either at a higher
    /// level replaces both below it.
    pub fn merged_over(&self, base: &ExecutionContext) -> ExecutionContext {
        let mut merged = base.clone();
        if self.provider.is_some() || !self.providers.is_empty() {
            merged.provider = self.provider.clone();
            merged.providers = self.providers.clone();
        }
        if self.model.is_some() {
            merged.model = self.model.clone();
        }
        if self.temperature.is_some() {
            merged.temperature = self.temperature;
        }
        if self.max_tokens.is_some() {
            merged.max_tokens = self.max_tokens;
        }
        if self.timeout.is_some() {
            merged.timeout = self.timeout;
        }
        if self.servers.is_some() {
            merged.servers = self.servers.clone();
        }
        if self.logging.is_some() {
            merged.logging = self.logging;
        }
        merged
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Quiet,
    Normal,
    Verbose,
}

/// What to do when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Abort the workflow (step default).
    #[default]
    Halt,
    /// Record the failure and proceed.
    Continue,
    /// Re-run with backoff, bounded by `max_retries`.
    Retry,
}

/// Step-level error policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnError {
    #[serde(default)]
    pub on_failure: FailurePolicy,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default)]
    pub retry_backoff: Backoff,

    #[serde(default = "default_initial_delay", with = "duration_opt")]
    pub initial_delay: Option<Duration>,
}

fn default_max_retries() -> u32 {
    2
}

fn default_initial_delay() -> Option<Duration> {
    Some(Duration::from_secs(1))
}

impl Default for OnError {
    fn default() -> Self {
        Self {
            on_failure: FailurePolicy::Halt,
            max_retries: default_max_retries(),
            retry_backoff: Backoff::default(),
            initial_delay: default_initial_delay(),
        }
    }
}

/// Where a step's output lands in the variable store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputSpec {
    /// Store the full output under this name.
    Name(String),
    /// Bind each field; values are `{{expr}}` extractions evaluated against
    /// the output parsed as JSON, falling back to the full output.
    Fields(std::collections::BTreeMap<String, String>),
}

/// A single workflow step. Exactly one mode discriminator must be present;
/// the loader enforces exclusivity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,

    #[serde(default)]
    pub needs: Vec<String>,

    #[serde(default, rename = "if")]
    pub condition: Option<String>,

    #[serde(default)]
    pub on_error: Option<OnError>,

    #[serde(default)]
    pub output: Option<OutputSpec>,

    /// Step-level execution overrides (provider, model, temperature, ...).
    #[serde(flatten)]
    pub execution: ExecutionContext,

    // ─── mode discriminators ────────────────────────────────────────────
    /// Basic completion prompt.
    #[serde(default)]
    pub run: Option<String>,

    #[serde(default)]
    pub system_prompt: Option<String>,

    #[serde(default)]
    pub parallel: Option<ParallelSpec>,

    /// Expression resolving to a sequence; each element runs `run`.
    #[serde(default)]
    pub for_each: Option<String>,

    #[serde(default)]
    pub item_name: Option<String>,

    #[serde(default)]
    pub consensus: Option<ConsensusSpec>,

    /// Name of a sub-workflow to execute.
    #[serde(default)]
    pub template: Option<String>,

    #[serde(default)]
    pub template_input: Option<String>,

    #[serde(default)]
    pub transform: Option<TransformSpec>,

    /// Name of a reusable step definition.
    #[serde(default, rename = "use")]
    pub use_definition: Option<String>,

    #[serde(default)]
    pub inputs: HashMap<String, String>,
}

/// Borrowed view of a step's mode, for dispatch.
#[derive(Debug)]
pub enum StepMode<'a> {
    Basic { run: &'a str },
    Parallel(&'a ParallelSpec),
    ForEach { for_each: &'a str, run: &'a str },
    Consensus(&'a ConsensusSpec),
    Template { workflow: &'a str },
    Transform(&'a TransformSpec),
    Use { definition: &'a str },
}

impl Step {
    /// Names of the mode discriminators present on this step.
    pub fn present_modes(&self) -> Vec<&'static str> {
        let mut present = Vec::new();
        // `run` doubles as the body of `for_each`, so it only counts as the
        // basic discriminator when `for_each` is absent.
        if self.run.is_some() && self.for_each.is_none() {
            present.push("run");
        }
        if self.parallel.is_some() {
            present.push("parallel");
        }
        if self.for_each.is_some() {
            present.push("for_each");
        }
        if self.consensus.is_some() {
            present.push("consensus");
        }
        if self.template.is_some() {
            present.push("template");
        }
        if self.transform.is_some() {
            present.push("transform");
        }
        if self.use_definition.is_some() {
            present.push("use");
        }
        present
    }

    /// The step's mode, if exactly one discriminator is present.
    pub fn mode(&self) -> Option<StepMode<'_>> {
        match self.present_modes().as_slice() {
            ["run"] => self.run.as_deref().map(|run| StepMode::Basic { run }),
            ["parallel"] => self.parallel.as_ref().map(StepMode::Parallel),
            ["for_each"] => match (self.for_each.as_deref(), self.run.as_deref()) {
                (Some(for_each), Some(run)) => Some(StepMode::ForEach { for_each, run }),
                _ => None,
            },
            ["consensus"] => self.consensus.as_ref().map(StepMode::Consensus),
            ["template"] => self
                .template
                .as_deref()
                .map(|workflow| StepMode::Template { workflow }),
            ["transform"] => self.transform.as_ref().map(StepMode::Transform),
            ["use"] => self
                .use_definition
                .as_deref()
                .map(|definition| StepMode::Use { definition }),
            _ => None,
        }
    }
}

/// Fan-out over sub-steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelSpec {
    /// 0 (or absent) means unbounded.
    #[serde(default)]
    pub max_concurrent: usize,

    #[serde(default)]
    pub aggregate: AggregateSpec,

    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateSpec {
    #[serde(default)]
    pub combine: Combine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Combine {
    /// JSON sequence of outputs (default).
    #[default]
    Array,
    /// Newline-joined concatenation.
    Merge,
}

/// Quorum rule for consensus steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quorum {
    #[serde(rename = "unanimous")]
    Unanimous,
    #[serde(rename = "2/3")]
    TwoThirds,
    #[serde(rename = "majority")]
    Majority,
}

impl Quorum {
    pub fn satisfied(self, agree: usize, total: usize) -> bool {
        if total == 0 {
            return false;
        }
        match self {
            Quorum::Unanimous => agree == total,
            Quorum::Majority => 2 * agree > total,
            Quorum::TwoThirds => 3 * agree >= 2 * total,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Quorum::Unanimous => "unanimous",
            Quorum::TwoThirds => "2/3",
            Quorum::Majority => "majority",
        }
    }
}

/// Consensus voting across provider configurations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusSpec {
    pub prompt: String,

    /// Bounds the whole consensus operation.
    #[serde(default, with = "duration_opt")]
    pub timeout: Option<Duration>,

    /// Excuse non-responders from the denominator.
    #[serde(default)]
    pub allow_partial: bool,

    pub require: Quorum,

    /// Per-vote execution contexts, each inheriting from the step.
    pub executions: Vec<ExecutionContext>,
}

/// Data pipeline over a resolved input value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformSpec {
    pub input: String,
    pub operations: Vec<TransformOp>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformOp {
    Filter {
        condition: String,
    },
    Map {
        fields: Vec<String>,
    },
    Sort {
        #[serde(alias = "by")]
        key: String,
        #[serde(default)]
        desc: bool,
    },
    Limit {
        count: usize,
    },
    Pluck {
        key: String,
    },
    Group {
        key: String,
    },
}

/// A reusable step template declared in `step_definitions` or an include.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub prompt: String,

    #[serde(default)]
    pub system_prompt: Option<String>,

    #[serde(default)]
    pub servers: Option<Vec<String>>,

    #[serde(default)]
    pub temperature: Option<f64>,
}

/// A workflow-level loop: LLM-adjudicated repetition of a sub-workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Loop {
    pub name: String,

    /// Target workflow, resolved through the workflow library.
    pub workflow: String,

    /// Initial variables seeded into every iteration.
    #[serde(default)]
    pub with: HashMap<String, serde_json::Value>,

    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Natural-language termination criterion, judged by the provider.
    pub until: String,

    /// Loops default to `continue`, unlike steps.
    #[serde(default = "default_loop_on_failure")]
    pub on_failure: FailurePolicy,

    #[serde(default = "default_true")]
    pub accumulate: bool,
}

fn default_max_iterations() -> u32 {
    10
}

fn default_loop_on_failure() -> FailurePolicy {
    FailurePolicy::Continue
}

fn default_true() -> bool {
    true
}

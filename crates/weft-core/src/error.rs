//! Core error type for the Weft engine.
//!
//! `WeftError` covers the loader, resolver, and orchestrator failure kinds.
//! The provider layer (`provider::ProviderError`), tool layer
//! (`tools::ToolError`), and sandbox (`sandbox::SandboxError`) keep their
//! own enums and convert into `WeftError` at the engine boundary, so each
//! subsystem can reason about retryability locally.

use crate::provider::ProviderError;
use crate::sandbox::SandboxError;
use crate::skills::SkillError;
use crate::tools::ToolError;

#[derive(Debug, thiserror::Error)]
pub enum WeftError {
    #[error("schema mismatch: expected \"workflow/v2.0\", found \"{found}\"")]
    SchemaMismatch { found: String },

    #[error("invalid workflow: {0}")]
    WorkflowInvalid(String),

    #[error("step definition '{name}' declared by both '{first}' and '{second}'")]
    DefinitionConflict {
        name: String,
        first: String,
        second: String,
    },

    #[error("workflow recursion limit ({limit}) exceeded while entering '{workflow}'")]
    RecursionLimit { workflow: String, limit: usize },

    #[error("variable '{name}' not found in expression '{{{{{expr}}}}}'")]
    VariableNotFound { name: String, expr: String },

    #[error("malformed expression '{expr}': {reason}")]
    ExpressionMalformed { expr: String, reason: String },

    #[error("malformed condition '{condition}': {reason}")]
    ConditionMalformed { condition: String, reason: String },

    #[error("step '{step}' needs '{dependency}', which has not executed")]
    DependencyNotSatisfied { step: String, dependency: String },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Skill(#[from] SkillError),

    #[error("consensus unmet: {agree}/{total} agreed, required {required}")]
    ConsensusUnmet {
        required: String,
        agree: usize,
        total: usize,
    },

    #[error("consensus timed out after {0:?}")]
    ConsensusTimeout(std::time::Duration),

    #[error("sub-workflow '{workflow}' failed: {message}")]
    SubWorkflowFailed { workflow: String, message: String },

    #[error("loop '{name}' halted: {message}")]
    LoopFailedHalt { name: String, message: String },

    #[error("cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl WeftError {
    /// Step-name-tagged display used in per-step outcome records.
    pub fn for_step(&self, step: &str) -> String {
        format!("step '{}': {}", step, self)
    }
}

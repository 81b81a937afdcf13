//! Workflow loading and validation.
//!
//! The loader is hermetic: it reads YAML from disk, expands environment
//! references in the `env` block, merges included step libraries, and
//! validates the document. No network, no process spawn.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::schema::{Step, StepDefinition, Workflow, SCHEMA_V2};
use crate::error::WeftError;
use crate::util::expand_env;

/// Load, merge includes, and validate a workflow file.
pub fn load_workflow(path: &Path) -> Result<Workflow, WeftError> {
    let raw = std::fs::read_to_string(path)?;
    let mut workflow = Workflow::from_yaml(&raw)?;

    for value in workflow.env.values_mut() {
        *value = expand_env(value);
    }
    if let Some(model) = &workflow.execution.model {
        workflow.execution.model = Some(expand_env(model));
    }

    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    merge_includes(&mut workflow, base_dir)?;

    validate(&workflow)?;
    tracing::debug!(
        workflow = %workflow.name,
        steps = workflow.steps.len(),
        loops = workflow.loops.len(),
        "workflow loaded"
    );
    Ok(workflow)
}

/// Parse and validate a workflow from a YAML string (no includes).
pub fn load_workflow_str(yaml: &str) -> Result<Workflow, WeftError> {
    let workflow = Workflow::from_yaml(yaml)?;
    validate(&workflow)?;
    Ok(workflow)
}

/// An include file is either a bare `name: definition` mapping or the same
/// wrapped under a `step_definitions` key.
#[derive(Deserialize)]
#[serde(untagged)]
enum IncludeFile {
    Wrapped {
        step_definitions: HashMap<String, StepDefinition>,
    },
    Bare(HashMap<String, StepDefinition>),
}

fn merge_includes(workflow: &mut Workflow, base_dir: &Path) -> Result<(), WeftError> {
    if workflow.includes.is_empty() {
        return Ok(());
    }

    // remember where each definition came from, for conflict messages
    let mut sources: HashMap<String, String> = workflow
        .step_definitions
        .keys()
        .map(|name| (name.clone(), "<inline>".to_string()))
        .collect();

    for include in workflow.includes.clone() {
        let include_path = resolve_relative(base_dir, &include);
        let raw = std::fs::read_to_string(&include_path).map_err(|e| {
            WeftError::WorkflowInvalid(format!(
                "cannot read include '{}': {}",
                include_path.display(),
                e
            ))
        })?;
        let parsed: IncludeFile = serde_yaml::from_str(&raw)?;
        let definitions = match parsed {
            IncludeFile::Wrapped { step_definitions } => step_definitions,
            IncludeFile::Bare(map) => map,
        };

        for (name, definition) in definitions {
            if let Some(first) = sources.get(&name) {
                return Err(WeftError::DefinitionConflict {
                    name,
                    first: first.clone(),
                    second: include.clone(),
                });
            }
            sources.insert(name.clone(), include.clone());
            workflow.step_definitions.insert(name, definition);
        }
    }
    Ok(())
}

fn resolve_relative(base_dir: &Path, include: &str) -> PathBuf {
    let path = Path::new(include);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// Enforce the schema invariants: exact schema literal, unique step names,
/// known `needs` references, single-mode steps, per-mode required fields.
pub fn validate(workflow: &Workflow) -> Result<(), WeftError> {
    if workflow.schema != SCHEMA_V2 {
        return Err(WeftError::SchemaMismatch {
            found: workflow.schema.clone(),
        });
    }
    if workflow.name.trim().is_empty() {
        return Err(WeftError::WorkflowInvalid("workflow name is empty".into()));
    }
    if workflow.steps.is_empty() && workflow.loops.is_empty() {
        return Err(WeftError::WorkflowInvalid(
            "workflow declares no steps and no loops".into(),
        ));
    }

    let mut names: HashSet<&str> = HashSet::new();
    for step in &workflow.steps {
        if !names.insert(step.name.as_str()) {
            return Err(WeftError::WorkflowInvalid(format!(
                "duplicate step name '{}'",
                step.name
            )));
        }
    }

    for step in &workflow.steps {
        for dep in &step.needs {
            if !names.contains(dep.as_str()) {
                return Err(WeftError::WorkflowInvalid(format!(
                    "step '{}' needs unknown step '{}'",
                    step.name, dep
                )));
            }
        }
        validate_step(step, workflow)?;
    }

    let mut loop_names: HashSet<&str> = HashSet::new();
    for lp in &workflow.loops {
        if !loop_names.insert(lp.name.as_str()) {
            return Err(WeftError::WorkflowInvalid(format!(
                "duplicate loop name '{}'",
                lp.name
            )));
        }
        if lp.until.trim().is_empty() {
            return Err(WeftError::WorkflowInvalid(format!(
                "loop '{}' has an empty until criterion",
                lp.name
            )));
        }
        if lp.max_iterations == 0 {
            return Err(WeftError::WorkflowInvalid(format!(
                "loop '{}' has max_iterations 0",
                lp.name
            )));
        }
    }

    Ok(())
}

fn validate_step(step: &Step, workflow: &Workflow) -> Result<(), WeftError> {
    let present = step.present_modes();
    match present.len() {
        0 => {
            return Err(WeftError::WorkflowInvalid(format!(
                "step '{}' declares no mode (one of run, parallel, for_each, consensus, \
                 template, transform, use)",
                step.name
            )))
        }
        1 => {}
        _ => {
            return Err(WeftError::WorkflowInvalid(format!(
                "step '{}' declares multiple modes: {}",
                step.name,
                present.join(", ")
            )))
        }
    }

    if step.mode().is_none() {
        // the single discriminator is present but incomplete
        return Err(WeftError::WorkflowInvalid(format!(
            "step '{}': '{}' is missing its required companion fields",
            step.name, present[0]
        )));
    }

    if let Some(parallel) = &step.parallel {
        if parallel.steps.is_empty() {
            return Err(WeftError::WorkflowInvalid(format!(
                "step '{}': parallel.steps must declare at least one sub-step",
                step.name
            )));
        }
        let mut sub_names: HashSet<&str> = HashSet::new();
        for sub in &parallel.steps {
            if !sub_names.insert(sub.name.as_str()) {
                return Err(WeftError::WorkflowInvalid(format!(
                    "step '{}': duplicate sub-step name '{}'",
                    step.name, sub.name
                )));
            }
            validate_step(sub, workflow)?;
        }
    }

    if let Some(consensus) = &step.consensus {
        if consensus.executions.is_empty() {
            return Err(WeftError::WorkflowInvalid(format!(
                "step '{}': consensus.executions must declare at least one execution",
                step.name
            )));
        }
        if consensus.prompt.trim().is_empty() {
            return Err(WeftError::WorkflowInvalid(format!(
                "step '{}': consensus.prompt is empty",
                step.name
            )));
        }
    }

    if let Some(transform) = &step.transform {
        if transform.operations.is_empty() {
            return Err(WeftError::WorkflowInvalid(format!(
                "step '{}': transform.operations is empty",
                step.name
            )));
        }
    }

    if let Some(definition) = &step.use_definition {
        if !workflow.step_definitions.contains_key(definition) {
            return Err(WeftError::WorkflowInvalid(format!(
                "step '{}' uses undeclared step definition '{}'",
                step.name, definition
            )));
        }
    }

    if let Some(template) = &step.template {
        if template.trim().is_empty() {
            return Err(WeftError::WorkflowInvalid(format!(
                "step '{}': template name is empty",
                step.name
            )));
        }
    }

    Ok(())
}

/// Resolves workflow names for `template` steps and loops.
pub trait WorkflowLibrary: Send + Sync {
    fn load(&self, name: &str) -> Result<Workflow, WeftError>;
}

/// Loads `<base>/<name>.yaml` (or `.yml`) on demand.
pub struct DirLibrary {
    base: PathBuf,
}

impl DirLibrary {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

impl WorkflowLibrary for DirLibrary {
    fn load(&self, name: &str) -> Result<Workflow, WeftError> {
        for extension in ["yaml", "yml"] {
            let candidate = self.base.join(format!("{}.{}", name, extension));
            if candidate.is_file() {
                return load_workflow(&candidate);
            }
        }
        Err(WeftError::WorkflowInvalid(format!(
            "workflow '{}' not found under {}",
            name,
            self.base.display()
        )))
    }
}

/// In-memory library, mainly for tests and embedders.
#[derive(Default)]
pub struct MemoryLibrary {
    workflows: HashMap<String, Workflow>,
}

impl MemoryLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, workflow: Workflow) {
        self.workflows.insert(workflow.name.clone(), workflow);
    }
}

impl WorkflowLibrary for MemoryLibrary {
    fn load(&self, name: &str) -> Result<Workflow, WeftError> {
        self.workflows.get(name).cloned().ok_or_else(|| {
            WeftError::WorkflowInvalid(format!("workflow '{}' is not registered", name))
        })
    }
}

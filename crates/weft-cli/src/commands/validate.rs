//! `weft validate` — check a workflow file without executing it.

use std::path::Path;
use std::process::ExitCode;

use weft_core::{load_workflow, WeftError};

pub fn run(path: &Path, verbose: bool) -> Result<ExitCode, WeftError> {
    super::init_tracing(verbose, None);

    let workflow = load_workflow(path)?;

    println!("workflow '{}' is valid", workflow.name);
    println!("  version: {}", workflow.version);
    println!("  steps:   {}", workflow.steps.len());
    if !workflow.loops.is_empty() {
        println!("  loops:   {}", workflow.loops.len());
    }
    if !workflow.step_definitions.is_empty() {
        println!("  definitions: {}", workflow.step_definitions.len());
    }
    for (i, step) in workflow.steps.iter().enumerate() {
        let mode = step.present_modes().first().copied().unwrap_or("?");
        println!("  {}. {} ({})", i + 1, step.name, mode);
    }
    Ok(ExitCode::SUCCESS)
}

//! `weft skills` — inspect discovered skills.

use std::path::Path;
use std::process::ExitCode;

use weft_core::skills::SkillRegistry;
use weft_core::WeftError;

pub fn list(dir: Option<&Path>, verbose: bool) -> Result<ExitCode, WeftError> {
    super::init_tracing(verbose, None);

    let root = dir.unwrap_or_else(|| Path::new("./skills"));
    let registry = SkillRegistry::discover(root)?;

    if registry.is_empty() {
        println!("no skills found under {}", root.display());
        return Ok(ExitCode::SUCCESS);
    }

    println!("{} skill(s) under {}", registry.len(), root.display());
    for skill in registry.list() {
        let mut extras = Vec::new();
        if !skill.references.is_empty() {
            extras.push(format!("{} reference(s)", skill.references.len()));
        }
        if !skill.scripts.is_empty() {
            extras.push(format!("{} script(s)", skill.scripts.len()));
        }
        if skill.has_workflow {
            extras.push("workflow".to_string());
        }
        let suffix = if extras.is_empty() {
            String::new()
        } else {
            format!(" [{}]", extras.join(", "))
        };
        println!("  {:<24} {}{}", skill.name, skill.description, suffix);
    }
    Ok(ExitCode::SUCCESS)
}

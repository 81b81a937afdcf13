//! Exposes skills through the tool manager surface.
//!
//! Each enabled skill contributes a passive-load tool named after the
//! skill; one global `execute_skill_code` tool runs code in the sandbox
//! with the skill directory mounted read-only at `/skill`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::{LoadMode, Skill, SkillRegistry};
use crate::sandbox::{ExecutionSpec, Language, SandboxExecutor};
use crate::tools::{ToolError, ToolManager, ToolSchema};

pub const EXECUTE_SKILL_CODE: &str = "execute_skill_code";

/// Arguments accepted by a per-skill passive load tool.
#[derive(Debug, Default, Deserialize)]
struct LoadArgs {
    #[serde(default)]
    mode: LoadMode,
    #[serde(default)]
    references: Vec<String>,
}

/// Arguments accepted by the global `execute_skill_code` tool.
#[derive(Debug, Deserialize)]
struct ExecuteArgs {
    skill_name: String,
    language: Language,
    code: String,
    #[serde(default)]
    files: HashMap<String, String>,
}

/// Tool source over a (possibly filtered) skill set.
pub struct SkillToolSource {
    skills: Vec<Arc<Skill>>,
    executor: Arc<SandboxExecutor>,
    env: Vec<(String, String)>,
}

impl SkillToolSource {
    /// `filter`, when present, narrows the exposed skills by name; the
    /// `list_tools` surface reflects the narrowed set.
    pub fn new(
        registry: &SkillRegistry,
        filter: Option<&[String]>,
        executor: Arc<SandboxExecutor>,
    ) -> Self {
        let skills = registry
            .list()
            .into_iter()
            .filter(|skill| match filter {
                Some(names) => names.iter().any(|n| n == &skill.name),
                None => true,
            })
            .collect();
        Self {
            skills,
            executor,
            env: Vec::new(),
        }
    }

    /// Environment passed into sandboxed runs (e.g. the workflow `env`).
    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    fn find(&self, name: &str) -> Option<&Arc<Skill>> {
        self.skills.iter().find(|s| s.name == name)
    }

    async fn execute_code(&self, arguments: serde_json::Value) -> Result<String, ToolError> {
        let args: ExecuteArgs = serde_json::from_value(arguments)
            .map_err(|e| ToolError::new(EXECUTE_SKILL_CODE, format!("invalid arguments: {}", e)))?;

        let skill = self.find(&args.skill_name).ok_or_else(|| {
            ToolError::new(
                EXECUTE_SKILL_CODE,
                format!("skill '{}' is not enabled", args.skill_name),
            )
        })?;

        let spec = ExecutionSpec {
            skill_name: skill.name.clone(),
            skill_dir: skill.dir.clone(),
            language: args.language,
            code: args.code,
            files: args.files.into_iter().collect(),
            env: self.env.clone(),
        };

        let output = self
            .executor
            .execute(spec)
            .await
            .map_err(|e| ToolError::new(EXECUTE_SKILL_CODE, e.to_string()))?;

        if output.succeeded() {
            Ok(output.text)
        } else {
            // the captured text still reaches the caller
            Ok(format!(
                "[exit code {}]\n{}",
                output.exit_code, output.text
            ))
        }
    }
}

#[async_trait]
impl ToolManager for SkillToolSource {
    fn list_tools(&self) -> Vec<ToolSchema> {
        let mut tools: Vec<ToolSchema> = self
            .skills
            .iter()
            .map(|skill| ToolSchema {
                name: skill.name.clone(),
                description: skill.description.clone(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "mode": {
                            "type": "string",
                            "enum": ["full", "body", "summary"],
                            "description": "How much of the skill to load"
                        },
                        "references": {
                            "type": "array",
                            "items": {"type": "string"},
                            "description": "Reference document stems to include"
                        }
                    }
                }),
            })
            .collect();

        if !self.skills.is_empty() {
            tools.push(ToolSchema {
                name: EXECUTE_SKILL_CODE.to_string(),
                description: "Run Python or bash code against a skill's helper library inside \
                              the sandbox. The skill directory is mounted read-only at /skill; \
                              write results to /outputs or /workspace."
                    .to_string(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "skill_name": {"type": "string"},
                        "language": {"type": "string", "enum": ["python", "bash"]},
                        "code": {"type": "string"},
                        "files": {
                            "type": "object",
                            "additionalProperties": {"type": "string"},
                            "description": "Input files written into /workspace"
                        }
                    },
                    "required": ["skill_name", "language", "code"]
                }),
            });
        }

        tools
    }

    async fn call(&self, name: &str, arguments: serde_json::Value) -> Result<String, ToolError> {
        if name == EXECUTE_SKILL_CODE {
            return self.execute_code(arguments).await;
        }

        let skill = self
            .find(name)
            .ok_or_else(|| ToolError::new(name, "no skill by that name is enabled"))?;

        let args: LoadArgs = if arguments.is_null() {
            LoadArgs::default()
        } else {
            serde_json::from_value(arguments)
                .map_err(|e| ToolError::new(name, format!("invalid arguments: {}", e)))?
        };

        Ok(skill.assemble_context(args.mode, &args.references))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SkillImages;
    use std::path::Path;

    fn setup(root: &Path) -> SkillRegistry {
        let dir = root.join("demo-skill");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("SKILL.md"),
            "---\nname: demo-skill\ndescription: A demo.\n---\n\nBody text.\n",
        )
        .unwrap();
        let dir2 = root.join("hidden-skill");
        std::fs::create_dir_all(&dir2).unwrap();
        std::fs::write(
            dir2.join("SKILL.md"),
            "---\nname: hidden-skill\ndescription: Hidden.\n---\n\nBody.\n",
        )
        .unwrap();
        SkillRegistry::discover(root).unwrap()
    }

    fn executor() -> Arc<SandboxExecutor> {
        Arc::new(SandboxExecutor::unavailable(SkillImages::default()))
    }

    #[test]
    fn test_filter_narrows_list_tools() {
        let root = tempfile::tempdir().unwrap();
        let registry = setup(root.path());

        let all = SkillToolSource::new(&registry, None, executor());
        let names: Vec<String> = all.list_tools().into_iter().map(|t| t.name).collect();
        assert!(names.contains(&"demo-skill".to_string()));
        assert!(names.contains(&"hidden-skill".to_string()));
        assert!(names.contains(&EXECUTE_SKILL_CODE.to_string()));

        let filter = vec!["demo-skill".to_string()];
        let narrowed = SkillToolSource::new(&registry, Some(&filter), executor());
        let names: Vec<String> = narrowed.list_tools().into_iter().map(|t| t.name).collect();
        assert!(names.contains(&"demo-skill".to_string()));
        assert!(!names.contains(&"hidden-skill".to_string()));
    }

    #[tokio::test]
    async fn test_passive_load() {
        let root = tempfile::tempdir().unwrap();
        let registry = setup(root.path());
        let source = SkillToolSource::new(&registry, None, executor());

        let context = source
            .call("demo-skill", serde_json::json!({"mode": "body"}))
            .await
            .unwrap();
        assert!(context.contains("Body text."));

        let missing = source.call("nope", serde_json::Value::Null).await;
        assert!(missing.is_err());
    }

    #[tokio::test]
    async fn test_execute_degrades_when_sandbox_unavailable() {
        let root = tempfile::tempdir().unwrap();
        let registry = setup(root.path());
        let source = SkillToolSource::new(&registry, None, executor());

        let err = source
            .call(
                EXECUTE_SKILL_CODE,
                serde_json::json!({
                    "skill_name": "demo-skill",
                    "language": "python",
                    "code": "print('hi')"
                }),
            )
            .await
            .unwrap_err();
        assert!(err.message.contains("no container runtime"));
    }
}

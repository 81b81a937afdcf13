//! Sandboxed code execution for skills.
//!
//! User-authored Python or shell code runs inside a container with three
//! mounts: `/workspace` (read-write, ephemeral per call), `/skill`
//! (read-only, the calling skill's directory), and `/outputs` (read-write,
//! durable host directory). Resource limits and image selection come from
//! the skill-images mapping; code is statically screened before any
//! container is launched.

pub mod images;
pub mod policy;
pub mod runtime;

pub use images::{NetworkMode, ResolvedImage, SkillImages};
pub use runtime::{ContainerBackend, LaunchSpec, SandboxBackend};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Language of the submitted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Bash,
}

impl Language {
    pub fn script_name(self) -> &'static str {
        match self {
            Language::Python => "main.py",
            Language::Bash => "main.sh",
        }
    }

    fn interpreter(self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Bash => "bash",
        }
    }
}

/// One code execution request.
#[derive(Debug, Clone)]
pub struct ExecutionSpec {
    pub skill_name: String,
    pub skill_dir: PathBuf,
    pub language: Language,
    pub code: String,
    /// Extra input files written into `/workspace` before the run:
    /// (relative name, contents).
    pub files: Vec<(String, String)>,
    /// Environment passed into the container.
    pub env: Vec<(String, String)>,
}

/// Captured result of a container run.
#[derive(Debug, Clone)]
pub struct ExecutionOutput {
    /// Combined stdout + stderr.
    pub text: String,
    pub exit_code: i32,
}

impl ExecutionOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("no container runtime available; active skill features are disabled")]
    Unavailable,

    #[error("sandbox timed out after {0:?}")]
    Timeout(Duration),

    #[error("path policy violation at line {line}: '{path}' is outside /workspace and /outputs (offending line: {text})")]
    PathPolicy {
        line: usize,
        path: String,
        text: String,
    },

    #[error("code rejected at line {line}: {reason}")]
    SyntaxRejected { line: usize, reason: String },

    #[error("network mode 'bridge' for skill '{0}' requires a justification")]
    NetworkJustificationMissing(String),

    #[error("container launch failed: {0}")]
    Launch(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Executes code requests against a pluggable backend.
///
/// When no backend was detected the executor stays constructible and every
/// `execute` fails with [`SandboxError::Unavailable`], letting callers
/// degrade active skill features to passive ones.
pub struct SandboxExecutor {
    backend: Option<Arc<dyn SandboxBackend>>,
    images: SkillImages,
}

impl SandboxExecutor {
    /// Detect a container runtime from the configured ordered list.
    pub fn detect(images: SkillImages, runtimes: &[String]) -> Self {
        let backend = ContainerBackend::detect(runtimes)
            .map(|b| Arc::new(b) as Arc<dyn SandboxBackend>);
        if backend.is_none() {
            tracing::warn!("no container runtime found on PATH; sandbox unavailable");
        }
        Self { backend, images }
    }

    pub fn with_backend(images: SkillImages, backend: Arc<dyn SandboxBackend>) -> Self {
        Self {
            backend: Some(backend),
            images,
        }
    }

    pub fn unavailable(images: SkillImages) -> Self {
        Self {
            backend: None,
            images,
        }
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_some()
    }

    /// Validate, stage, and run one code execution.
    ///
    /// The returned output carries the combined stdout+stderr even when the
    /// exit code is non-zero; callers decide how to surface the failure.
    pub async fn execute(&self, spec: ExecutionSpec) -> Result<ExecutionOutput, SandboxError> {
        policy::validate(&spec.code, spec.language)?;

        let settings = self.images.resolve(&spec.skill_name)?;
        let backend = self.backend.as_ref().ok_or(SandboxError::Unavailable)?;

        // Per-invocation workspace; removed when the guard drops.
        let workspace = tempfile::Builder::new()
            .prefix(&format!("weft-sbx-{}-", uuid::Uuid::new_v4().simple()))
            .tempdir()?;

        for (name, contents) in &spec.files {
            let target = workspace.path().join(name);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(target, contents)?;
        }
        let script = workspace.path().join(spec.language.script_name());
        std::fs::write(&script, &spec.code)?;

        std::fs::create_dir_all(&settings.outputs_dir)?;

        let launch = LaunchSpec {
            image: settings.image.clone(),
            network_mode: settings.network_mode,
            memory: settings.memory.clone(),
            cpu: settings.cpu,
            pids_limit: settings.pids_limit,
            workspace_dir: workspace.path().to_path_buf(),
            skill_dir: spec.skill_dir.clone(),
            outputs_dir: settings.outputs_dir.clone(),
            command: vec![
                spec.language.interpreter().to_string(),
                format!("/workspace/{}", spec.language.script_name()),
            ],
            env: spec.env.clone(),
            timeout: settings.timeout,
        };

        tracing::info!(
            skill = %spec.skill_name,
            image = %launch.image,
            timeout = ?launch.timeout,
            "launching sandboxed execution"
        );

        let output = backend.run(&launch).await?;
        if !output.succeeded() {
            tracing::warn!(
                skill = %spec.skill_name,
                exit_code = output.exit_code,
                "sandboxed execution exited non-zero"
            );
        }
        Ok(output)
    }
}

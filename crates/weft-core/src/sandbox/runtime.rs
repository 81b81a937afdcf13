//! Container runtime detection and launch.
//!
//! The backend is a trait so alternative runtimes (or a future native
//! subprocess fallback) can replace the container default without touching
//! callers.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;

use super::{ExecutionOutput, NetworkMode, SandboxError};

/// Everything a backend needs to run one staged execution.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub image: String,
    pub network_mode: NetworkMode,
    pub memory: String,
    pub cpu: f64,
    pub pids_limit: u32,
    pub workspace_dir: PathBuf,
    pub skill_dir: PathBuf,
    pub outputs_dir: PathBuf,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

/// Pluggable execution backend.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    async fn run(&self, launch: &LaunchSpec) -> Result<ExecutionOutput, SandboxError>;
}

/// Runs code through a local container runtime (`docker`, `podman`, ...).
pub struct ContainerBackend {
    runtime: PathBuf,
}

impl ContainerBackend {
    /// Pick the first runtime from `runtimes` found on `PATH`.
    pub fn detect(runtimes: &[String]) -> Option<Self> {
        for name in runtimes {
            if let Some(path) = find_on_path(name) {
                tracing::info!(runtime = %path.display(), "container runtime detected");
                return Some(Self { runtime: path });
            }
        }
        None
    }

    pub fn with_runtime(runtime: PathBuf) -> Self {
        Self { runtime }
    }

    fn build_args(&self, launch: &LaunchSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--network".to_string(),
            launch.network_mode.as_flag().to_string(),
            "--memory".to_string(),
            launch.memory.clone(),
            "--cpus".to_string(),
            launch.cpu.to_string(),
            "--pids-limit".to_string(),
            launch.pids_limit.to_string(),
            "-v".to_string(),
            format!("{}:/workspace", launch.workspace_dir.display()),
            "-v".to_string(),
            format!("{}:/skill:ro", launch.skill_dir.display()),
            "-v".to_string(),
            format!("{}:/outputs", launch.outputs_dir.display()),
            "-w".to_string(),
            "/workspace".to_string(),
        ];
        for (key, value) in &launch.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(launch.image.clone());
        args.extend(launch.command.iter().cloned());
        args
    }
}

#[async_trait]
impl SandboxBackend for ContainerBackend {
    async fn run(&self, launch: &LaunchSpec) -> Result<ExecutionOutput, SandboxError> {
        let args = self.build_args(launch);
        tracing::debug!(runtime = %self.runtime.display(), ?args, "spawning container");

        let child = tokio::process::Command::new(&self.runtime)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Launch(e.to_string()))?;

        // kill_on_drop tears the container client down if the timeout fires
        let wait = child.wait_with_output();
        let output = match launch.timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(result) => result?,
                Err(_) => return Err(SandboxError::Timeout(limit)),
            },
            None => wait.await?,
        };

        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stderr);
        }

        Ok(ExecutionOutput {
            text,
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch() -> LaunchSpec {
        LaunchSpec {
            image: "python:3.12-slim".into(),
            network_mode: NetworkMode::None,
            memory: "512m".into(),
            cpu: 1.0,
            pids_limit: 128,
            workspace_dir: PathBuf::from("/tmp/ws"),
            skill_dir: PathBuf::from("/tmp/skill"),
            outputs_dir: PathBuf::from("/tmp/out"),
            command: vec!["python".into(), "/workspace/main.py".into()],
            env: vec![("KEY".into(), "value".into())],
            timeout: Some(Duration::from_secs(60)),
        }
    }

    #[test]
    fn test_build_args_mounts_and_limits() {
        let backend = ContainerBackend::with_runtime(PathBuf::from("/usr/bin/docker"));
        let args = backend.build_args(&launch());
        let joined = args.join(" ");
        assert!(joined.starts_with("run --rm --network none"));
        assert!(joined.contains("-v /tmp/ws:/workspace"));
        assert!(joined.contains("-v /tmp/skill:/skill:ro"));
        assert!(joined.contains("-v /tmp/out:/outputs"));
        assert!(joined.contains("--pids-limit 128"));
        assert!(joined.contains("-e KEY=value"));
        assert!(joined.ends_with("python:3.12-slim python /workspace/main.py"));
    }

    #[test]
    fn test_detect_misses_nonexistent_runtime() {
        assert!(ContainerBackend::detect(&["definitely-not-a-runtime-xyz".to_string()]).is_none());
    }
}

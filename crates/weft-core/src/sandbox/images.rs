//! Skill-images mapping: which container image and resource limits each
//! skill runs under.
//!
//! ```yaml
//! defaults:
//!   image: python:3.12-slim
//!   network_mode: none
//!   memory: 512m
//!   cpu: 1.0
//!   pids_limit: 128
//!   timeout: "60s"
//!   outputs_dir: ./outputs
//! skills:
//!   pdf-tools:
//!     image: ghcr.io/example/pdf-tools:latest
//!     memory: 2g
//!   web-scraper:
//!     network_mode: bridge
//!     network_justification: "fetches public pages listed in the prompt"
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::SandboxError;
use crate::util::duration_opt;

/// Container network mode. Full isolation unless a skill opts in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    #[default]
    None,
    Bridge,
}

impl NetworkMode {
    pub fn as_flag(self) -> &'static str {
        match self {
            NetworkMode::None => "none",
            NetworkMode::Bridge => "bridge",
        }
    }
}

/// Fully-specified settings applied to every run (the `defaults` block).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageDefaults {
    pub image: String,
    #[serde(default)]
    pub network_mode: NetworkMode,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_cpu")]
    pub cpu: f64,
    #[serde(default = "default_pids")]
    pub pids_limit: u32,
    #[serde(default = "default_timeout", with = "duration_opt")]
    pub timeout: Option<Duration>,
    #[serde(default = "default_outputs_dir")]
    pub outputs_dir: PathBuf,
}

fn default_memory() -> String {
    "512m".to_string()
}

fn default_cpu() -> f64 {
    1.0
}

fn default_pids() -> u32 {
    128
}

fn default_timeout() -> Option<Duration> {
    Some(Duration::from_secs(60))
}

fn default_outputs_dir() -> PathBuf {
    PathBuf::from("./outputs")
}

impl Default for ImageDefaults {
    fn default() -> Self {
        Self {
            image: "python:3.12-slim".to_string(),
            network_mode: NetworkMode::None,
            memory: default_memory(),
            cpu: default_cpu(),
            pids_limit: default_pids(),
            timeout: default_timeout(),
            outputs_dir: default_outputs_dir(),
        }
    }
}

/// Per-skill overrides; every field optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageOverride {
    pub image: Option<String>,
    pub network_mode: Option<NetworkMode>,
    pub network_justification: Option<String>,
    pub memory: Option<String>,
    pub cpu: Option<f64>,
    pub pids_limit: Option<u32>,
    #[serde(default, with = "duration_opt")]
    pub timeout: Option<Duration>,
    pub outputs_dir: Option<PathBuf>,
}

/// The parsed `skill-images.yaml` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillImages {
    #[serde(default)]
    pub defaults: ImageDefaults,
    #[serde(default)]
    pub skills: HashMap<String, ImageOverride>,
}

/// Settings for one concrete run, after merging overrides into defaults.
#[derive(Debug, Clone)]
pub struct ResolvedImage {
    pub image: String,
    pub network_mode: NetworkMode,
    pub memory: String,
    pub cpu: f64,
    pub pids_limit: u32,
    pub timeout: Option<Duration>,
    pub outputs_dir: PathBuf,
}

impl SkillImages {
    pub fn load(path: &Path) -> Result<Self, SandboxError> {
        let raw = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&raw)
            .map_err(|e| SandboxError::Launch(format!("invalid skill-images file: {}", e)))
    }

    /// Merge the per-skill override (if any) over the defaults.
    ///
    /// A `bridge` network opt-in without a justification fails here, before
    /// anything is launched.
    pub fn resolve(&self, skill_name: &str) -> Result<ResolvedImage, SandboxError> {
        let over = self.skills.get(skill_name).cloned().unwrap_or_default();

        let network_mode = over.network_mode.unwrap_or(self.defaults.network_mode);
        if network_mode == NetworkMode::Bridge
            && over
                .network_justification
                .as_deref()
                .map(str::trim)
                .unwrap_or("")
                .is_empty()
        {
            return Err(SandboxError::NetworkJustificationMissing(
                skill_name.to_string(),
            ));
        }

        Ok(ResolvedImage {
            image: over.image.unwrap_or_else(|| self.defaults.image.clone()),
            network_mode,
            memory: over.memory.unwrap_or_else(|| self.defaults.memory.clone()),
            cpu: over.cpu.unwrap_or(self.defaults.cpu),
            pids_limit: over.pids_limit.unwrap_or(self.defaults.pids_limit),
            timeout: over.timeout.or(self.defaults.timeout),
            outputs_dir: over
                .outputs_dir
                .unwrap_or_else(|| self.defaults.outputs_dir.clone()),
        })
    }
}

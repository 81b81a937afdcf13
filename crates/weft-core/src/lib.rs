//! Weft Core — transport-agnostic engine for the Weft orchestration runtime.
//!
//! This crate contains the workflow interpreter and its supporting
//! substrates. It has **no CLI or HTTP server dependency**, making it
//! suitable for embedding in:
//!
//! - CLI tools (via `weft-cli`)
//! - long-running services
//! - test harnesses driving the engine with stub providers
//!
//! # Architecture
//!
//! ```text
//! workflow.yaml ──► Workflow ──► Engine
//!                                  │
//!        skills/*/SKILL.md ──► SkillRegistry ──► ToolRegistry
//!                                  │                  │
//!                            FailoverChain      SandboxExecutor
//!                                  │
//!                        Anthropic / OpenAI-style endpoints
//! ```

pub mod error;
pub mod provider;
pub mod sandbox;
pub mod skills;
pub mod tools;
pub mod util;
pub mod workflow;

// Convenience re-exports
pub use error::WeftError;
pub use workflow::loader::{load_workflow, DirLibrary, MemoryLibrary, WorkflowLibrary};
pub use workflow::orchestrator::{Engine, WorkflowReport};
pub use workflow::schema::Workflow;

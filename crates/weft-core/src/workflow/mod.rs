//! Workflow engine — YAML-driven multi-step orchestration.
//!
//! A workflow YAML (schema `workflow/v2.0`) declares steps in one of seven
//! modes plus workflow-level loops. The loader produces an immutable
//! [`schema::Workflow`]; the [`orchestrator::Engine`] executes it, threading
//! step outputs forward through the [`resolver::VariableStore`].
//!
//! # Architecture
//!
//! ```text
//! workflow.yaml ──► loader ──► Workflow ──► Engine
//!                                             │
//!                     {{expr}} ◄── VariableStore
//!                                             │
//!                  basic / parallel / for_each / consensus
//!                  template / transform / use ── steps::*
//! ```

pub mod loader;
pub mod loops;
pub mod orchestrator;
pub mod resolver;
pub mod schema;
pub mod steps;

pub use loader::{load_workflow, WorkflowLibrary};
pub use orchestrator::{Engine, EngineConfig, StepOutcome, StepStatus, WorkflowReport};
pub use resolver::VariableStore;
pub use schema::{Step, Workflow};

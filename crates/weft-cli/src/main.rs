//! Weft CLI — command-line front-end for the workflow engine.
//!
//! Exit codes: 0 success, 1 workflow failure, 2 validation failure,
//! 3 I/O or configuration error.

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use weft_core::WeftError;

#[derive(Parser)]
#[command(name = "weft", version, about = "Weft — AI workflow orchestration runtime")]
struct Cli {
    /// Verbose logging (overrides the workflow's logging level)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow YAML file
    Run {
        /// Path to the workflow file
        workflow: PathBuf,

        /// Workflow input; "-" reads stdin
        #[arg(long, default_value = "")]
        input: String,

        /// Directory scanned for skills (default: ./skills)
        #[arg(long, env = "WEFT_SKILLS_DIR")]
        skills_dir: Option<PathBuf>,

        /// Directory resolving template/loop workflow names
        /// (default: the workflow file's directory)
        #[arg(long, env = "WEFT_WORKFLOWS_DIR")]
        workflows_dir: Option<PathBuf>,

        /// Path to the skill-images mapping file
        #[arg(long, env = "WEFT_SKILL_IMAGES")]
        skill_images: Option<PathBuf>,

        /// Print the full structured report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a workflow file without executing it
    Validate {
        workflow: PathBuf,
    },

    /// Inspect discovered skills
    Skills {
        #[command(subcommand)]
        action: SkillsAction,
    },
}

#[derive(Subcommand)]
enum SkillsAction {
    /// List skills discovered under a directory
    List {
        /// Skills root (default: ./skills)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            workflow,
            input,
            skills_dir,
            workflows_dir,
            skill_images,
            json,
        } => {
            commands::run::run(commands::run::RunArgs {
                workflow,
                input,
                skills_dir,
                workflows_dir,
                skill_images,
                json,
                verbose: cli.verbose,
            })
            .await
        }
        Commands::Validate { workflow } => commands::validate::run(&workflow, cli.verbose),
        Commands::Skills {
            action: SkillsAction::List { dir },
        } => commands::skills::list(dir.as_deref(), cli.verbose),
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {}", err);
            exit_code_for(&err)
        }
    }
}

/// Map error kinds onto the documented exit codes.
fn exit_code_for(err: &WeftError) -> ExitCode {
    match err {
        WeftError::SchemaMismatch { .. }
        | WeftError::WorkflowInvalid(_)
        | WeftError::DefinitionConflict { .. } => ExitCode::from(2),
        WeftError::Io(_) | WeftError::Yaml(_) | WeftError::Skill(_) => ExitCode::from(3),
        _ => ExitCode::from(1),
    }
}

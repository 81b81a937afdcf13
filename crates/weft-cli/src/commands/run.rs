//! `weft run` — execute a workflow file.

use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use weft_core::provider::{HttpProvider, ProviderRegistry};
use weft_core::sandbox::{SandboxExecutor, SkillImages};
use weft_core::skills::{SkillRegistry, SkillToolSource};
use weft_core::tools::ToolRegistry;
use weft_core::workflow::schema::{ExecutionContext, Step, Workflow};
use weft_core::workflow::{StepStatus, WorkflowReport};
use weft_core::{load_workflow, DirLibrary, Engine, WeftError};

pub struct RunArgs {
    pub workflow: PathBuf,
    pub input: String,
    pub skills_dir: Option<PathBuf>,
    pub workflows_dir: Option<PathBuf>,
    pub skill_images: Option<PathBuf>,
    pub json: bool,
    pub verbose: bool,
}

pub async fn run(args: RunArgs) -> Result<ExitCode, WeftError> {
    super::load_dotenv();

    let workflow = load_workflow(&args.workflow)?;
    super::init_tracing(args.verbose, workflow.execution.logging);

    // the workflow env block is visible to sub-processes and providers
    for (key, value) in &workflow.env {
        std::env::set_var(key, value);
    }

    let input = if args.input == "-" {
        let mut buffer = String::new();
        std::io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        args.input.clone()
    };

    let engine = build_engine(&workflow, &args)?;

    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling workflow");
            ctrl_c_token.cancel();
        }
    });

    let report = engine.run(&workflow, input, cancel).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
    } else {
        print_report(&report);
    }

    Ok(if report.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn build_engine(workflow: &Workflow, args: &RunArgs) -> Result<Engine, WeftError> {
    let mut providers = ProviderRegistry::new();
    for name in referenced_providers(workflow) {
        let provider = HttpProvider::for_name(&name)?;
        providers.register(Arc::new(provider));
    }

    let mut tools = ToolRegistry::new();
    let skills_dir = args
        .skills_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("./skills"));
    let registry = SkillRegistry::discover(&skills_dir)?;
    if !registry.is_empty() {
        let images = match &args.skill_images {
            Some(path) => SkillImages::load(path)?,
            None => {
                let default_path = Path::new("./skill-images.yaml");
                if default_path.is_file() {
                    SkillImages::load(default_path)?
                } else {
                    SkillImages::default()
                }
            }
        };
        let executor = Arc::new(SandboxExecutor::detect(
            images,
            &["docker".to_string(), "podman".to_string()],
        ));
        let env: Vec<(String, String)> = workflow
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let source = SkillToolSource::new(&registry, None, executor).with_env(env);
        tools.register("skills", Arc::new(source));
    }

    let workflows_dir = args.workflows_dir.clone().unwrap_or_else(|| {
        args.workflow
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    });
    let library = Arc::new(DirLibrary::new(workflows_dir));

    Ok(Engine::new(Arc::new(providers), tools, library))
}

/// Every provider name the workflow can reach, across all execution layers.
fn referenced_providers(workflow: &Workflow) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    collect_ctx(&workflow.execution, &mut names);
    for step in &workflow.steps {
        collect_step(step, &mut names);
    }
    names
}

fn collect_step(step: &Step, names: &mut BTreeSet<String>) {
    collect_ctx(&step.execution, names);
    if let Some(parallel) = &step.parallel {
        for sub in &parallel.steps {
            collect_step(sub, names);
        }
    }
    if let Some(consensus) = &step.consensus {
        for execution in &consensus.executions {
            collect_ctx(execution, names);
        }
    }
}

fn collect_ctx(ctx: &ExecutionContext, names: &mut BTreeSet<String>) {
    if let Some(provider) = &ctx.provider {
        names.insert(provider.clone());
    }
    for binding in &ctx.providers {
        names.insert(binding.provider.clone());
    }
}

fn print_report(report: &WorkflowReport) {
    println!("── {} ──", report.workflow);
    for step in &report.steps {
        let marker = match step.status {
            StepStatus::Success => "ok  ",
            StepStatus::Skipped => "skip",
            StepStatus::Failed => "FAIL",
        };
        print!("  [{}] {} ({:.1?})", marker, step.name, step.elapsed);
        if let Some(error) = &step.error {
            print!(" — {}", error);
        }
        println!();
    }
    for lp in &report.loops {
        println!(
            "  [loop] {} — {} iteration(s){}",
            lp.name,
            lp.iterations,
            if lp.exhausted { ", exhausted" } else { "" }
        );
    }
    println!(
        "── {} in {:.1?} ──",
        if report.success { "succeeded" } else { "failed" },
        report.elapsed
    );
    if let Some(output) = &report.final_output {
        println!("{}", output);
    }
}

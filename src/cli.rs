//! Command-line interface.
//!
//! `swebox check` verifies the container runtime before any run exists;
//! `swebox run` evaluates one or more problems, each in its own sandbox.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::HarnessConfig;
use crate::dataset::{self, SwebenchProblem};
use crate::record::{EvaluationRun, SandboxStatus};
use crate::runtime::{ContainerRuntime, DockerRuntime};
use crate::sandbox::{Sandbox, Scorer};
use crate::workspace;

#[derive(Debug, Parser)]
#[command(name = "swebox", version, about = "Sandboxed evaluation of untrusted coding agents")]
pub struct Cli {
    /// Log level when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Verify the container runtime is reachable and required images exist.
    Check,

    /// Evaluate agent runs against problems from a dataset file.
    Run {
        /// Problem dataset file (JSON array or JSONL).
        #[arg(long, env = "SWEBOX_DATASET")]
        dataset: PathBuf,

        /// Agent artifact copied into every sandbox.
        #[arg(long, env = "SWEBOX_AGENT")]
        agent: PathBuf,

        /// Instance ids to evaluate. Repeatable.
        #[arg(long = "instance-id")]
        instance_ids: Vec<String>,

        /// Evaluate every problem in the dataset.
        #[arg(long, conflicts_with = "instance_ids")]
        all: bool,

        /// Group the produced runs under one evaluation id.
        #[arg(long)]
        evaluation_id: Option<Uuid>,

        /// Maximum number of runs evaluated concurrently.
        #[arg(long, env = "SWEBOX_PARALLEL", default_value_t = 1)]
        parallel: usize,

        /// Directory run workspaces are created under.
        #[arg(long, env = "SWEBOX_WORKSPACE_ROOT", default_value = "./workspaces")]
        workspace_root: PathBuf,

        /// Keep run workspaces on disk after the run finishes.
        #[arg(long)]
        keep_workspaces: bool,
    },
}

/// Parses command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs the selected subcommand.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Check => check().await,
        Commands::Run {
            dataset,
            agent,
            instance_ids,
            all,
            evaluation_id,
            parallel,
            workspace_root,
            keep_workspaces,
        } => {
            let mut config = HarnessConfig::from_env()?;
            config.dataset_path = dataset;
            config.agent_path = agent;
            config.workspace_root = workspace_root;
            config.parallel = parallel;
            config.keep_workspaces = keep_workspaces;
            config.validate()?;
            run(config, instance_ids, all, evaluation_id).await
        }
    }
}

/// Environment preflight: an unreachable runtime or missing image is fatal
/// before any run is created.
async fn check() -> anyhow::Result<()> {
    let config = HarnessConfig::from_env()?;
    let runtime = DockerRuntime::connect().context("container runtime is not reachable")?;
    runtime
        .ping()
        .await
        .context("container runtime did not answer ping")?;
    println!("runtime: ok");

    let mut missing = Vec::new();
    for image in [&config.policy.sandbox_image, &config.policy.proxy_image] {
        if runtime.image_present(image).await? {
            println!("image {image}: present");
        } else {
            println!("image {image}: MISSING");
            missing.push(image.clone());
        }
    }

    if !missing.is_empty() {
        anyhow::bail!("missing required images: {}", missing.join(", "));
    }
    Ok(())
}

async fn run(
    config: HarnessConfig,
    instance_ids: Vec<String>,
    all: bool,
    evaluation_id: Option<Uuid>,
) -> anyhow::Result<()> {
    let problems = dataset::load_problems(&config.dataset_path)?;
    let selected: Vec<SwebenchProblem> = if all {
        problems
    } else {
        if instance_ids.is_empty() {
            anyhow::bail!("select problems with --instance-id or pass --all");
        }
        instance_ids
            .iter()
            .map(|id| dataset::find_problem(&problems, id).cloned())
            .collect::<Result<_, _>>()?
    };

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect()?);
    std::fs::create_dir_all(&config.workspace_root)?;

    // One token shared by every run: the first Ctrl-C diverts all of them
    // to `cancelled` at their next checkpoint.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Cancellation requested, aborting active runs");
                cancel.cancel();
            }
        });
    }

    info!(count = selected.len(), parallel = config.parallel, "Starting evaluation");

    let config = Arc::new(config);
    let runs: Vec<EvaluationRun> = futures::stream::iter(selected.into_iter().map(|problem| {
        let runtime = runtime.clone();
        let config = config.clone();
        let cancel = cancel.clone();
        async move { evaluate_one(runtime, &config, problem, evaluation_id, cancel).await }
    }))
    .buffer_unordered(config.parallel.max(1))
    .collect()
    .await;

    let mut solved = 0usize;
    for run in &runs {
        if run.solved == Some(true) {
            solved += 1;
        }
        println!("{}", serde_json::to_string(run)?);
    }
    info!(total = runs.len(), solved, "Evaluation finished");
    Ok(())
}

/// Drives one problem through the full lifecycle: workspace, sandbox,
/// agent, scoring. Always returns a record in a well-defined state.
async fn evaluate_one(
    runtime: Arc<dyn ContainerRuntime>,
    config: &HarnessConfig,
    problem: SwebenchProblem,
    evaluation_id: Option<Uuid>,
    cancel: CancellationToken,
) -> EvaluationRun {
    let run_id = Uuid::new_v4();
    let mut run = EvaluationRun::new(run_id, &problem.instance_id);
    run.evaluation_id = evaluation_id;

    let sandbox_dir = config
        .workspace_root
        .join(format!("{}-{}", problem.instance_id, run_id));

    if let Err(e) = workspace::prepare(&sandbox_dir, &problem.repo, &problem.base_commit).await {
        error!(
            run_id = %run_id,
            instance_id = %problem.instance_id,
            error = %e,
            "Workspace provisioning failed"
        );
        run.record_error(format!("workspace provisioning failed: {e}"));
        cleanup_workspace(config, &sandbox_dir).await;
        return run;
    }

    let mut sandbox = Sandbox::new(
        runtime.clone(),
        config.policy.clone(),
        &sandbox_dir,
        &config.agent_path,
        problem.clone(),
        run,
        cancel.clone(),
    );

    if let Err(e) = sandbox.provision().await {
        error!(run_id = %run_id, error = %e, "Sandbox provisioning failed");
        sandbox.teardown().await;
        cleanup_workspace(config, &sandbox_dir).await;
        return sandbox.run.clone();
    }

    let agent_result = sandbox.run_agent().await;

    if agent_result.is_ok() && sandbox.run.status == SandboxStatus::PatchGenerated {
        let patch = agent_result.patch.clone().unwrap_or_default();
        let scorer = Scorer::new(runtime, config.policy.clone(), cancel);
        scorer
            .score(&mut sandbox.run, &problem, &sandbox_dir, &patch)
            .await;
    }

    sandbox.teardown().await;
    cleanup_workspace(config, &sandbox_dir).await;
    sandbox.run.clone()
}

async fn cleanup_workspace(config: &HarnessConfig, sandbox_dir: &Path) {
    if config.keep_workspaces {
        return;
    }
    if let Err(e) = tokio::fs::remove_dir_all(sandbox_dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %sandbox_dir.display(), error = %e, "Failed to remove workspace");
        }
    }
}

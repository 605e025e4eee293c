use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use drover::config::DroverConfig;
use drover::engine::{StepEngine, WorkflowExecutor};
use drover::events;
use drover::exec::CliInvoker;
use drover::progress::{ProgressStore, RunStatus, StepStatus, WorkflowProgress};
use drover::subprocess::SubprocessManager;
use drover::workflow::{load_workflow, RunSettings};
use drover::worktree::{IsolationProvider, WorktreeManager};

/// Herd multi-step AI agent workflows through to completion
#[derive(Parser)]
#[command(name = "drover")]
#[command(about = "Resumable workflow runner for AI agent pipelines", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow file from the top
    Run {
        /// Path to the workflow YAML file
        workflow: PathBuf,

        /// Repository path to run in (defaults to current directory)
        #[arg(short = 'p', long)]
        path: Option<PathBuf>,

        /// Override a declared variable (repeatable)
        #[arg(long = "var", value_name = "NAME=VALUE")]
        vars: Vec<String>,

        /// Start at this top-level step, treating earlier steps as done
        #[arg(long)]
        from_step: Option<String>,
    },
    /// Resume a paused, failed, or cancelled run where it left off
    Resume {
        /// Run id, as printed by `drover list`
        id: String,
    },
    /// Show a run's progress and its recent log entries
    Status {
        /// Run id
        id: String,
    },
    /// List saved runs, newest first
    List,
    /// Mark a run as cancelled (use on records stranded by a crash)
    Cancel {
        /// Run id
        id: String,
    },
    /// Remove saved run state and orphaned worktrees
    Clean {
        /// Delete one run's saved record and log
        #[arg(long, value_name = "RUN_ID")]
        state: Option<String>,

        /// Sweep worktrees left behind by crashed runs
        #[arg(long)]
        worktrees: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(cli.verbose >= 2)
        .init();

    debug!("drover started with verbosity level: {}", cli.verbose);

    let result = match cli.command {
        Commands::Run {
            workflow,
            path,
            vars,
            from_step,
        } => run_workflow(workflow, path, vars, from_step).await,
        Commands::Resume { id } => resume_run(&id).await,
        Commands::Status { id } => show_status(&id).await,
        Commands::List => list_runs().await,
        Commands::Cancel { id } => cancel_run(&id).await,
        Commands::Clean { state, worktrees } => clean(state, worktrees).await,
    };

    if let Err(e) = result {
        error!("Fatal error: {}", e);
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run_workflow(
    path: PathBuf,
    repo_path: Option<PathBuf>,
    vars: Vec<String>,
    from_step: Option<String>,
) -> anyhow::Result<()> {
    let config = DroverConfig::load()?;
    let mut workflow = load_workflow(&path).await?;
    if let Some(dir) = repo_path {
        workflow.settings.working_dir = Some(dir);
    }
    let overrides = parse_overrides(&vars)?;
    let executor = build_executor(&config, &workflow.settings)?;

    let cancel = CancellationToken::new();
    spawn_ctrl_c_handler(cancel.clone());

    let definition_path = Some(path.clone());
    let progress = match &from_step {
        Some(step) => {
            executor
                .run_from(&workflow, definition_path, &overrides, step, cancel)
                .await?
        }
        None => {
            executor
                .run(&workflow, definition_path, &overrides, cancel)
                .await?
        }
    };

    report_outcome(&progress);
    Ok(())
}

async fn resume_run(id: &str) -> anyhow::Result<()> {
    let config = DroverConfig::load()?;
    let store = ProgressStore::new(&config.effective_state_dir());
    let record = store.load(id).await?;
    let Some(definition_path) = record.definition_path.clone() else {
        anyhow::bail!("run '{id}' has no saved workflow path; start it again with `drover run`");
    };

    let workflow = load_workflow(&definition_path).await?;
    let executor = build_executor(&config, &workflow.settings)?;

    let cancel = CancellationToken::new();
    spawn_ctrl_c_handler(cancel.clone());

    let progress = executor.resume(&workflow, id, cancel).await?;
    report_outcome(&progress);
    Ok(())
}

async fn show_status(id: &str) -> anyhow::Result<()> {
    let config = DroverConfig::load()?;
    let store = ProgressStore::new(&config.effective_state_dir());
    let progress = store.load(id).await?;

    println!("{} ({})", progress.workflow_id, progress.workflow_name);
    println!("  status:   {}", progress.status);
    println!(
        "  started:  {}",
        progress.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(completed_at) = progress.completed_at {
        println!(
            "  finished: {}",
            completed_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(current) = &progress.current_step {
        if current.retry_count > 0 {
            println!(
                "  current:  {} (retry {})",
                current.name, current.retry_count
            );
        } else {
            println!("  current:  {}", current.name);
        }
    }
    if !progress.pending_steps.is_empty() {
        let pending: Vec<&str> = progress.pending_steps.iter().map(String::as_str).collect();
        println!("  pending:  {}", pending.join(", "));
    }

    if !progress.completed_steps.is_empty() {
        println!("\nSteps:");
        for step in &progress.completed_steps {
            let marker = match step.status {
                StepStatus::Completed => "✅",
                StepStatus::Failed => "❌",
                StepStatus::Exhausted => "⚠️",
            };
            println!("  {} {} - {}", marker, step.name, step.output_summary);
        }
    }

    if !progress.errors.is_empty() {
        println!("\nErrors:");
        for error in &progress.errors {
            println!("  {}: {}", error.step, error.error);
        }
    }

    let log_path = config.effective_log_dir().join(format!("{id}.jsonl"));
    if log_path.exists() {
        let records = events::read_records(&log_path).await?;
        let skip = records.len().saturating_sub(10);
        println!("\nRecent log entries:");
        for record in records.iter().skip(skip) {
            let step = record.step.as_deref().unwrap_or("-");
            println!(
                "  [{}] {:<8} {}: {}",
                record.timestamp.format("%H:%M:%S"),
                record.level.to_string(),
                step,
                record.message
            );
        }
    }

    Ok(())
}

async fn list_runs() -> anyhow::Result<()> {
    let config = DroverConfig::load()?;
    let store = ProgressStore::new(&config.effective_state_dir());
    let runs = store.list().await?;

    if runs.is_empty() {
        println!("No saved runs under {}.", store.base_dir().display());
        return Ok(());
    }

    println!(
        "{:<40} {:<10} {:<20} {}",
        "RUN", "STATUS", "STARTED", "WORKFLOW"
    );
    for run in runs {
        println!(
            "{:<40} {:<10} {:<20} {}",
            run.workflow_id,
            run.status.to_string(),
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.workflow_name
        );
    }
    Ok(())
}

async fn cancel_run(id: &str) -> anyhow::Result<()> {
    let config = DroverConfig::load()?;
    let store = ProgressStore::new(&config.effective_state_dir());
    let mut progress = store.load(id).await?;
    progress.cancel()?;
    store.save(&progress).await?;
    println!("Run {id} marked cancelled. Resume it with: drover resume {id}");
    Ok(())
}

async fn clean(state: Option<String>, worktrees: bool) -> anyhow::Result<()> {
    if state.is_none() && !worktrees {
        anyhow::bail!("nothing to clean: pass --state <run-id> and/or --worktrees");
    }

    let config = DroverConfig::load()?;

    if let Some(id) = state {
        let store = ProgressStore::new(&config.effective_state_dir());
        store.delete(&id).await?;
        let log_path = config.effective_log_dir().join(format!("{id}.jsonl"));
        match tokio::fs::remove_file(&log_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        println!("✅ Removed saved state for {id}");
    }

    if worktrees {
        let subprocess = SubprocessManager::production();
        let repo_path = std::env::current_dir()?;
        let manager = match &config.worktree_dir {
            Some(dir) => WorktreeManager::with_base_dir(&repo_path, dir, subprocess)?,
            None => WorktreeManager::new(&repo_path, subprocess)?,
        };
        let removed = manager.prune_orphaned().await?;
        if removed == 0 {
            println!("No orphaned worktrees found.");
        } else {
            println!("✅ Removed {removed} orphaned worktree(s)");
        }
    }

    Ok(())
}

/// Wire an executor from config plus the workflow's own settings. Workflow
/// settings win over config file values.
fn build_executor(config: &DroverConfig, settings: &RunSettings) -> anyhow::Result<WorkflowExecutor> {
    let subprocess = SubprocessManager::production();

    let timeout = settings.step_timeout.or(config.step_timeout);
    let invoker = CliInvoker::new(subprocess.clone())
        .with_agent_command(&config.agent_command)
        .with_agent_args(config.agent_args_list()?)
        .with_timeout(timeout);

    let repo_path = match &settings.working_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let worktree_dir = settings
        .git
        .worktree_dir
        .as_deref()
        .or(config.worktree_dir.as_deref());
    let isolation: Arc<dyn IsolationProvider> = match worktree_dir {
        Some(dir) => Arc::new(WorktreeManager::with_base_dir(&repo_path, dir, subprocess)?),
        None => Arc::new(WorktreeManager::new(&repo_path, subprocess)?),
    };

    let mut engine = StepEngine::new(Arc::new(invoker), isolation);
    if let Some(retry) = settings.retry.clone().or_else(|| config.retry.clone()) {
        engine = engine.with_default_retry(retry);
    }

    let store = ProgressStore::new(&config.effective_state_dir());
    Ok(WorkflowExecutor::new(Arc::new(engine), store).with_log_dir(config.effective_log_dir()))
}

/// First Ctrl-C requests a graceful stop; the run ends after the in-flight
/// attempt finishes. A second Ctrl-C force-quits without saving.
fn spawn_ctrl_c_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nCancelling: waiting for the in-flight step to finish (Ctrl-C again to force quit)");
            cancel.cancel();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nForced quit; the run record may be stale. Repair it with `drover cancel`.");
            std::process::exit(130);
        }
    });
}

fn parse_overrides(vars: &[String]) -> anyhow::Result<HashMap<String, String>> {
    let mut overrides = HashMap::new();
    for var in vars {
        let Some((name, value)) = var.split_once('=') else {
            anyhow::bail!("invalid --var '{var}': expected NAME=VALUE");
        };
        overrides.insert(name.to_string(), value.to_string());
    }
    Ok(overrides)
}

fn report_outcome(progress: &WorkflowProgress) {
    match progress.status {
        RunStatus::Completed => {
            let top_level = progress
                .completed_steps
                .iter()
                .filter(|step| !step.name.contains('/'))
                .count();
            println!(
                "✅ Workflow '{}' completed ({} top-level steps)",
                progress.workflow_name, top_level
            );
        }
        RunStatus::Cancelled => {
            println!(
                "Run {} cancelled. Resume it with: drover resume {}",
                progress.workflow_id, progress.workflow_id
            );
            std::process::exit(130);
        }
        other => {
            println!("Run {} ended with status {}", progress.workflow_id, other);
        }
    }
}

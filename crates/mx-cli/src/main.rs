//! `muskox` — run and inspect coding-agent workflows from the shell.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use uuid::Uuid;

use mx_agents::workflow::WorkflowRunner;
use mx_core::checkpoint::CheckpointStore;
use mx_core::config::AgentSettings;
use mx_core::git::ShellGit;
use mx_core::ledger::ActivityLedger;
use mx_core::types::RunRequest;
use mx_harness::openrouter::OpenRouterProvider;

#[derive(Parser)]
#[command(
    name = "muskox",
    version,
    about = "Durable workflow runner for an autonomous coding agent"
)]
struct Cli {
    /// Settings file (TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding checkpoints, workdirs and the activity ledger.
    #[arg(long, global = true, default_value = ".muskox")]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute (or resume) a workflow run from a request file.
    Run {
        /// JSON file with the task and repository target.
        request: PathBuf,
    },
    /// Print the checkpoint recorded for a run.
    Checkpoint { run_id: Uuid },
    /// List recorded activities for a task.
    Activities { task_id: Uuid },
    /// Validate the settings file and print the effective configuration.
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let settings = load_settings(cli.config.as_deref())?;

    match cli.command {
        Command::Run { request } => run(settings, &cli.state_dir, &request).await,
        Command::Checkpoint { run_id } => show_checkpoint(&cli.state_dir, run_id),
        Command::Activities { task_id } => list_activities(&cli.state_dir, task_id),
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

fn load_settings(path: Option<&Path>) -> Result<AgentSettings> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read settings file {}", path.display()))?;
            AgentSettings::from_toml_str(&raw)
                .with_context(|| format!("invalid settings file {}", path.display()))
        }
        None => Ok(AgentSettings::default()),
    }
}

async fn run(settings: AgentSettings, state_dir: &Path, request_path: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(request_path)
        .with_context(|| format!("cannot read request file {}", request_path.display()))?;
    let request: RunRequest = serde_json::from_str(&raw).context("invalid run request")?;

    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("cannot create state dir {}", state_dir.display()))?;
    let provider = OpenRouterProvider::from_env(settings.model.clone(), settings.llm_timeout())
        .context("no LLM provider available")?;
    let git = ShellGit::new(settings.git_timeout());
    let ledger = ActivityLedger::open(&state_dir.join("activities.db"))
        .context("cannot open activity ledger")?;

    let runner = WorkflowRunner::new(
        settings,
        Arc::new(provider),
        Arc::new(git),
        CheckpointStore::new(state_dir.join("checkpoints")),
        state_dir.join("work"),
    )
    .with_ledger(Arc::new(ledger));

    // Ctrl-C requests cancellation; the run stops at the next boundary.
    let cancel = runner.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("cancellation requested");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let report = runner.run(request).await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.success {
        bail!(
            "run failed: {}",
            report.error_message.unwrap_or_else(|| "unknown error".into())
        );
    }
    Ok(())
}

fn show_checkpoint(state_dir: &Path, run_id: Uuid) -> Result<()> {
    let store = CheckpointStore::new(state_dir.join("checkpoints"));
    match store.load(&run_id)? {
        Some(state) => {
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(())
        }
        None => bail!("no checkpoint for run {run_id}"),
    }
}

fn list_activities(state_dir: &Path, task_id: Uuid) -> Result<()> {
    let ledger = ActivityLedger::open(&state_dir.join("activities.db"))
        .context("cannot open activity ledger")?;
    let rows = ledger.for_task(&task_id)?;
    if rows.is_empty() {
        println!("no activities recorded for task {task_id}");
        return Ok(());
    }
    for row in rows {
        println!(
            "{}  {:<13}  {}",
            row.timestamp.format("%Y-%m-%d %H:%M:%S"),
            row.kind.as_str(),
            row.message
        );
    }
    Ok(())
}

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{debug, info};

use sift::config::Config;
use sift::core::artifact::{ArtifactStore, FileArtifactStore};
use sift::core::plan::Plan;
use sift::journal::{CheckpointStore, Chronolog, FileCheckpointStore};
use sift::orchestration::{
    CommandService, RunContext, RunStores, Scheduler, SchedulerEvent, StatePaths,
};
use sift::Result;

/// Sift - resumable multi-agent analysis pipeline
#[derive(Parser, Debug)]
#[command(name = "sift")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    SIFT_DEBUG=1    Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.sift/sift.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Configuration file (defaults to ~/.sift/sift.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a plan, resuming from any checkpoints in the state directory
    Run {
        /// Plan document (JSON, or TOML by extension)
        plan: PathBuf,

        /// State directory (defaults to ~/.sift/state/<run_id>)
        #[arg(long)]
        state_dir: Option<PathBuf>,

        /// Override pool.max_workers
        #[arg(long, short = 'w')]
        workers: Option<usize>,
    },

    /// Verify the chronolog hash chain
    Verify {
        #[arg(long)]
        state_dir: PathBuf,
    },

    /// List checkpoint records
    Status {
        #[arg(long)]
        state_dir: PathBuf,
    },

    /// Print an artifact by content hash
    Show {
        hash: String,

        #[arg(long)]
        state_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_file = if cli.debug {
        Some(Config::sift_dir()?.join("sift.log"))
    } else {
        None
    };
    sift::log::init_with_debug(cli.debug, log_file.as_deref());

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Run {
            plan,
            state_dir,
            workers,
        } => run_plan(config, &plan, state_dir, workers).await,
        Command::Verify { state_dir } => run_verify(&state_dir),
        Command::Status { state_dir } => run_status(&state_dir),
        Command::Show { hash, state_dir } => run_show(&state_dir, &hash),
    }
}

async fn run_plan(
    mut config: Config,
    plan_path: &Path,
    state_dir: Option<PathBuf>,
    workers: Option<usize>,
) -> Result<()> {
    let plan = Plan::load(plan_path)?;
    if let Some(workers) = workers {
        config.pool.max_workers = workers;
        config.validate()?;
    }
    let state_dir = match state_dir {
        Some(dir) => dir,
        None => Config::default_state_dir()?.join(&plan.run_id),
    };
    info!(run_id = plan.run_id.as_str(), state_dir = %state_dir.display(), "Run command");

    let service = Arc::new(CommandService::from_config(&config.service)?);
    let stores = RunStores::open(&state_dir)?;
    let ctx = Arc::new(RunContext::new(plan.run_id.clone(), config, stores, service));

    let (tx, mut rx) = mpsc::channel(256);
    let observer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                SchedulerEvent::TaskFailed { task_id, error } => {
                    eprintln!("  failed     {} ({})", task_id, error)
                }
                SchedulerEvent::TaskCancelled { task_id, reason } => {
                    eprintln!("  cancelled  {} ({})", task_id, reason)
                }
                SchedulerEvent::TaskCompleted { task_id, .. } => {
                    eprintln!("  completed  {}", task_id)
                }
                other => debug!(?other, "scheduler event"),
            }
        }
    });

    let result = Scheduler::new(&plan, ctx)?.with_events(tx).run().await;
    let _ = observer.await;

    let report = result?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_verify(state_dir: &Path) -> Result<()> {
    let paths = StatePaths::new(state_dir);
    let count = Chronolog::verify_file(&paths.chronolog)?;
    println!("chronolog OK: {} entries", count);
    Ok(())
}

fn run_status(state_dir: &Path) -> Result<()> {
    let paths = StatePaths::new(state_dir);
    let store = FileCheckpointStore::open(&paths.checkpoints)?;
    let records = store.all()?;
    if records.is_empty() {
        println!("No checkpoints.");
        return Ok(());
    }
    for record in records {
        let hash = record
            .artifact_hash
            .as_deref()
            .map(|h| &h[..h.len().min(12)])
            .unwrap_or("-");
        println!(
            "{:<40} {:<10} {:<12} {}",
            record.key,
            record.status.to_string(),
            hash,
            record.completed_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn run_show(state_dir: &Path, hash: &str) -> Result<()> {
    let paths = StatePaths::new(state_dir);
    let store = FileArtifactStore::open(&paths.artifacts)?;
    let bytes = store.get(hash)?;
    match serde_json::from_slice::<serde_json::Value>(&bytes) {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(_) => println!("{}", String::from_utf8_lossy(&bytes)),
    }
    Ok(())
}

//! Per-run state shared by the scheduler and workers.
//!
//! Nothing here is global: cancellation, budget and stores live on a
//! [`RunContext`] passed to every handler, so several runs can coexist in
//! one process.

use crate::config::Config;
use crate::core::artifact::{ArtifactStore, FileArtifactStore, MemoryArtifactStore};
use crate::error::{Error, Result};
use crate::journal::{
    CheckpointStore, Chronolog, ChronologEntry, ChronologEvent, FileCheckpointStore,
    MemoryCheckpointStore,
};
use crate::orchestration::retry::RetryPolicy;
use crate::orchestration::service::AnalysisService;
use crate::pipeline::extraction::{HeuristicRepair, Repair};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const CHRONOLOG_FILE: &str = "chronolog.ndjson";
pub const CHECKPOINT_FILE: &str = "checkpoints.ndjson";
pub const ARTIFACT_DIR: &str = "artifacts";

/// The durable stores of one run.
pub struct RunStores {
    pub chronolog: Chronolog,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
}

impl RunStores {
    /// Open (or create) the stores under a state directory.
    ///
    /// Fails with an integrity violation if the existing chronolog does not
    /// verify.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let paths = StatePaths::new(dir);
        Ok(Self {
            chronolog: Chronolog::open(&paths.chronolog)?,
            checkpoints: Arc::new(FileCheckpointStore::open(&paths.checkpoints)?),
            artifacts: Arc::new(FileArtifactStore::open(&paths.artifacts)?),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            chronolog: Chronolog::in_memory(),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            artifacts: Arc::new(MemoryArtifactStore::new()),
        }
    }
}

/// File locations inside a state directory.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub chronolog: PathBuf,
    pub checkpoints: PathBuf,
    pub artifacts: PathBuf,
}

impl StatePaths {
    pub fn new(dir: &Path) -> Self {
        Self {
            chronolog: dir.join(CHRONOLOG_FILE),
            checkpoints: dir.join(CHECKPOINT_FILE),
            artifacts: dir.join(ARTIFACT_DIR),
        }
    }
}

pub struct RunContext {
    pub run_id: String,
    pub config: Config,
    pub retry: RetryPolicy,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub service: Arc<dyn AnalysisService>,
    pub repair: Arc<dyn Repair>,
    chronolog: Mutex<Chronolog>,
    cancel: CancellationToken,
    cancel_reason: OnceLock<String>,
    external_calls: AtomicU64,
}

impl RunContext {
    pub fn new(
        run_id: impl Into<String>,
        config: Config,
        stores: RunStores,
        service: Arc<dyn AnalysisService>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            retry: RetryPolicy::from_config(&config.retry),
            config,
            checkpoints: stores.checkpoints,
            artifacts: stores.artifacts,
            service,
            repair: Arc::new(HeuristicRepair),
            chronolog: Mutex::new(stores.chronolog),
            cancel: CancellationToken::new(),
            cancel_reason: OnceLock::new(),
            external_calls: AtomicU64::new(0),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_repair(mut self, repair: Arc<dyn Repair>) -> Self {
        self.repair = repair;
        self
    }

    /// Append an event to the chronolog. Appends are serialized.
    pub async fn record(&self, event: ChronologEvent) -> Result<()> {
        let mut chronolog = self.chronolog.lock().await;
        let entry = chronolog.append(&event)?;
        debug!(seq = entry.seq, event = entry.event_type.as_str(), "chronolog append");
        Ok(())
    }

    pub async fn chronolog_entries(&self) -> Vec<ChronologEntry> {
        self.chronolog.lock().await.entries().to_vec()
    }

    /// Set the run-scoped cancellation flag. The first reason wins.
    pub fn cancel(&self, reason: &str) {
        if self.cancel_reason.set(reason.to_string()).is_ok() {
            warn!(run_id = self.run_id.as_str(), reason, "run cancelled");
        }
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.get().map(String::as_str)
    }

    /// Count one external call against the budget.
    pub fn charge_call(&self) -> Result<()> {
        let used = self.external_calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.config.budget.max_external_calls {
            Some(limit) if used > limit => {
                self.external_calls.fetch_sub(1, Ordering::SeqCst);
                Err(Error::ResourceExhaustion {
                    limit,
                    used: used - 1,
                })
            }
            _ => Ok(()),
        }
    }

    pub fn external_calls(&self) -> u64 {
        self.external_calls.load(Ordering::SeqCst)
    }
}

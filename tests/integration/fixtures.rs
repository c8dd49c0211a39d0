//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scripted analysis service with per-call accounting
//! - A checkpoint store that simulates a crash after N writes
//! - Plan builders and run helpers over a temporary state directory

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use sift::config::Config;
use sift::core::artifact::{get_json, FileArtifactStore};
use sift::core::plan::{Plan, TaskSpec};
use sift::core::task::{TaskId, TaskType};
use sift::journal::{
    CheckpointRecord, CheckpointStore, Chronolog, ChronologEntry, FileCheckpointStore,
};
use sift::orchestration::{
    AnalysisService, RetryPolicy, RunContext, RunReport, RunStores, Scheduler, ServiceError,
    StatePaths,
};
use sift::pipeline::SynthesisReport;
use sift::{Error, Result};

/// Text every plan analyzes.
pub const PAPER: &str = "We enrolled 1200 participants across twelve sites in a randomized, \
double-blind trial with preregistered outcomes. Attrition was below five percent.";

/// A verified quote of at least sixty characters from [`PAPER`].
pub const LONG_QUOTE: &str =
    "We enrolled 1200 participants across twelve sites in a randomized, double-blind trial";

// ========== Scripted Service ==========

/// One observed external call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallRecord {
    pub agent_id: String,
    pub mode: String,
    pub payload: String,
}

/// Analysis service answering from per-agent scripts.
///
/// Analysis calls return the agent's scripted analysis, defense calls
/// (`params.mode == "defense"`) its scripted defense. Failures can be
/// injected per agent, either a fixed number of transient failures or a
/// permanent rejection.
#[derive(Default)]
pub struct ScriptedService {
    analyses: HashMap<String, String>,
    defenses: HashMap<String, String>,
    transient_failures: Mutex<HashMap<String, u32>>,
    rejected: HashSet<String>,
    delays: HashMap<String, Duration>,
    calls: Mutex<Vec<CallRecord>>,
}

impl ScriptedService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn analysis(mut self, agent_id: &str, response: &str) -> Self {
        self.analyses.insert(agent_id.to_string(), response.to_string());
        self
    }

    /// Shorthand for an analysis scoring the given dimensions.
    pub fn scores(self, agent_id: &str, scores: &[(&str, f64)]) -> Self {
        let scores: serde_json::Map<String, Value> =
            scores.iter().map(|(d, v)| (d.to_string(), json!(v))).collect();
        let response = json!({ "scores": scores, "evidence": [LONG_QUOTE] }).to_string();
        self.analysis(agent_id, &response)
    }

    pub fn defense(mut self, agent_id: &str, value: f64, citations: &[&str]) -> Self {
        let response = json!({
            "value": value,
            "citations": citations,
            "rationale": format!("{} stands by {}", agent_id, value),
        })
        .to_string();
        self.defenses.insert(agent_id.to_string(), response);
        self
    }

    pub fn fail_transiently(self, agent_id: &str, times: u32) -> Self {
        if let Ok(mut failures) = self.transient_failures.lock() {
            failures.insert(agent_id.to_string(), times);
        }
        self
    }

    pub fn reject(mut self, agent_id: &str) -> Self {
        self.rejected.insert(agent_id.to_string());
        self
    }

    /// Delay every response from `agent_id`.
    pub fn slow(mut self, agent_id: &str, delay: Duration) -> Self {
        self.delays.insert(agent_id.to_string(), delay);
        self
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_in_mode(&self, mode: &str) -> usize {
        self.calls().iter().filter(|c| c.mode == mode).count()
    }

    /// Calls that repeat an earlier (agent, mode, payload) triple.
    pub fn duplicate_calls(&self) -> usize {
        let calls = self.calls();
        let unique: HashSet<&CallRecord> = calls.iter().collect();
        calls.len() - unique.len()
    }
}

#[async_trait]
impl AnalysisService for ScriptedService {
    async fn call(
        &self,
        agent_id: &str,
        payload: &str,
        params: &Value,
    ) -> std::result::Result<String, ServiceError> {
        let mode = params
            .get("mode")
            .and_then(Value::as_str)
            .unwrap_or("analysis")
            .to_string();
        self.calls.lock().unwrap().push(CallRecord {
            agent_id: agent_id.to_string(),
            mode: mode.clone(),
            payload: payload.to_string(),
        });

        if let Some(delay) = self.delays.get(agent_id) {
            tokio::time::sleep(*delay).await;
        }
        if self.rejected.contains(agent_id) {
            return Err(ServiceError::Rejected(format!("{} refused the request", agent_id)));
        }
        {
            let mut failures = self.transient_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(agent_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ServiceError::RateLimited("429 Too Many Requests".into()));
                }
            }
        }

        let script = if mode == "defense" {
            &self.defenses
        } else {
            &self.analyses
        };
        script
            .get(agent_id)
            .cloned()
            .ok_or_else(|| ServiceError::Rejected(format!("no script for {} ({})", agent_id, mode)))
    }
}

// ========== Crash Injection ==========

/// File-backed checkpoint store that fails every new write after `budget`
/// successful ones, as if the process died at that point.
///
/// Repeats of an already-recorded state pass through, since they never
/// touch the disk.
pub struct CrashingCheckpointStore {
    inner: FileCheckpointStore,
    budget: usize,
    writes: AtomicUsize,
}

impl CrashingCheckpointStore {
    pub fn open(path: &Path, budget: usize) -> Result<Self> {
        Ok(Self {
            inner: FileCheckpointStore::open(path)?,
            budget,
            writes: AtomicUsize::new(0),
        })
    }
}

impl CheckpointStore for CrashingCheckpointStore {
    fn get(&self, key: &str) -> Result<Option<CheckpointRecord>> {
        self.inner.get(key)
    }

    fn put(&self, record: CheckpointRecord) -> Result<bool> {
        let repeat = matches!(
            self.inner.get(&record.key)?,
            Some(existing) if existing.status == record.status
                && existing.artifact_hash == record.artifact_hash
        );
        if !repeat && self.writes.fetch_add(1, Ordering::SeqCst) >= self.budget {
            return Err(Error::Storage(format!("injected crash writing {}", record.key)));
        }
        self.inner.put(record)
    }

    fn all(&self) -> Result<Vec<CheckpointRecord>> {
        self.inner.all()
    }
}

/// Stores under `dir` whose checkpoint store crashes after `budget` writes.
pub fn crashing_stores(dir: &Path, budget: usize) -> RunStores {
    let paths = StatePaths::new(dir);
    RunStores {
        chronolog: Chronolog::open(&paths.chronolog).unwrap(),
        checkpoints: Arc::new(CrashingCheckpointStore::open(&paths.checkpoints, budget).unwrap()),
        artifacts: Arc::new(FileArtifactStore::open(&paths.artifacts).unwrap()),
    }
}

// ========== Plans ==========

pub fn task(id: &str, task_type: TaskType, deps: &[&str], config: Value) -> TaskSpec {
    TaskSpec {
        task_id: TaskId::new(id),
        task_type,
        depends_on: deps.iter().map(|d| TaskId::new(*d)).collect(),
        config,
    }
}

pub fn analyze(id: &str, input_id: &str, agent_id: &str) -> TaskSpec {
    task(
        id,
        TaskType::Analyze,
        &[],
        json!({ "input_id": input_id, "agent_id": agent_id, "input_text": PAPER }),
    )
}

pub fn plan(tasks: Vec<TaskSpec>) -> Plan {
    let plan = Plan {
        run_id: "it-run".to_string(),
        tasks,
    };
    plan.validate().unwrap();
    plan
}

/// Analyze with each agent, extract, gate, then synthesize.
pub fn gated_plan(agents: &[&str]) -> Plan {
    let mut tasks: Vec<TaskSpec> = agents
        .iter()
        .map(|agent| analyze(&format!("analyze-{}", agent), "p1", agent))
        .collect();
    let analyses: Vec<String> = tasks.iter().map(|t| t.task_id.to_string()).collect();
    let analyses: Vec<&str> = analyses.iter().map(String::as_str).collect();
    tasks.push(task("extract", TaskType::Extract, &analyses, Value::Null));
    tasks.push(task("gate", TaskType::QualityGate, &["extract"], Value::Null));
    tasks.push(task("synthesize", TaskType::Synthesize, &["gate", "extract"], Value::Null));
    plan(tasks)
}

/// The full ensemble pipeline over two agents.
pub fn ensemble_plan(formula: &str) -> Plan {
    plan(vec![
        analyze("analyze-alpha", "p1", "alpha"),
        analyze("analyze-beta", "p1", "beta"),
        task(
            "extract",
            TaskType::Extract,
            &["analyze-alpha", "analyze-beta"],
            Value::Null,
        ),
        task("gate", TaskType::QualityGate, &["extract"], Value::Null),
        task("divergence", TaskType::Divergence, &["extract"], Value::Null),
        task("arbitrate", TaskType::Arbitrate, &["divergence"], Value::Null),
        task(
            "calculate",
            TaskType::Calculate,
            &["extract", "arbitrate"],
            json!({ "formulas": [{ "name": "overall", "expression": formula }] }),
        ),
        task(
            "synthesize",
            TaskType::Synthesize,
            &["gate", "extract", "divergence", "arbitrate", "calculate"],
            Value::Null,
        ),
    ])
}

// ========== Running ==========

/// A temporary state directory shared by successive "processes".
pub struct StateDir {
    pub temp_dir: TempDir,
}

impl StateDir {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn paths(&self) -> StatePaths {
        StatePaths::new(self.path())
    }

    pub fn open(&self) -> RunStores {
        RunStores::open(self.path()).unwrap()
    }

    pub fn chronolog(&self) -> Vec<ChronologEntry> {
        Chronolog::open(&self.paths().chronolog)
            .unwrap()
            .entries()
            .to_vec()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.chronolog().into_iter().map(|e| e.event_type).collect()
    }

    pub fn checkpoint(&self, key: &str) -> Option<CheckpointRecord> {
        FileCheckpointStore::open(&self.paths().checkpoints)
            .unwrap()
            .get(key)
            .unwrap()
    }

    pub fn synthesis(&self, hash: &str) -> SynthesisReport {
        let store = FileArtifactStore::open(&self.paths().artifacts).unwrap();
        get_json(&store, hash).unwrap()
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.pool.max_workers = 1;
    config
}

/// Run `plan` to completion as one process.
pub async fn run(
    plan: &Plan,
    config: Config,
    stores: RunStores,
    service: Arc<ScriptedService>,
) -> Result<RunReport> {
    let ctx = RunContext::new(plan.run_id.clone(), config, stores, service)
        .with_retry(RetryPolicy::immediate(3));
    Scheduler::new(plan, Arc::new(ctx))?.run().await
}

//! Scheduler for plan execution.
//!
//! The Scheduler mirrors the checkpoint store into the DAG at startup,
//! dispatches ready tasks to the worker pool up to capacity, and applies
//! each worker outcome: checkpoint first, then DAG state, then chronolog.
//! Failures cancel downstream tasks, a TERMINATE verdict cancels the run,
//! and fatal errors stop dispatch and surface once in-flight work drains.

use crate::core::artifact::get_json;
use crate::core::dag::TaskDAG;
use crate::core::plan::Plan;
use crate::core::task::{TaskId, TaskStatus, TaskType};
use crate::error::{Error, Result};
use crate::journal::{CheckpointRecord, CheckpointStatus, ChronologEvent};
use crate::orchestration::context::RunContext;
use crate::orchestration::handlers::{run_task, DependencyArtifact, TaskOutcome};
use crate::orchestration::pool::{WorkerEvent, WorkerPool};
use crate::orchestration::recovery::{reconcile, RecoveryReport};
use crate::pipeline::records::{GateDecision, QualityGateVerdict};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

pub const UPSTREAM_FAILURE: &str = "upstream failure";

/// Events emitted by the scheduler for task lifecycle changes.
///
/// The receiver must be drained; sends wait for channel capacity.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    TaskDispatched { task_id: TaskId },
    TaskCompleted { task_id: TaskId, artifact_hash: Option<String> },
    TaskFailed { task_id: TaskId, error: String },
    TaskCancelled { task_id: TaskId, reason: String },
    RunFinished { outcome: RunOutcome },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every task completed.
    Completed,
    /// A quality gate stopped the run.
    Terminated { reason: String },
    /// Some task failed or was cancelled by an upstream failure.
    Failed,
}

impl RunOutcome {
    pub fn label(&self) -> String {
        match self {
            RunOutcome::Completed => "completed".to_string(),
            RunOutcome::Terminated { reason } => format!("terminated: {}", reason),
            RunOutcome::Failed => "failed".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub outcome: RunOutcome,
    pub statuses: BTreeMap<TaskId, TaskStatus>,
    /// Artifact of the last completed synthesis task.
    pub final_artifact: Option<String>,
    /// External calls issued by this process.
    pub external_calls: u64,
}

pub struct Scheduler {
    ctx: Arc<RunContext>,
    dag: TaskDAG,
    plan_hash: String,
    event_tx: Option<mpsc::Sender<SchedulerEvent>>,
    terminated: Option<String>,
}

impl Scheduler {
    /// Build a scheduler for a validated plan.
    pub fn new(plan: &Plan, ctx: Arc<RunContext>) -> Result<Self> {
        plan.validate()?;
        Ok(Self {
            dag: TaskDAG::from_plan(plan)?,
            plan_hash: plan.digest()?,
            ctx,
            event_tx: None,
            terminated: None,
        })
    }

    pub fn with_events(mut self, event_tx: mpsc::Sender<SchedulerEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn dag(&self) -> &TaskDAG {
        &self.dag
    }

    pub fn context(&self) -> &Arc<RunContext> {
        &self.ctx
    }

    async fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event).await;
        }
    }

    // ========== Startup ==========

    /// Adopt completed tasks from the checkpoint store.
    ///
    /// A completed quality gate whose verdict was TERMINATE re-applies the
    /// termination, so a resumed run stops where the original did.
    pub async fn restore(&mut self) -> Result<usize> {
        let mut restored = 0;
        let mut termination = None;
        for record in self.ctx.checkpoints.all()? {
            if record.status != CheckpointStatus::Completed {
                continue;
            }
            let id = TaskId::new(record.key.as_str());
            let Some(task) = self.dag.get_task_mut(&id) else {
                continue;
            };
            task.restore(TaskStatus::Completed, record.artifact_hash.clone())?;
            restored += 1;

            if task.task_type == TaskType::QualityGate {
                if let Some(hash) = &record.artifact_hash {
                    let verdict: QualityGateVerdict =
                        get_json(self.ctx.artifacts.as_ref(), hash)?;
                    if verdict.decision == GateDecision::Terminate {
                        termination = Some(verdict.reason);
                    }
                }
            }
        }
        if let Some(reason) = termination {
            self.terminate(&reason).await?;
        }
        Ok(restored)
    }

    // ========== Dispatch ==========

    fn dependencies_of(&self, id: &TaskId) -> Vec<DependencyArtifact> {
        let mut deps: Vec<DependencyArtifact> = self
            .dag
            .get_dependencies(id)
            .into_iter()
            .map(|t| DependencyArtifact {
                task_id: t.id.clone(),
                task_type: t.task_type,
                artifact_hash: t.artifact_hash.clone(),
            })
            .collect();
        deps.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        deps
    }

    /// Dispatch ready tasks up to the pool's capacity.
    ///
    /// Returns the number of tasks dispatched. Nothing is dispatched once
    /// the run is cancelled.
    pub async fn dispatch_ready_tasks(&mut self, pool: &mut WorkerPool<TaskOutcome>) -> Result<usize> {
        if self.ctx.is_cancelled() {
            return Ok(0);
        }
        let ready: Vec<TaskId> = self.dag.ready_tasks().iter().map(|t| t.id.clone()).collect();
        let mut dispatched = 0;

        for task_id in ready {
            if !pool.has_capacity() {
                break;
            }
            let Some(config) = self.dag.get_task(&task_id).map(|t| t.config.clone()) else {
                continue;
            };
            let deps = self.dependencies_of(&task_id);

            self.dag.transition(&task_id, TaskStatus::Dispatched)?;
            self.ctx
                .record(ChronologEvent::TaskDispatched {
                    task_id: task_id.to_string(),
                })
                .await?;

            let ctx = Arc::clone(&self.ctx);
            let id = task_id.clone();
            let worker_id = pool.spawn(task_id.clone(), async move {
                run_task(ctx, id, config, deps).await
            })?;
            self.dag.transition(&task_id, TaskStatus::Running)?;
            info!(task_id = task_id.as_str(), %worker_id, "task dispatched");

            self.emit(SchedulerEvent::TaskDispatched { task_id }).await;
            dispatched += 1;
        }
        Ok(dispatched)
    }

    // ========== Outcomes ==========

    async fn handle_outcome(&mut self, task_id: TaskId, result: Result<TaskOutcome>) -> Result<()> {
        match result {
            Ok(TaskOutcome::Completed { artifact_hash }) => {
                if self.ctx.is_cancelled() && !self.already_completed(&task_id)? {
                    let reason = self.cancel_reason();
                    self.cancel_task(&task_id, artifact_hash, &reason).await
                } else {
                    self.complete_task(&task_id, artifact_hash).await
                }
            }
            Ok(TaskOutcome::Cancelled {
                artifact_hash,
                reason,
            }) => self.cancel_task(&task_id, artifact_hash, &reason).await,
            Ok(TaskOutcome::Terminate {
                artifact_hash,
                reason,
            }) => {
                self.complete_task(&task_id, Some(artifact_hash)).await?;
                self.terminate(&reason).await
            }
            Err(e) if e.is_fatal() => {
                error!(task_id = task_id.as_str(), kind = %e.kind(), error = %e, "fatal error");
                self.dag.transition(
                    &task_id,
                    TaskStatus::Failed {
                        error: e.to_string(),
                    },
                )?;
                self.emit(SchedulerEvent::TaskFailed {
                    task_id,
                    error: e.to_string(),
                })
                .await;
                Err(e)
            }
            Err(e) => self.fail_task(&task_id, &e).await,
        }
    }

    fn already_completed(&self, task_id: &TaskId) -> Result<bool> {
        Ok(matches!(
            self.ctx.checkpoints.get(task_id.as_str())?,
            Some(r) if r.status == CheckpointStatus::Completed
        ))
    }

    fn cancel_reason(&self) -> String {
        self.ctx
            .cancel_reason()
            .unwrap_or("run cancelled")
            .to_string()
    }

    async fn complete_task(&mut self, task_id: &TaskId, artifact_hash: Option<String>) -> Result<()> {
        self.ctx
            .checkpoints
            .put(CheckpointRecord::completed(task_id.as_str(), artifact_hash.clone()))?;
        if let Some(task) = self.dag.get_task_mut(task_id) {
            task.complete(artifact_hash.clone())?;
        }
        self.ctx
            .record(ChronologEvent::TaskCompleted {
                task_id: task_id.to_string(),
                artifact_hash: artifact_hash.clone(),
            })
            .await?;
        info!(task_id = task_id.as_str(), "task completed");
        self.emit(SchedulerEvent::TaskCompleted {
            task_id: task_id.clone(),
            artifact_hash,
        })
        .await;
        Ok(())
    }

    async fn cancel_task(
        &mut self,
        task_id: &TaskId,
        artifact_hash: Option<String>,
        reason: &str,
    ) -> Result<()> {
        self.put_cancelled(task_id, artifact_hash, reason)?;
        if let Some(task) = self.dag.get_task_mut(task_id) {
            if !task.is_finished() {
                task.cancel(reason)?;
            }
        }
        self.record_cancelled(task_id, reason).await
    }

    /// Write a Cancelled checkpoint, keeping any response hash already
    /// recorded for the task.
    fn put_cancelled(&self, task_id: &TaskId, artifact_hash: Option<String>, reason: &str) -> Result<()> {
        let artifact_hash = match artifact_hash {
            Some(hash) => Some(hash),
            None => self
                .ctx
                .checkpoints
                .get(task_id.as_str())?
                .filter(|r| r.status == CheckpointStatus::Cancelled)
                .and_then(|r| r.artifact_hash),
        };
        self.ctx.checkpoints.put(CheckpointRecord::cancelled(
            task_id.as_str(),
            artifact_hash,
            reason,
        ))?;
        Ok(())
    }

    async fn record_cancelled(&self, task_id: &TaskId, reason: &str) -> Result<()> {
        self.ctx
            .record(ChronologEvent::TaskCancelled {
                task_id: task_id.to_string(),
                reason: reason.to_string(),
            })
            .await?;
        info!(task_id = task_id.as_str(), reason, "task cancelled");
        self.emit(SchedulerEvent::TaskCancelled {
            task_id: task_id.clone(),
            reason: reason.to_string(),
        })
        .await;
        Ok(())
    }

    /// Mark a task failed and cancel everything downstream of it.
    async fn fail_task(&mut self, task_id: &TaskId, err: &Error) -> Result<()> {
        let message = err.to_string();
        warn!(task_id = task_id.as_str(), kind = %err.kind(), error = message.as_str(), "task failed");
        self.ctx
            .checkpoints
            .put(CheckpointRecord::failed(task_id.as_str(), &message))?;
        self.dag.transition(
            task_id,
            TaskStatus::Failed {
                error: message.clone(),
            },
        )?;
        self.ctx
            .record(ChronologEvent::TaskFailed {
                task_id: task_id.to_string(),
                error: message.clone(),
            })
            .await?;
        self.emit(SchedulerEvent::TaskFailed {
            task_id: task_id.clone(),
            error: message,
        })
        .await;

        for dependent in self.dag.cancel_dependents(task_id, UPSTREAM_FAILURE)? {
            self.put_cancelled(&dependent, None, UPSTREAM_FAILURE)?;
            self.record_cancelled(&dependent, UPSTREAM_FAILURE).await?;
        }
        Ok(())
    }

    /// Cancel the run after a TERMINATE verdict.
    async fn terminate(&mut self, reason: &str) -> Result<()> {
        let failure = Error::SystematicQualityFailure {
            reason: reason.to_string(),
        };
        warn!(kind = %failure.kind(), "{}", failure);
        let cancel_reason = format!("quality gate terminated run: {}", reason);
        self.ctx.cancel(&cancel_reason);
        self.terminated = Some(reason.to_string());
        self.ctx
            .record(ChronologEvent::RunTerminated {
                reason: reason.to_string(),
            })
            .await?;

        for task_id in self.dag.cancel_pending(&cancel_reason)? {
            self.put_cancelled(&task_id, None, &cancel_reason)?;
            self.record_cancelled(&task_id, &cancel_reason).await?;
        }
        Ok(())
    }

    // ========== Run Loop ==========

    /// Run the plan to completion, termination, or a fatal error.
    ///
    /// # Errors
    ///
    /// Fatal errors (integrity, storage, resource exhaustion) are returned
    /// after in-flight workers have finished. Checkpoints are never removed.
    pub async fn run(mut self) -> Result<RunReport> {
        let recovery: RecoveryReport = reconcile(&self.ctx).await?;
        let resumed = !self.ctx.chronolog_entries().await.is_empty();
        let restored = self.restore().await?;
        let start = if resumed {
            ChronologEvent::RunResumed {
                run_id: self.ctx.run_id.clone(),
                completed: restored,
            }
        } else {
            ChronologEvent::RunStarted {
                run_id: self.ctx.run_id.clone(),
                plan_hash: self.plan_hash.clone(),
            }
        };
        self.ctx.record(start).await?;
        info!(
            run_id = self.ctx.run_id.as_str(),
            tasks = self.dag.task_count(),
            restored,
            materialized = recovery.materialized.len(),
            reissued = recovery.reissued.len(),
            "run started"
        );

        let (tx, mut rx) = mpsc::channel(64);
        let mut pool = WorkerPool::new(self.ctx.config.pool.max_workers, tx);
        let mut fatal: Option<Error> = None;

        loop {
            if fatal.is_none() {
                if let Err(e) = self.dispatch_ready_tasks(&mut pool).await {
                    error!(error = %e, "dispatch failed, draining workers");
                    fatal = Some(e);
                }
            }
            if pool.is_idle() {
                break;
            }
            let Some(WorkerEvent::Finished {
                worker_id,
                task_id,
                result,
            }) = rx.recv().await
            else {
                break;
            };
            pool.finish(&worker_id);
            if let Err(e) = self.handle_outcome(task_id, result).await {
                if fatal.is_none() {
                    error!(error = %e, "stopping dispatch, draining workers");
                    fatal = Some(e);
                }
            }
        }

        if let Some(e) = fatal {
            let _ = self
                .ctx
                .record(ChronologEvent::RunFinished {
                    outcome: format!("aborted: {}", e),
                })
                .await;
            return Err(e);
        }
        self.finish().await
    }

    async fn finish(&mut self) -> Result<RunReport> {
        let outcome = match &self.terminated {
            Some(reason) => RunOutcome::Terminated {
                reason: reason.clone(),
            },
            None if self.dag.all_tasks().iter().all(|t| t.is_completed()) => RunOutcome::Completed,
            None => RunOutcome::Failed,
        };
        let final_artifact = self
            .dag
            .topological_order()?
            .into_iter()
            .filter(|t| t.task_type == TaskType::Synthesize && t.is_completed())
            .last()
            .and_then(|t| t.artifact_hash.clone());

        self.ctx
            .record(ChronologEvent::RunFinished {
                outcome: outcome.label(),
            })
            .await?;
        info!(run_id = self.ctx.run_id.as_str(), outcome = outcome.label().as_str(), "run finished");
        self.emit(SchedulerEvent::RunFinished {
            outcome: outcome.clone(),
        })
        .await;

        Ok(RunReport {
            run_id: self.ctx.run_id.clone(),
            outcome,
            statuses: self.dag.statuses(),
            final_artifact,
            external_calls: self.ctx.external_calls(),
        })
    }
}

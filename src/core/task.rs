//! Task data model for the execution DAG.
//!
//! Tasks are the atomic units of a run. Each task tracks its type, its typed
//! configuration, its lifecycle status and the artifact it produced.

use crate::core::plan::TaskConfig;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a task, as declared in the plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The fixed set of task kinds a plan may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Analyze,
    Extract,
    QualityGate,
    Divergence,
    Arbitrate,
    Calculate,
    Synthesize,
}

impl TaskType {
    /// Downstream stages that must wait for every quality gate in the plan.
    pub fn behind_quality_barrier(&self) -> bool {
        matches!(self, TaskType::Calculate | TaskType::Synthesize)
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskType::Analyze => write!(f, "analyze"),
            TaskType::Extract => write!(f, "extract"),
            TaskType::QualityGate => write!(f, "quality_gate"),
            TaskType::Divergence => write!(f, "divergence"),
            TaskType::Arbitrate => write!(f, "arbitrate"),
            TaskType::Calculate => write!(f, "calculate"),
            TaskType::Synthesize => write!(f, "synthesize"),
        }
    }
}

/// Task status in its lifecycle.
///
/// `Pending -> Dispatched -> Running -> {Completed | Failed | Cancelled}`.
/// A pending task may also be cancelled directly (upstream failure or run
/// termination). Nothing leaves a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    Pending,
    /// Handed to the worker pool, not yet executing.
    Dispatched,
    Running,
    Completed,
    Failed {
        error: String,
    },
    Cancelled {
        reason: String,
    },
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed { .. } | TaskStatus::Cancelled { .. }
        )
    }

    /// Short lowercase label, without the error or reason payload.
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::Cancelled { .. } => "cancelled",
        }
    }

    pub fn can_transition_to(&self, next: &TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Pending, TaskStatus::Dispatched) => true,
            (TaskStatus::Pending, TaskStatus::Cancelled { .. }) => true,
            (TaskStatus::Dispatched, TaskStatus::Running) => true,
            (TaskStatus::Dispatched, TaskStatus::Cancelled { .. }) => true,
            (TaskStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            TaskStatus::Cancelled { reason } => write!(f, "cancelled: {}", reason),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// A single task in the execution DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    pub config: TaskConfig,
    pub status: TaskStatus,
    /// Hash of the artifact this task produced, if any.
    pub artifact_hash: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: TaskId, config: TaskConfig) -> Self {
        Self {
            id,
            task_type: config.task_type(),
            config,
            status: TaskStatus::Pending,
            artifact_hash: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Apply a status transition, rejecting anything the state machine forbids.
    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(&next) {
            return Err(Error::InvalidTransition {
                task: self.id.to_string(),
                from: self.status.label().to_string(),
                to: next.label().to_string(),
            });
        }
        match next {
            TaskStatus::Running => self.started_at = Some(Utc::now()),
            ref s if s.is_terminal() => self.completed_at = Some(Utc::now()),
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    pub fn dispatch(&mut self) -> Result<()> {
        self.transition(TaskStatus::Dispatched)
    }

    pub fn start(&mut self) -> Result<()> {
        self.transition(TaskStatus::Running)
    }

    pub fn complete(&mut self, artifact_hash: Option<String>) -> Result<()> {
        self.transition(TaskStatus::Completed)?;
        self.artifact_hash = artifact_hash;
        Ok(())
    }

    pub fn fail(&mut self, error: &str) -> Result<()> {
        self.transition(TaskStatus::Failed {
            error: error.to_string(),
        })
    }

    pub fn cancel(&mut self, reason: &str) -> Result<()> {
        self.transition(TaskStatus::Cancelled {
            reason: reason.to_string(),
        })
    }

    /// Adopt a terminal status restored from the checkpoint store.
    ///
    /// Only valid before the task has been dispatched in this process.
    pub fn restore(&mut self, status: TaskStatus, artifact_hash: Option<String>) -> Result<()> {
        if self.status != TaskStatus::Pending || !status.is_terminal() {
            return Err(Error::InvalidTransition {
                task: self.id.to_string(),
                from: self.status.label().to_string(),
                to: status.label().to_string(),
            });
        }
        self.status = status;
        self.artifact_hash = artifact_hash;
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

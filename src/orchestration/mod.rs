//! Orchestration layer for sift runs.
//!
//! The scheduler walks the task DAG and hands ready tasks to a bounded
//! worker pool. Workers run task handlers against a shared [`RunContext`],
//! which carries the durable stores, the external analysis service, the
//! retry policy, the call budget and the run's cancellation flag.

pub mod context;
pub mod handlers;
pub mod pool;
pub mod recovery;
pub mod retry;
pub mod scheduler;
pub mod service;

pub use context::{RunContext, RunStores, StatePaths};
pub use handlers::{run_task, DependencyArtifact, TaskOutcome};
pub use pool::{WorkerEvent, WorkerId, WorkerPool};
pub use recovery::{reconcile, RecoveryReport};
pub use retry::RetryPolicy;
pub use scheduler::{RunOutcome, RunReport, Scheduler, SchedulerEvent};
pub use service::{AnalysisService, CommandService, ServiceError};

//! Bounded pool of worker tasks.
//!
//! The `WorkerPool` runs task handlers on the tokio runtime, enforcing a
//! capacity limit. Each worker reports exactly one [`WorkerEvent::Finished`]
//! over the pool's channel, including when the handler panics.

use crate::core::task::TaskId;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::mpsc;
use tracing::{debug, error};
use uuid::Uuid;

/// Unique identifier for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 characters, for log lines.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.short())
    }
}

/// Events emitted by workers.
#[derive(Debug)]
pub enum WorkerEvent<T> {
    Finished {
        worker_id: WorkerId,
        task_id: TaskId,
        result: Result<T>,
    },
}

/// Manages a bounded set of concurrent workers.
///
/// # Example
///
/// ```ignore
/// let (tx, mut rx) = mpsc::channel(100);
/// let mut pool = WorkerPool::new(4, tx);
/// pool.spawn(TaskId::new("a"), async { Ok(1) })?;
/// let WorkerEvent::Finished { worker_id, result, .. } = rx.recv().await.unwrap();
/// pool.finish(&worker_id);
/// ```
pub struct WorkerPool<T> {
    active: HashMap<WorkerId, TaskId>,
    max_workers: usize,
    event_tx: mpsc::Sender<WorkerEvent<T>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(max_workers: usize, event_tx: mpsc::Sender<WorkerEvent<T>>) -> Self {
        Self {
            active: HashMap::new(),
            max_workers: max_workers.max(1),
            event_tx,
        }
    }

    /// Run `work` for `task_id` on a new worker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolFull`] if the pool is at capacity.
    pub fn spawn<F>(&mut self, task_id: TaskId, work: F) -> Result<WorkerId>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        if !self.has_capacity() {
            return Err(Error::PoolFull {
                max: self.max_workers,
            });
        }
        let worker_id = WorkerId::new();
        self.active.insert(worker_id, task_id.clone());
        debug!(%worker_id, task_id = task_id.as_str(), "worker started");

        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            // The inner spawn turns a handler panic into a JoinError.
            let result = match tokio::spawn(work).await {
                Ok(result) => result,
                Err(e) => {
                    error!(%worker_id, task_id = task_id.as_str(), error = %e, "worker panicked");
                    Err(Error::TaskJoin(e.to_string()))
                }
            };
            let _ = tx
                .send(WorkerEvent::Finished {
                    worker_id,
                    task_id,
                    result,
                })
                .await;
        });
        Ok(worker_id)
    }

    /// Release a worker's slot once its event has been handled.
    pub fn finish(&mut self, worker_id: &WorkerId) -> Option<TaskId> {
        self.active.remove(worker_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.active_count() < self.max_workers
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn is_running(&self, task_id: &TaskId) -> bool {
        self.active.values().any(|t| t == task_id)
    }
}

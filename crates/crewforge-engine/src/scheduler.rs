use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crewforge_core::error::{CrewError, Result};
use crewforge_core::types::TaskId;

struct Pending<T> {
    task_id: TaskId,
    index: usize,
    label: String,
    handle: JoinHandle<Result<T>>,
}

/// A resolved asynchronous task.
pub struct Resolved<T> {
    pub task_id: TaskId,
    pub index: usize,
    pub result: Result<T>,
}

/// Runs asynchronous tasks on a bounded worker pool.
///
/// Submitted work starts immediately (subject to the pool size) and is
/// awaited only when a consumer asks for it via [`resolve`](Self::resolve)
/// or [`drain`](Self::drain). Unresolved work is aborted on drop, which only
/// happens when the run itself fails.
pub struct AsyncScheduler<T> {
    permits: Arc<Semaphore>,
    pending: Vec<Pending<T>>,
}

impl<T: Send + 'static> AsyncScheduler<T> {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            pending: Vec::new(),
        }
    }

    /// Start `work` and return without waiting for it.
    pub fn submit<F>(&mut self, task_id: TaskId, index: usize, label: impl Into<String>, work: F)
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let permits = self.permits.clone();
        let label = label.into();
        debug!(task = %label, index, "Submitting asynchronous task");
        let handle = tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|e| CrewError::TaskExecution {
                    task: task_id.to_string(),
                    message: format!("worker pool closed: {}", e),
                })?;
            work.await
        });
        self.pending.push(Pending {
            task_id,
            index,
            label,
            handle,
        });
    }

    pub fn is_pending(&self, task_id: TaskId) -> bool {
        self.pending.iter().any(|p| p.task_id == task_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Await one submitted task. Returns None if it is not pending.
    pub async fn resolve(&mut self, task_id: TaskId) -> Option<Resolved<T>> {
        let pos = self.pending.iter().position(|p| p.task_id == task_id)?;
        let pending = self.pending.remove(pos);
        Some(join(pending).await)
    }

    /// Await every pending task in submission order.
    pub async fn drain(&mut self) -> Vec<Resolved<T>> {
        let mut resolved = Vec::with_capacity(self.pending.len());
        for pending in std::mem::take(&mut self.pending) {
            resolved.push(join(pending).await);
        }
        resolved
    }
}

async fn join<T>(pending: Pending<T>) -> Resolved<T> {
    let result = match pending.handle.await {
        Ok(result) => result,
        Err(e) => Err(CrewError::TaskExecution {
            task: pending.label,
            message: format!("asynchronous worker failed: {}", e),
        }),
    };
    Resolved {
        task_id: pending.task_id,
        index: pending.index,
        result,
    }
}

impl<T> Drop for AsyncScheduler<T> {
    fn drop(&mut self) {
        for pending in &self.pending {
            warn!(task = %pending.label, "Aborting unresolved asynchronous task");
            pending.handle.abort();
        }
    }
}

//! Bounded worker pool.
//!
//! Used twice: once by the scheduler for whole jobs, and once per upload for
//! part transfers. The two pools share nothing, so their limits stay independent.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{Id, JoinError, JoinSet};
use tracing::debug;

use crate::{Error, Result};

/// What a pool runs, used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerType {
    /// Whole job pipelines.
    Job,
    /// Multi-part upload parts of a single job.
    Part,
}

impl std::fmt::Display for WorkerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerType::Job => write!(f, "job"),
            WorkerType::Part => write!(f, "part"),
        }
    }
}

/// A set of tasks with at most `capacity` running at once.
///
/// A task holds its permit until it finishes, even if its result has not
/// been joined yet.
pub struct WorkerPool<T> {
    worker_type: WorkerType,
    capacity: usize,
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<T>,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(worker_type: WorkerType, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            worker_type,
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            tasks: JoinSet::new(),
        }
    }

    pub fn worker_type(&self) -> WorkerType {
        self.worker_type
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Tasks spawned and not yet joined.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for a free slot, then spawn `task` into it.
    ///
    /// Returns the task id, which [`WorkerPool::join_next_with_id`] reports
    /// back even when the task panics or is cancelled.
    pub async fn spawn<F>(&mut self, task: F) -> Result<Id>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal(format!("{} worker pool closed", self.worker_type)))?;

        let id = self
            .tasks
            .spawn(async move {
                let output = task.await;
                drop(permit);
                output
            })
            .id();
        debug!(
            pool = %self.worker_type,
            task_id = %id,
            in_flight = self.tasks.len(),
            "Spawned task"
        );
        Ok(id)
    }

    /// Next finished task, waiting if none has finished yet.
    pub async fn join_next(&mut self) -> Option<std::result::Result<T, JoinError>> {
        self.tasks.join_next().await
    }

    /// Like [`WorkerPool::join_next`], with the id of the finished task.
    pub async fn join_next_with_id(
        &mut self,
    ) -> Option<std::result::Result<(Id, T), JoinError>> {
        self.tasks.join_next_with_id().await
    }

    /// Next finished task without waiting.
    pub fn try_join_next(&mut self) -> Option<std::result::Result<T, JoinError>> {
        self.tasks.try_join_next()
    }

    /// Abort every running task and wait for them to stop.
    pub async fn shutdown(&mut self) {
        self.tasks.shutdown().await;
    }
}

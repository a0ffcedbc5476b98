//! Hand-off of terminal job outcomes to the embedding application.
//!
//! Sinks run after the job's state is final. Their failures are logged by the
//! scheduler and never change the job's outcome.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::Result;
use crate::pipeline::Job;

#[async_trait]
pub trait CompletionSink: Send + Sync {
    /// Called once per job after it reaches `Completed`.
    async fn job_completed(&self, job: &Job) -> Result<()>;

    /// Called once per job after it reaches `Failed`.
    async fn job_failed(&self, job: &Job) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct NoopSink;

#[async_trait]
impl CompletionSink for NoopSink {
    async fn job_completed(&self, _job: &Job) -> Result<()> {
        Ok(())
    }

    async fn job_failed(&self, _job: &Job) -> Result<()> {
        Ok(())
    }
}

/// Keeps every delivered job in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    completed: Mutex<Vec<Job>>,
    failed: Mutex<Vec<Job>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completed(&self) -> Vec<Job> {
        self.completed.lock().clone()
    }

    pub fn failed(&self) -> Vec<Job> {
        self.failed.lock().clone()
    }
}

#[async_trait]
impl CompletionSink for RecordingSink {
    async fn job_completed(&self, job: &Job) -> Result<()> {
        self.completed.lock().push(job.clone());
        Ok(())
    }

    async fn job_failed(&self, job: &Job) -> Result<()> {
        self.failed.lock().push(job.clone());
        Ok(())
    }
}

//! In-memory job registry and priority queue.
//!
//! Every job lives in the registry from submission until the purge service
//! evicts it. Waiting jobs are additionally referenced by the pending queue,
//! which the scheduler re-sorts and drains on each tick.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Notify, broadcast};
use tracing::{debug, info, warn};

use super::progress::{JobProgressSnapshot, JobProgressUpdate};
use crate::upload::UploadResult;
use crate::{Error, Result};

/// Identifier assigned at submission, strictly increasing.
pub type JobId = u64;

/// Configuration for the job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobQueueConfig {
    /// Warning threshold for queue depth.
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: usize,
    /// Critical threshold for queue depth.
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: usize,
}

fn default_warning_threshold() -> usize {
    100
}

fn default_critical_threshold() -> usize {
    500
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            warning_threshold: default_warning_threshold(),
            critical_threshold: default_critical_threshold(),
        }
    }
}

/// Status of queue depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueDepthStatus {
    /// Queue depth is normal.
    Normal,
    /// Queue depth is at warning level.
    Warning,
    /// Queue depth is at critical level.
    Critical,
}

/// Job priority.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Higher rank is dispatched first.
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 2,
            Priority::Normal => 1,
            Priority::Low => 0,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// Job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Job is queued, holding no resources.
    Waiting,
    /// Job is admitted and its pipeline is running.
    Active,
    /// Job completed successfully.
    Completed,
    /// Job failed terminally.
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Waiting, JobStatus::Active)
                | (JobStatus::Active, JobStatus::Completed)
                | (JobStatus::Active, JobStatus::Waiting)
                | (JobStatus::Active, JobStatus::Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Waiting => write!(f, "waiting"),
            JobStatus::Active => write!(f, "active"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Reference to the dataset a job archives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRef {
    /// External dataset identifier understood by the archive source.
    pub dataset_id: String,
    /// Number of instances in the dataset, when the caller knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_count: Option<u64>,
}

impl DatasetRef {
    pub fn new(dataset_id: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            instance_count: None,
        }
    }

    pub fn with_instance_count(mut self, count: u64) -> Self {
        self.instance_count = Some(count);
        self
    }
}

/// A job in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID.
    pub id: JobId,
    /// Dataset to archive.
    pub input: DatasetRef,
    /// Dispatch priority.
    pub priority: Priority,
    /// Current status.
    pub status: JobStatus,
    /// Overall progress in percent.
    pub progress: u8,
    /// Latest detailed progress of the current attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_detail: Option<JobProgressSnapshot>,
    /// Declared memory footprint used for admission, fixed at submission.
    pub memory_estimate: u64,
    /// Number of retries consumed so far.
    pub retry_count: u32,
    /// Retries allowed before the job fails.
    pub max_retries: u32,
    /// Number of times the job has been admitted.
    pub attempt: u32,
    /// When the job was submitted.
    pub created_at: DateTime<Utc>,
    /// When the job was first admitted.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// Upload result, only when completed.
    pub result: Option<UploadResult>,
    /// Last failure reason, only when failed.
    pub error: Option<String>,
    /// Time spent between first admission and the terminal transition.
    pub duration_secs: Option<f64>,
    /// Time spent waiting in queue before first admission.
    pub queue_wait_secs: Option<f64>,
}

impl Job {
    fn new(
        id: JobId,
        input: DatasetRef,
        priority: Priority,
        memory_estimate: u64,
        max_retries: u32,
    ) -> Self {
        Self {
            id,
            input,
            priority,
            status: JobStatus::Waiting,
            progress: 0,
            progress_detail: None,
            memory_estimate,
            retry_count: 0,
            max_retries,
            attempt: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            duration_secs: None,
            queue_wait_secs: None,
        }
    }

    fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    fn finish(&mut self) {
        let now = Utc::now();
        self.finished_at = Some(now);
        if let Some(started) = self.started_at {
            self.duration_secs = Some(((now - started).num_milliseconds() as f64 / 1000.0).max(0.0));
        }
    }
}

/// Lifecycle notifications broadcast by the queue.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Submitted { job_id: JobId, priority: Priority },
    Started { job_id: JobId, attempt: u32 },
    Requeued { job_id: JobId, retry_count: u32, error: String },
    Completed { job_id: JobId, size: u64 },
    Failed { job_id: JobId, error: String },
    Evicted { job_id: JobId },
}

/// Counts of jobs by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Head-of-queue view used by admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingJob {
    pub job_id: JobId,
    pub memory_estimate: u64,
    pub priority: Priority,
    seq: u64,
    /// Requeued after a transient failure; sorts ahead of every priority.
    retry_boost: bool,
}

/// The job registry and pending queue.
pub struct JobQueue {
    config: JobQueueConfig,
    next_id: AtomicU64,
    next_seq: AtomicU64,
    jobs: DashMap<JobId, Job>,
    pending: Mutex<VecDeque<PendingJob>>,
    notify: Arc<Notify>,
    event_tx: broadcast::Sender<JobEvent>,
}

impl JobQueue {
    /// Create a new job queue.
    pub fn new() -> Self {
        Self::with_config(JobQueueConfig::default())
    }

    /// Create a new job queue with custom configuration.
    pub fn with_config(config: JobQueueConfig) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            config,
            next_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(0),
            jobs: DashMap::new(),
            pending: Mutex::new(VecDeque::new()),
            notify: Arc::new(Notify::new()),
            event_tx,
        }
    }

    /// Register a new job in `Waiting` and append it to the pending queue.
    pub fn submit(
        &self,
        input: DatasetRef,
        priority: Priority,
        memory_estimate: u64,
        max_retries: u32,
    ) -> Job {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let job = Job::new(id, input, priority, memory_estimate, max_retries);

        self.jobs.insert(id, job.clone());
        self.pending.lock().push_back(PendingJob {
            job_id: id,
            memory_estimate,
            priority,
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            retry_boost: false,
        });

        info!(
            job_id = id,
            dataset_id = %job.input.dataset_id,
            %priority,
            memory_estimate,
            "Job submitted"
        );
        let _ = self.event_tx.send(JobEvent::Submitted {
            job_id: id,
            priority,
        });
        self.notify.notify_one();
        job
    }

    /// Get a job by ID.
    pub fn get(&self, id: JobId) -> Option<Job> {
        self.jobs.get(&id).map(|j| j.clone())
    }

    /// All jobs, ordered by ID.
    pub fn list_all(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.iter().map(|e| e.value().clone()).collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    pub fn counts(&self) -> JobCounts {
        let mut counts = JobCounts::default();
        for entry in self.jobs.iter() {
            match entry.status {
                JobStatus::Waiting => counts.waiting += 1,
                JobStatus::Active => counts.active += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Number of jobs waiting for admission.
    pub fn depth(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn depth_status(&self) -> QueueDepthStatus {
        let depth = self.depth();
        if depth >= self.config.critical_threshold {
            QueueDepthStatus::Critical
        } else if depth >= self.config.warning_threshold {
            QueueDepthStatus::Warning
        } else {
            QueueDepthStatus::Normal
        }
    }

    /// Pending job IDs in current queue order.
    pub fn pending_ids(&self) -> Vec<JobId> {
        self.pending.lock().iter().map(|p| p.job_id).collect()
    }

    /// Re-sort the pending queue: requeued retries first, then priority
    /// descending, then sequence. A retry takes a new sequence number when
    /// requeued, so retries run in the order they were requeued.
    pub fn reorder(&self) {
        let mut pending = self.pending.lock();
        pending.make_contiguous().sort_by(|a, b| {
            b.retry_boost
                .cmp(&a.retry_boost)
                .then_with(|| b.priority.rank().cmp(&a.priority.rank()))
                .then_with(|| a.seq.cmp(&b.seq))
        });
    }

    pub fn peek_head(&self) -> Option<PendingJob> {
        self.pending.lock().front().copied()
    }

    pub fn pop_head(&self) -> Option<PendingJob> {
        self.pending.lock().pop_front()
    }

    /// Transition `Waiting -> Active` for an admitted job.
    pub fn mark_active(&self, id: JobId) -> Result<Job> {
        let mut job = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("job", id.to_string()))?;
        job.transition(JobStatus::Active)?;
        job.attempt += 1;
        job.progress = 0;
        job.progress_detail = None;
        if job.started_at.is_none() {
            let now = Utc::now();
            job.started_at = Some(now);
            job.queue_wait_secs =
                Some(((now - job.created_at).num_milliseconds() as f64 / 1000.0).max(0.0));
        }
        let snapshot = job.clone();
        drop(job);

        let _ = self.event_tx.send(JobEvent::Started {
            job_id: id,
            attempt: snapshot.attempt,
        });
        Ok(snapshot)
    }

    /// Transition `Active -> Completed`.
    pub fn complete(&self, id: JobId, result: UploadResult) -> Result<Job> {
        let mut job = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("job", id.to_string()))?;
        job.transition(JobStatus::Completed)?;
        job.progress = 100;
        job.error = None;
        let size = result.size;
        job.result = Some(result);
        job.finish();
        let snapshot = job.clone();
        drop(job);

        info!(
            job_id = id,
            size,
            duration_secs = snapshot.duration_secs.unwrap_or_default(),
            "Job completed"
        );
        let _ = self.event_tx.send(JobEvent::Completed { job_id: id, size });
        Ok(snapshot)
    }

    /// Transition `Active -> Failed`, keeping the last error.
    pub fn fail(&self, id: JobId, error: &str) -> Result<Job> {
        let mut job = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("job", id.to_string()))?;
        job.transition(JobStatus::Failed)?;
        job.error = Some(error.to_string());
        job.finish();
        let snapshot = job.clone();
        drop(job);

        warn!(job_id = id, retry_count = snapshot.retry_count, "Job failed: {}", error);
        let _ = self.event_tx.send(JobEvent::Failed {
            job_id: id,
            error: error.to_string(),
        });
        Ok(snapshot)
    }

    /// Transition `Active -> Waiting` after a transient failure and put the
    /// job back at the front of the queue.
    pub fn requeue_front(&self, id: JobId, error: &str) -> Result<Job> {
        let mut job = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("job", id.to_string()))?;
        job.transition(JobStatus::Waiting)?;
        job.retry_count += 1;
        job.progress = 0;
        job.progress_detail = None;
        let snapshot = job.clone();
        drop(job);

        self.pending.lock().push_front(PendingJob {
            job_id: id,
            memory_estimate: snapshot.memory_estimate,
            priority: snapshot.priority,
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            retry_boost: true,
        });

        warn!(
            job_id = id,
            retry_count = snapshot.retry_count,
            max_retries = snapshot.max_retries,
            "Job requeued after transient failure: {}",
            error
        );
        let _ = self.event_tx.send(JobEvent::Requeued {
            job_id: id,
            retry_count: snapshot.retry_count,
            error: error.to_string(),
        });
        self.notify.notify_one();
        Ok(snapshot)
    }

    /// Apply a progress message. Returns false for stale or regressing updates.
    pub fn apply_progress(&self, update: JobProgressUpdate) -> bool {
        let Some(mut job) = self.jobs.get_mut(&update.job_id) else {
            return false;
        };
        if job.status != JobStatus::Active || job.attempt != update.attempt {
            debug!(
                job_id = update.job_id,
                attempt = update.attempt,
                "Ignoring stale progress update"
            );
            return false;
        }
        if update.snapshot.percent < job.progress {
            return false;
        }
        job.progress = update.snapshot.percent.min(100);
        job.progress_detail = Some(update.snapshot);
        true
    }

    /// Remove terminal jobs that finished before `cutoff`.
    pub fn evict_terminal_before(&self, cutoff: DateTime<Utc>) -> Vec<JobId> {
        let expired: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|e| {
                e.status.is_terminal() && e.finished_at.is_some_and(|finished| finished < cutoff)
            })
            .map(|e| *e.key())
            .collect();

        let mut evicted = Vec::with_capacity(expired.len());
        for id in expired {
            // Re-check under the entry lock.
            if self
                .jobs
                .remove_if(&id, |_, job| job.status.is_terminal())
                .is_some()
            {
                let _ = self.event_tx.send(JobEvent::Evicted { job_id: id });
                evicted.push(id);
            }
        }
        evicted
    }

    /// Subscribe to job lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.event_tx.subscribe()
    }

    /// Get a notifier signalled on submission and requeue.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::progress::ProgressPhase;

    fn submit(queue: &JobQueue, name: &str, priority: Priority) -> JobId {
        queue.submit(DatasetRef::new(name), priority, 1024, 2).id
    }

    fn progress(job_id: JobId, attempt: u32, percent: u8) -> JobProgressUpdate {
        JobProgressUpdate {
            job_id,
            attempt,
            snapshot: JobProgressSnapshot {
                phase: ProgressPhase::Fetching,
                percent,
                bytes_fetched: 0,
                bytes_uploaded: 0,
                expected_bytes: None,
                parts_completed: 0,
                updated_at: Utc::now(),
            },
        }
    }

    fn test_result() -> UploadResult {
        UploadResult {
            key: "studies/2026/10/16/a.zip".to_string(),
            bucket: "archive".to_string(),
            size: 42,
            etag: "\"etag\"".to_string(),
            object_url: None,
            public_url: None,
        }
    }

    #[test]
    fn test_job_queue_config_default() {
        let config = JobQueueConfig::default();
        assert_eq!(config.warning_threshold, 100);
        assert_eq!(config.critical_threshold, 500);
    }

    #[test]
    fn test_submit_assigns_increasing_ids() {
        let queue = JobQueue::new();
        let a = submit(&queue, "a", Priority::Normal);
        let b = submit(&queue, "b", Priority::Normal);
        assert!(b > a);

        let job = queue.get(a).unwrap();
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.memory_estimate, 1024);
        assert_eq!(queue.depth(), 2);
    }

    #[test]
    fn test_reorder_priority_then_fifo() {
        let queue = JobQueue::new();
        let b = submit(&queue, "b", Priority::Normal);
        let c = submit(&queue, "c", Priority::Normal);
        let a = submit(&queue, "a", Priority::High);
        let d = submit(&queue, "d", Priority::Low);

        queue.reorder();
        assert_eq!(queue.pending_ids(), vec![a, b, c, d]);

        // Repeated sorting keeps FIFO among equal priorities.
        queue.reorder();
        queue.reorder();
        assert_eq!(queue.pending_ids(), vec![a, b, c, d]);
    }

    #[test]
    fn test_requeued_job_outranks_priority() {
        let queue = JobQueue::new();
        let low = submit(&queue, "low", Priority::Low);
        queue.reorder();
        queue.pop_head();
        queue.mark_active(low).unwrap();

        let high = submit(&queue, "high", Priority::High);
        queue.requeue_front(low, "connection reset").unwrap();
        queue.reorder();

        assert_eq!(queue.pending_ids(), vec![low, high]);
        let job = queue.get(low).unwrap();
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.retry_count, 1);
        assert!(job.error.is_none());
    }

    #[test]
    fn test_retries_run_in_requeue_order() {
        let queue = JobQueue::new();
        let first = submit(&queue, "first", Priority::Normal);
        let second = submit(&queue, "second", Priority::Normal);
        let fresh = submit(&queue, "fresh", Priority::Normal);
        queue.reorder();
        for id in [first, second] {
            assert_eq!(queue.pop_head().map(|p| p.job_id), Some(id));
            queue.mark_active(id).unwrap();
        }

        queue.requeue_front(first, "connection reset").unwrap();
        queue.requeue_front(second, "connection reset").unwrap();
        assert_eq!(queue.pending_ids(), vec![second, first, fresh]);

        queue.reorder();
        assert_eq!(queue.pending_ids(), vec![first, second, fresh]);
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let queue = JobQueue::new();
        let id = submit(&queue, "a", Priority::Normal);

        assert!(matches!(
            queue.complete(id, test_result()),
            Err(Error::InvalidStateTransition { .. })
        ));
        queue.mark_active(id).unwrap();
        queue.complete(id, test_result()).unwrap();
        assert!(queue.fail(id, "late").is_err());
        assert!(queue.mark_active(id).is_err());
    }

    #[test]
    fn test_complete_records_result_and_timing() {
        let queue = JobQueue::new();
        let id = submit(&queue, "a", Priority::Normal);
        queue.pop_head();
        queue.mark_active(id).unwrap();

        let job = queue.complete(id, test_result()).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.result.as_ref().map(|r| r.size), Some(42));
        assert!(job.finished_at.is_some());
        assert!(job.duration_secs.is_some());
        assert!(job.queue_wait_secs.is_some());
    }

    #[test]
    fn test_progress_monotonic_and_attempt_scoped() {
        let queue = JobQueue::new();
        let id = submit(&queue, "a", Priority::Normal);

        // Not active yet.
        assert!(!queue.apply_progress(progress(id, 1, 10)));

        queue.mark_active(id).unwrap();
        assert!(queue.apply_progress(progress(id, 1, 10)));
        assert!(queue.apply_progress(progress(id, 1, 30)));
        assert!(!queue.apply_progress(progress(id, 1, 20)));
        assert_eq!(queue.get(id).unwrap().progress, 30);

        queue.requeue_front(id, "timeout").unwrap();
        queue.pop_head();
        queue.mark_active(id).unwrap();
        assert_eq!(queue.get(id).unwrap().progress, 0);

        // Late update from the first attempt.
        assert!(!queue.apply_progress(progress(id, 1, 50)));
        assert!(queue.apply_progress(progress(id, 2, 5)));
        assert_eq!(queue.get(id).unwrap().progress, 5);
    }

    #[test]
    fn test_evict_only_old_terminal_jobs() {
        let queue = JobQueue::new();
        let done = submit(&queue, "done", Priority::Normal);
        let failed = submit(&queue, "failed", Priority::Normal);
        let active = submit(&queue, "active", Priority::Normal);
        let waiting = submit(&queue, "waiting", Priority::Normal);

        for id in [done, failed, active] {
            queue.mark_active(id).unwrap();
        }
        queue.complete(done, test_result()).unwrap();
        queue.fail(failed, "storage rejected").unwrap();

        // Nothing has aged past a cutoff in the past.
        let evicted = queue.evict_terminal_before(Utc::now() - chrono::Duration::hours(1));
        assert!(evicted.is_empty());

        let mut evicted = queue.evict_terminal_before(Utc::now() + chrono::Duration::seconds(1));
        evicted.sort();
        assert_eq!(evicted, vec![done, failed]);
        assert!(queue.get(active).is_some());
        assert!(queue.get(waiting).is_some());
        assert!(queue.get(done).is_none());
    }

    #[test]
    fn test_counts_and_depth_status() {
        let config = JobQueueConfig {
            warning_threshold: 2,
            critical_threshold: 3,
        };
        let queue = JobQueue::with_config(config);
        assert_eq!(queue.depth_status(), QueueDepthStatus::Normal);

        let first = submit(&queue, "a", Priority::Normal);
        submit(&queue, "b", Priority::Normal);
        assert_eq!(queue.depth_status(), QueueDepthStatus::Warning);
        submit(&queue, "c", Priority::Normal);
        assert_eq!(queue.depth_status(), QueueDepthStatus::Critical);

        queue.pop_head();
        queue.mark_active(first).unwrap();
        let counts = queue.counts();
        assert_eq!(counts.waiting, 2);
        assert_eq!(counts.active, 1);
    }

    #[tokio::test]
    async fn test_events_broadcast() {
        let queue = JobQueue::new();
        let mut rx = queue.subscribe();
        let id = submit(&queue, "a", Priority::High);

        match rx.recv().await.unwrap() {
            JobEvent::Submitted { job_id, priority } => {
                assert_eq!(job_id, id);
                assert_eq!(priority, Priority::High);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}

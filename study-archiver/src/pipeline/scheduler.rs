//! The scheduling loop.
//!
//! A single task owns the [`ResourceBudget`]. It admits queued jobs, runs
//! their pipelines in the job [`WorkerPool`], applies progress messages and
//! settles every finished attempt (complete, requeue or fail). Pipeline tasks
//! never touch the budget; they only return their outcome.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::admission::{
    AdmissionController, AdmissionDecision, BudgetSnapshot, ResourceBudget,
};
use super::job_queue::{Job, JobId, JobQueue, QueueDepthStatus};
use super::processor::JobPipeline;
use super::progress::{JobProgressUpdate, ProgressReporter};
use super::retry::{RetryDecision, RetryPolicy};
use super::worker_pool::{WorkerPool, WorkerType};
use crate::metrics::MetricsCollector;
use crate::notification::CompletionSink;
use crate::upload::UploadResult;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Fallback wake-up of an idle loop in milliseconds. 0 disables it.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    /// Buffered progress messages before new ones are dropped.
    #[serde(default = "default_progress_channel_capacity")]
    pub progress_channel_capacity: usize,
    /// Time allowed to a completion sink call.
    #[serde(default = "default_sink_timeout_secs")]
    pub sink_timeout_secs: u64,
}

fn default_idle_poll_ms() -> u64 {
    1000
}

fn default_progress_channel_capacity() -> usize {
    1024
}

fn default_sink_timeout_secs() -> u64 {
    30
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_poll_ms: default_idle_poll_ms(),
            progress_channel_capacity: default_progress_channel_capacity(),
            sink_timeout_secs: default_sink_timeout_secs(),
        }
    }
}

type Attempt = (JobId, Result<UploadResult>);

/// Signals that end the loop.
#[derive(Clone, Default)]
pub struct SchedulerControl {
    /// Stop admitting; exit once active jobs are settled.
    pub drain: CancellationToken,
    /// Abort active pipelines and fail their jobs.
    pub abort: CancellationToken,
}

pub struct Scheduler {
    config: SchedulerConfig,
    queue: Arc<JobQueue>,
    pipeline: Arc<dyn JobPipeline>,
    budget: ResourceBudget,
    budget_view: Arc<RwLock<BudgetSnapshot>>,
    admission: AdmissionController,
    retry: RetryPolicy,
    metrics: Arc<MetricsCollector>,
    sink: Arc<dyn CompletionSink>,
    pool: WorkerPool<Attempt>,
    reservations: HashMap<JobId, u64>,
    task_jobs: HashMap<Id, JobId>,
    progress_tx: mpsc::Sender<JobProgressUpdate>,
    progress_rx: mpsc::Receiver<JobProgressUpdate>,
    notifications: JoinSet<()>,
    depth_status: QueueDepthStatus,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SchedulerConfig,
        queue: Arc<JobQueue>,
        pipeline: Arc<dyn JobPipeline>,
        budget: ResourceBudget,
        budget_view: Arc<RwLock<BudgetSnapshot>>,
        retry: RetryPolicy,
        metrics: Arc<MetricsCollector>,
        sink: Arc<dyn CompletionSink>,
    ) -> Self {
        let (progress_tx, progress_rx) = mpsc::channel(config.progress_channel_capacity.max(1));
        let pool = WorkerPool::new(WorkerType::Job, budget.config().max_concurrent_jobs);
        *budget_view.write() = budget.snapshot();
        Self {
            config,
            queue,
            pipeline,
            budget,
            budget_view,
            admission: AdmissionController::new(),
            retry,
            metrics,
            sink,
            pool,
            reservations: HashMap::new(),
            task_jobs: HashMap::new(),
            progress_tx,
            progress_rx,
            notifications: JoinSet::new(),
            depth_status: QueueDepthStatus::Normal,
        }
    }

    /// Run until drained or aborted.
    pub async fn run(mut self, control: SchedulerControl) {
        info!(
            max_concurrent_jobs = self.budget.config().max_concurrent_jobs,
            usable_memory = self.budget.config().usable_memory(),
            "Scheduler started"
        );
        let notify = self.queue.notifier();
        let idle_poll = (self.config.idle_poll_ms > 0)
            .then(|| Duration::from_millis(self.config.idle_poll_ms));
        let mut draining = false;
        let mut needs_admission = true;

        loop {
            if needs_admission && !draining {
                self.admit_ready().await;
                needs_admission = false;
            }
            self.publish_gauges();
            self.reap_notifications();

            if draining && self.pool.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                _ = control.abort.cancelled() => {
                    self.abort_active().await;
                    break;
                }
                Some(joined) = self.pool.join_next_with_id(), if !self.pool.is_empty() => {
                    self.settle(joined);
                    needs_admission = true;
                }
                Some(update) = self.progress_rx.recv() => {
                    self.queue.apply_progress(update);
                }
                _ = control.drain.cancelled(), if !draining => {
                    info!(active = self.pool.len(), "Scheduler draining, admission stopped");
                    draining = true;
                }
                _ = notify.notified(), if !draining => {
                    needs_admission = true;
                }
                _ = sleep_or_pending(idle_poll), if !draining => {
                    needs_admission = true;
                }
            }
        }

        self.finish_notifications().await;
        self.publish_gauges();
        info!("Scheduler stopped");
    }

    /// Admit from the head of the queue until the budget says stop.
    async fn admit_ready(&mut self) {
        self.queue.reorder();
        while let Some(head) = self.queue.peek_head() {
            match self.admission.try_admit(&mut self.budget, &head) {
                AdmissionDecision::Admit(job_id) => {
                    self.queue.pop_head();
                    self.publish_budget();
                    match self.queue.mark_active(job_id) {
                        Ok(job) => self.dispatch(job, head.memory_estimate).await,
                        Err(e) => {
                            error!(job_id, "Admitted job could not be activated: {}", e);
                            self.budget.release(head.memory_estimate);
                            self.publish_budget();
                        }
                    }
                }
                AdmissionDecision::InsufficientMemory { .. } | AdmissionDecision::NoWorkerSlot => {
                    break;
                }
            }
        }
    }

    async fn dispatch(&mut self, job: Job, memory_estimate: u64) {
        let job_id = job.id;
        info!(
            job_id,
            attempt = job.attempt,
            dataset_id = %job.input.dataset_id,
            memory_estimate,
            reserved_memory = self.budget.reserved_memory(),
            active = self.budget.active_count(),
            "Job dispatched"
        );
        self.reservations.insert(job_id, memory_estimate);

        let reporter = ProgressReporter::new(job_id, job.attempt, self.progress_tx.clone());
        let pipeline = self.pipeline.clone();
        let spawned = self
            .pool
            .spawn(async move {
                let outcome = AssertUnwindSafe(pipeline.run(&job, reporter))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        Err(Error::Internal(format!(
                            "pipeline panicked: {}",
                            panic_message(panic.as_ref())
                        )))
                    });
                (job_id, outcome)
            })
            .await;

        match spawned {
            Ok(task_id) => {
                self.task_jobs.insert(task_id, job_id);
            }
            Err(e) => self.finish_attempt(job_id, Err(e)),
        }
    }

    /// Map a joined task back to its job and settle the attempt.
    ///
    /// A task that ended without an outcome still releases its reservation
    /// and fails its job.
    fn settle(&mut self, joined: std::result::Result<(Id, Attempt), JoinError>) {
        match joined {
            Ok((task_id, (job_id, outcome))) => {
                self.task_jobs.remove(&task_id);
                self.finish_attempt(job_id, outcome);
            }
            Err(e) => {
                let Some(job_id) = self.task_jobs.remove(&e.id()) else {
                    error!(task_id = %e.id(), "Unknown job task ended without an outcome: {}", e);
                    return;
                };
                error!(job_id, "Job task ended without an outcome: {}", e);
                let reason = if e.is_panic() {
                    "job task panicked"
                } else {
                    "job task was cancelled"
                };
                self.finish_attempt(job_id, Err(Error::Internal(reason.to_string())));
            }
        }
    }

    /// Release the attempt's reservation and apply its outcome.
    fn finish_attempt(&mut self, job_id: JobId, outcome: Result<UploadResult>) {

        let memory = self.reservations.remove(&job_id).unwrap_or_default();
        self.budget.release(memory);
        self.publish_budget();

        match outcome {
            Ok(result) => match self.queue.complete(job_id, result) {
                Ok(job) => {
                    let size = job.result.as_ref().map(|r| r.size).unwrap_or_default();
                    self.metrics.record_completed(size, duration_ms(&job));
                    self.notify_sink(job);
                }
                Err(e) => error!(job_id, "Failed to record completion: {}", e),
            },
            Err(err) => self.handle_failure(job_id, err),
        }
    }

    fn handle_failure(&mut self, job_id: JobId, err: Error) {
        let Some(job) = self.queue.get(job_id) else {
            error!(job_id, "Failed job missing from registry: {}", err);
            return;
        };

        let message = err.to_string();
        match self.retry.decide(&err, job.retry_count, job.max_retries) {
            RetryDecision::Requeue => {
                if let Err(e) = self.queue.requeue_front(job_id, &message) {
                    error!(job_id, "Failed to requeue job: {}", e);
                    return;
                }
                self.metrics.record_retry();
            }
            RetryDecision::Fail => match self.queue.fail(job_id, &message) {
                Ok(job) => {
                    self.metrics.record_failed(err.kind(), duration_ms(&job));
                    self.notify_sink(job);
                }
                Err(e) => error!(job_id, "Failed to record failure: {}", e),
            },
        }
    }

    fn notify_sink(&mut self, job: Job) {
        let sink = self.sink.clone();
        let timeout = Duration::from_secs(self.config.sink_timeout_secs.max(1));
        self.notifications.spawn(async move {
            let delivery = async {
                if job.result.is_some() {
                    sink.job_completed(&job).await
                } else {
                    sink.job_failed(&job).await
                }
            };
            match tokio::time::timeout(timeout, delivery).await {
                Ok(Ok(())) => debug!(job_id = job.id, "Completion sink notified"),
                Ok(Err(e)) => warn!(job_id = job.id, "Completion sink failed: {}", e),
                Err(_) => warn!(job_id = job.id, "Completion sink timed out"),
            }
        });
    }

    fn reap_notifications(&mut self) {
        while let Some(joined) = self.notifications.try_join_next() {
            if let Err(e) = joined {
                warn!("Completion sink task panicked: {}", e);
            }
        }
    }

    async fn finish_notifications(&mut self) {
        while let Some(joined) = self.notifications.join_next().await {
            if let Err(e) = joined {
                warn!("Completion sink task panicked: {}", e);
            }
        }
    }

    /// Stop every running pipeline and fail its job.
    async fn abort_active(&mut self) {
        let active = self.reservations.len();
        if active > 0 {
            warn!(active, "Aborting active jobs");
        }
        self.pool.shutdown().await;
        self.task_jobs.clear();

        let reservations: Vec<(JobId, u64)> = self.reservations.drain().collect();
        for (job_id, memory) in reservations {
            self.budget.release(memory);
            match self
                .queue
                .fail(job_id, "engine shut down before the job finished")
            {
                Ok(job) => {
                    self.metrics
                        .record_failed(Error::ShuttingDown.kind(), duration_ms(&job));
                    self.notify_sink(job);
                }
                Err(e) => error!(job_id, "Failed to record shutdown failure: {}", e),
            }
        }
        self.publish_budget();
    }

    fn publish_budget(&self) {
        let snapshot = self.budget.snapshot();
        *self.budget_view.write() = snapshot;
        self.metrics.set_budget(&snapshot);
    }

    fn publish_gauges(&mut self) {
        self.publish_budget();
        let depth = self.queue.depth();
        self.metrics.set_queue_depth(depth);

        let status = self.queue.depth_status();
        if status != self.depth_status {
            match status {
                QueueDepthStatus::Critical => warn!(depth, "Queue depth critical"),
                QueueDepthStatus::Warning => warn!(depth, "Queue depth high"),
                QueueDepthStatus::Normal => info!(depth, "Queue depth back to normal"),
            }
            self.depth_status = status;
        }
    }
}

async fn sleep_or_pending(period: Option<Duration>) {
    match period {
        Some(period) => tokio::time::sleep(period).await,
        None => std::future::pending().await,
    }
}

fn duration_ms(job: &Job) -> u64 {
    job.duration_secs
        .map(|secs| (secs * 1000.0).max(0.0) as u64)
        .unwrap_or_default()
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

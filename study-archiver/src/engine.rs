//! The engine facade: job control API plus lifecycle of the background tasks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::metrics::{MemorySampler, MetricsCollector, MetricsSnapshot, PrometheusExporter};
use crate::notification::{CompletionSink, NoopSink};
use crate::pipeline::{
    ArchivePipeline, BudgetSnapshot, DatasetRef, Job, JobCounts, JobEvent, JobId, JobPipeline,
    JobPurgeService, JobQueue, MemoryEstimator, Priority, QueueDepthStatus, ResourceBudget,
    Scheduler, SchedulerControl,
};
use crate::source::{DatasetSource, HttpDatasetSource};
use crate::storage::ObjectStorage;
use crate::upload::StreamingUploader;
use crate::{Error, Result};

/// Assembles an [`ArchiveEngine`].
pub struct EngineBuilder {
    config: EngineConfig,
    source: Option<Arc<dyn DatasetSource>>,
    storage: Option<Arc<dyn ObjectStorage>>,
    pipeline: Option<Arc<dyn JobPipeline>>,
    estimator: Option<Arc<dyn MemoryEstimator>>,
    sink: Option<Arc<dyn CompletionSink>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            source: None,
            storage: None,
            pipeline: None,
            estimator: None,
            sink: None,
        }
    }

    /// Dataset source. Defaults to [`HttpDatasetSource`] built from the config.
    pub fn source(mut self, source: Arc<dyn DatasetSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Object storage. Required unless a custom pipeline is supplied.
    pub fn storage(mut self, storage: Arc<dyn ObjectStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Replace the fetch/upload pipeline entirely.
    pub fn pipeline(mut self, pipeline: Arc<dyn JobPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Memory estimator. Defaults to the configured instance-count estimator.
    pub fn estimator(mut self, estimator: Arc<dyn MemoryEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn CompletionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Validate the config and start the scheduler and background tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self) -> Result<ArchiveEngine> {
        let config = self.config;
        config.validate()?;

        let pipeline = match self.pipeline {
            Some(pipeline) => pipeline,
            None => {
                let storage = self
                    .storage
                    .ok_or_else(|| Error::config("object storage is required"))?;
                let source = match self.source {
                    Some(source) => source,
                    None => Arc::new(HttpDatasetSource::new(&config.source)?),
                };
                let uploader = StreamingUploader::new(storage, config.upload.clone());
                Arc::new(ArchivePipeline::new(
                    source,
                    uploader,
                    config.progress.clone(),
                )) as Arc<dyn JobPipeline>
            }
        };
        let estimator = self
            .estimator
            .unwrap_or_else(|| Arc::new(config.estimator.clone()));
        let sink = self.sink.unwrap_or_else(|| Arc::new(NoopSink));

        let queue = Arc::new(JobQueue::with_config(config.queue.clone()));
        let metrics = Arc::new(MetricsCollector::new());
        let budget = ResourceBudget::new(config.budget.clone());
        let budget_view = Arc::new(RwLock::new(budget.snapshot()));
        let control = SchedulerControl::default();
        let background = CancellationToken::new();

        let scheduler = Scheduler::new(
            config.scheduler.clone(),
            queue.clone(),
            pipeline,
            budget,
            budget_view.clone(),
            config.retry.clone(),
            metrics.clone(),
            sink,
        );
        let scheduler_handle = tokio::spawn(scheduler.run(control.clone()));

        let mut tasks = Vec::new();
        let purge = Arc::new(JobPurgeService::new(config.purge.clone(), queue.clone()));
        tasks.push(purge.start_background_task(background.child_token()));
        if config.metrics.enabled {
            let sampler = Arc::new(MemorySampler::new(metrics.clone(), &config.metrics));
            tasks.push(sampler.start(background.child_token()));
        }

        info!(
            bucket = %config.upload.bucket,
            max_concurrent_jobs = config.budget.max_concurrent_jobs,
            part_concurrency = config.upload.part_concurrency,
            "Archive engine started"
        );

        Ok(ArchiveEngine {
            config,
            queue,
            estimator,
            metrics,
            budget_view,
            control,
            background,
            scheduler: Mutex::new(Some(scheduler_handle)),
            tasks: Mutex::new(tasks),
            shutting_down: AtomicBool::new(false),
        })
    }
}

/// Accepts dataset archive jobs and runs them under the resource budget.
pub struct ArchiveEngine {
    config: EngineConfig,
    queue: Arc<JobQueue>,
    estimator: Arc<dyn MemoryEstimator>,
    metrics: Arc<MetricsCollector>,
    budget_view: Arc<RwLock<BudgetSnapshot>>,
    control: SchedulerControl,
    background: CancellationToken,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl ArchiveEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Queue a job. Never blocks; admission happens on the scheduler.
    pub fn submit(&self, input: DatasetRef, priority: Priority) -> Result<Job> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        if input.dataset_id.trim().is_empty() {
            return Err(Error::invalid_metadata("", "empty dataset id"));
        }

        let memory_estimate = self.estimator.estimate(&input);
        let job = self
            .queue
            .submit(input, priority, memory_estimate, self.config.retry.max_retries);
        self.metrics.record_submitted();
        self.metrics.set_queue_depth(self.queue.depth());
        Ok(job)
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.queue.get(id)
    }

    pub fn list_all(&self) -> Vec<Job> {
        self.queue.list_all()
    }

    pub fn stats(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn counts(&self) -> JobCounts {
        self.queue.counts()
    }

    /// Budget as last published by the scheduler.
    pub fn budget(&self) -> BudgetSnapshot {
        *self.budget_view.read()
    }

    pub fn queue_depth_status(&self) -> QueueDepthStatus {
        self.queue.depth_status()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.queue.subscribe()
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    /// Metrics in Prometheus text format.
    pub fn prometheus(&self) -> String {
        PrometheusExporter::new(self.metrics.clone()).export()
    }

    /// Wait until every job in `ids` is terminal or gone from the registry.
    pub async fn wait_until_settled(&self, ids: &[JobId]) {
        let mut events = self.subscribe();
        loop {
            let settled = ids
                .iter()
                .all(|id| self.get(*id).is_none_or(|job| job.status.is_terminal()));
            if settled {
                return;
            }
            match events.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return,
            }
        }
    }

    /// Stop admission and wait up to `timeout` for active jobs.
    ///
    /// Jobs still running after the timeout are aborted and marked failed.
    /// Waiting jobs stay `Waiting`. Returns the final metrics.
    pub async fn shutdown(&self, timeout: Duration) -> MetricsSnapshot {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return self.stats();
        }
        info!(timeout_secs = timeout.as_secs_f64(), "Shutting down archive engine");
        self.control.drain.cancel();

        let handle = self.scheduler.lock().take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Scheduler task failed: {}", e),
                Err(_) => {
                    warn!("Shutdown timeout elapsed, aborting active jobs");
                    self.control.abort.cancel();
                    if let Err(e) = handle.await {
                        error!("Scheduler task failed: {}", e);
                    }
                }
            }
        }

        self.background.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task failed: {}", e);
            }
        }

        let snapshot = self.stats();
        info!(
            completed = snapshot.completed_jobs,
            failed = snapshot.failed_jobs,
            bytes = snapshot.bytes_processed,
            "Archive engine stopped"
        );
        snapshot
    }
}

impl Drop for ArchiveEngine {
    fn drop(&mut self) {
        self.control.abort.cancel();
        self.background.cancel();
    }
}

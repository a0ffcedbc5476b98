//! Job pipeline: registry and queue, admission, scheduling, the per-job
//! fetch/transform/upload pipeline, retries and cleanup.

pub mod admission;
pub mod job_queue;
pub mod processor;
pub mod progress;
pub mod purge;
pub mod retry;
pub mod scheduler;
pub mod transform;
pub mod worker_pool;

pub use admission::{
    AdmissionController, AdmissionDecision, BudgetConfig, BudgetSnapshot, FixedEstimator,
    InstanceCountEstimator, MemoryEstimator, ResourceBudget,
};
pub use job_queue::{
    DatasetRef, Job, JobCounts, JobEvent, JobId, JobQueue, JobQueueConfig, JobStatus, Priority,
    QueueDepthStatus,
};
pub use processor::{ArchivePipeline, JobPipeline};
pub use progress::{JobProgressSnapshot, ProgressConfig, ProgressPhase, ProgressReporter};
pub use purge::{JobPurgeService, PurgeConfig};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerControl};
pub use worker_pool::{WorkerPool, WorkerType};

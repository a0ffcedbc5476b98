use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use study_archiver::storage::MemoryObjectStorage;
use study_archiver::{ArchiveEngine, DatasetRef, EngineConfig, JobEvent, Priority, logging};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Dataset ids to archive
    #[arg(required = true)]
    datasets: Vec<String>,

    /// Priority of every submitted job
    #[arg(long, value_enum, default_value = "normal")]
    priority: Priority,

    /// Instance count of the datasets, used for the memory estimate
    #[arg(long)]
    instance_count: Option<u64>,

    /// Seconds active jobs may take to finish after Ctrl-C
    #[arg(long, default_value_t = 30)]
    shutdown_timeout_secs: u64,
}

impl Args {
    fn jobs(&self) -> impl Iterator<Item = DatasetRef> + '_ {
        self.datasets.iter().map(|id| {
            let input = DatasetRef::new(id.as_str());
            match self.instance_count {
                Some(count) => input.with_instance_count(count),
                None => input,
            }
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = EngineConfig::from_env().context("loading configuration")?;
    let (_logging, _guard) = logging::init_logging(&config.logging)?;
    config.validate().context("validating configuration")?;

    let storage = Arc::new(MemoryObjectStorage::new());
    let engine = ArchiveEngine::builder(config)
        .storage(storage.clone())
        .start()
        .context("starting archive engine")?;

    let mut events = engine.subscribe();
    let mut ids = Vec::with_capacity(args.datasets.len());
    for input in args.jobs() {
        let job = engine.submit(input, args.priority)?;
        ids.push(job.id);
    }

    let progress_logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(JobEvent::Completed { job_id, size }) => info!(job_id, size, "Archive uploaded"),
                Ok(JobEvent::Failed { job_id, error }) => warn!(job_id, %error, "Archive failed"),
                Ok(JobEvent::Requeued { job_id, retry_count, .. }) => {
                    info!(job_id, retry_count, "Archive retry scheduled")
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::select! {
        _ = engine.wait_until_settled(&ids) => info!("All submitted jobs settled"),
        result = tokio::signal::ctrl_c() => {
            result.context("listening for Ctrl-C")?;
            info!("Ctrl-C received");
        }
    }

    let stats = engine
        .shutdown(Duration::from_secs(args.shutdown_timeout_secs))
        .await;
    progress_logger.abort();

    for job in engine.list_all() {
        match (&job.result, &job.error) {
            (Some(result), _) => info!(
                job_id = job.id,
                key = %result.key,
                size = result.size,
                public_url = result.public_url.as_deref().unwrap_or("-"),
                "Job completed"
            ),
            (None, Some(error)) => warn!(job_id = job.id, %error, "Job failed"),
            _ => info!(job_id = job.id, status = %job.status, "Job not finished"),
        }
    }
    info!(
        completed = stats.completed_jobs,
        failed = stats.failed_jobs,
        bytes = stats.bytes_processed,
        avg_secs = stats.avg_processing_secs,
        peak_memory = stats.peak_memory_bytes,
        objects = storage.object_count(),
        "Done"
    );
    Ok(())
}

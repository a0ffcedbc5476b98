//! The per-job fetch, transform and upload pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tracing::{debug, instrument};

use super::job_queue::Job;
use super::progress::{ProgressConfig, ProgressReporter, ProgressTracker, SizeHint};
use super::transform::ProgressStream;
use crate::Result;
use crate::source::DatasetSource;
use crate::upload::{StreamingUploader, UploadResult, key};

/// Runs one attempt of a job.
///
/// # Cancel Safety
///
/// The scheduler aborts running pipelines on shutdown. Implementations must
/// not leave state that outlives the future other than what the storage
/// backend expires on its own.
#[async_trait]
pub trait JobPipeline: Send + Sync {
    async fn run(&self, job: &Job, progress: ProgressReporter) -> Result<UploadResult>;
}

/// Streams a dataset archive from a [`DatasetSource`] into object storage.
pub struct ArchivePipeline {
    source: Arc<dyn DatasetSource>,
    uploader: StreamingUploader,
    progress: ProgressConfig,
}

impl ArchivePipeline {
    pub fn new(
        source: Arc<dyn DatasetSource>,
        uploader: StreamingUploader,
        progress: ProgressConfig,
    ) -> Self {
        Self {
            source,
            uploader,
            progress,
        }
    }
}

#[async_trait]
impl JobPipeline for ArchivePipeline {
    #[instrument(skip_all, fields(job_id = job.id, dataset_id = %job.input.dataset_id, attempt = job.attempt))]
    async fn run(&self, job: &Job, progress: ProgressReporter) -> Result<UploadResult> {
        let dataset_id = job.input.dataset_id.as_str();
        let (metadata, archive) = tokio::try_join!(
            self.source.metadata(dataset_id),
            self.source.open_archive(dataset_id),
        )?;

        let size_hint = SizeHint::resolve(
            archive.content_length.or(metadata.size_bytes),
            metadata.instance_count.or(job.input.instance_count),
            &self.progress,
        );
        debug!(?size_hint, name = metadata.display_name(), "Archive opened");

        let tracker = Arc::new(ProgressTracker::new(progress, size_hint, &self.progress));
        let body = ProgressStream::new(archive.body, tracker.clone()).boxed();

        let object_key = key::object_key(
            &self.uploader.config().key_prefix,
            &metadata,
            job.id,
            Utc::now(),
        );
        let mut object_metadata = HashMap::new();
        object_metadata.insert("dataset-id".to_string(), metadata.id.clone());
        object_metadata.insert("dataset-name".to_string(), metadata.display_name().to_string());
        object_metadata.insert("job-id".to_string(), job.id.to_string());
        if let Some(count) = metadata.instance_count {
            object_metadata.insert("instance-count".to_string(), count.to_string());
        }

        let result = self
            .uploader
            .upload(&object_key, &object_metadata, body, tracker.clone())
            .await?;
        tracker.finished();
        Ok(result)
    }
}

//! Streaming multi-part upload manager.
//!
//! The archive stream is cut into fixed-size parts that are uploaded through a
//! per-upload [`WorkerPool`]. The stream is only polled while a part slot is
//! free, so at most `part_concurrency + 1` parts are held in memory. Any
//! failure aborts the whole multi-part upload.

pub mod key;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::pipeline::progress::ProgressTracker;
use crate::pipeline::worker_pool::{WorkerPool, WorkerType};
use crate::storage::{CompletedPart, ObjectStorage, UploadHandle};
use crate::{Error, Result};

const MIB: usize = 1024 * 1024;

/// Most parts a single multi-part upload may have.
pub const MAX_PARTS: u32 = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Prefix of every object key, before the date partition.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_part_size_bytes")]
    pub part_size_bytes: usize,
    /// Parts in flight per upload. Independent of the job concurrency limit.
    #[serde(default = "default_part_concurrency")]
    pub part_concurrency: usize,
    /// Timeout of a single part upload.
    #[serde(default = "default_part_timeout_secs")]
    pub part_timeout_secs: u64,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    /// CDN or public base under which uploaded keys are reachable.
    #[serde(default)]
    pub public_base_url: Option<String>,
}

fn default_bucket() -> String {
    "study-archives".to_string()
}

fn default_key_prefix() -> String {
    "studies".to_string()
}

fn default_part_size_bytes() -> usize {
    16 * MIB
}

fn default_part_concurrency() -> usize {
    4
}

fn default_part_timeout_secs() -> u64 {
    300
}

fn default_content_type() -> String {
    "application/zip".to_string()
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            key_prefix: default_key_prefix(),
            part_size_bytes: default_part_size_bytes(),
            part_concurrency: default_part_concurrency(),
            part_timeout_secs: default_part_timeout_secs(),
            content_type: default_content_type(),
            public_base_url: None,
        }
    }
}

impl UploadConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bucket.trim().is_empty() {
            return Err(Error::config("upload bucket must not be empty"));
        }
        if self.part_size_bytes == 0 {
            return Err(Error::config("part_size_bytes must be positive"));
        }
        if self.part_concurrency == 0 {
            return Err(Error::config("part_concurrency must be at least 1"));
        }
        if self.part_timeout_secs == 0 {
            return Err(Error::config("part_timeout_secs must be positive"));
        }
        Ok(())
    }
}

/// Descriptor of a committed archive object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    pub key: String,
    pub bucket: String,
    /// Size as reported by the storage backend.
    pub size: u64,
    pub etag: String,
    /// Direct backend URL, when the backend exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
}

type PartOutcome = Result<CompletedPart>;

/// Uploads byte streams as multi-part objects.
pub struct StreamingUploader {
    storage: Arc<dyn ObjectStorage>,
    config: UploadConfig,
}

impl StreamingUploader {
    pub fn new(storage: Arc<dyn ObjectStorage>, config: UploadConfig) -> Self {
        Self { storage, config }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Upload `body` under `object_key`.
    ///
    /// Moves `tracker` through the fetch, upload and finalize phases. On error
    /// the multi-part upload is aborted before the error is returned.
    pub async fn upload(
        &self,
        object_key: &str,
        metadata: &HashMap<String, String>,
        body: BoxStream<'static, Result<Bytes>>,
        tracker: Arc<ProgressTracker>,
    ) -> Result<UploadResult> {
        let handle = self
            .storage
            .create_multipart_upload(
                &self.config.bucket,
                object_key,
                &self.config.content_type,
                metadata,
            )
            .await?;
        debug!(key = object_key, upload_id = %handle.upload_id, "Multipart upload started");

        let mut pool = WorkerPool::new(WorkerType::Part, self.config.part_concurrency);
        let parts = match self.upload_parts(&mut pool, &handle, body, &tracker).await {
            Ok(parts) => parts,
            Err(e) => {
                pool.shutdown().await;
                self.abort(&handle).await;
                return Err(e);
            }
        };

        tracker.finalizing();
        let part_count = parts.len();
        let info = match self.storage.complete_upload(&handle, parts).await {
            Ok(info) => info,
            Err(e) => {
                self.abort(&handle).await;
                return Err(e);
            }
        };

        info!(
            key = %info.key,
            size = info.size,
            parts = part_count,
            "Multipart upload completed"
        );
        Ok(UploadResult {
            object_url: self.storage.object_url(&self.config.bucket, &info.key),
            public_url: key::public_url(self.config.public_base_url.as_deref(), &info.key),
            key: info.key,
            bucket: self.config.bucket.clone(),
            size: info.size,
            etag: info.etag,
        })
    }

    async fn upload_parts(
        &self,
        pool: &mut WorkerPool<PartOutcome>,
        handle: &UploadHandle,
        mut body: BoxStream<'static, Result<Bytes>>,
        tracker: &Arc<ProgressTracker>,
    ) -> Result<Vec<CompletedPart>> {
        let part_size = self.config.part_size_bytes;
        let mut buffer = BytesMut::with_capacity(part_size);
        let mut completed = Vec::new();
        let mut next_part = 1u32;

        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);
            while buffer.len() >= part_size {
                let data = buffer.split_to(part_size).freeze();
                self.spawn_part(pool, handle, next_part, data, tracker).await?;
                next_part += 1;
                drain_finished(pool, &mut completed)?;
            }
        }
        tracker.fetch_finished();

        // An empty archive still needs one (empty) part to be committed.
        if !buffer.is_empty() || next_part == 1 {
            self.spawn_part(pool, handle, next_part, buffer.freeze(), tracker)
                .await?;
        }

        while let Some(joined) = pool.join_next().await {
            completed.push(joined_part(joined)?);
        }
        completed.sort_by_key(|p| p.part_number);
        Ok(completed)
    }

    async fn spawn_part(
        &self,
        pool: &mut WorkerPool<PartOutcome>,
        handle: &UploadHandle,
        part_number: u32,
        data: Bytes,
        tracker: &Arc<ProgressTracker>,
    ) -> Result<()> {
        if part_number > MAX_PARTS {
            return Err(Error::storage_rejected(format!(
                "archive needs more than {MAX_PARTS} parts; increase part_size_bytes"
            )));
        }

        let storage = self.storage.clone();
        let handle = handle.clone();
        let tracker = tracker.clone();
        let timeout = Duration::from_secs(self.config.part_timeout_secs);
        pool.spawn(async move {
            let len = data.len();
            let part = tokio::time::timeout(timeout, storage.upload_part(&handle, part_number, data))
                .await
                .map_err(|_| Error::timeout(format!("upload of part {part_number}")))??;
            tracker.record_part_uploaded(len);
            Ok(part)
        })
        .await?;
        Ok(())
    }

    async fn abort(&self, handle: &UploadHandle) {
        match self.storage.abort_upload(handle).await {
            Ok(()) => warn!(key = %handle.key, upload_id = %handle.upload_id, "Multipart upload aborted"),
            Err(e) => warn!(
                key = %handle.key,
                upload_id = %handle.upload_id,
                "Failed to abort multipart upload: {}",
                e
            ),
        }
    }
}

/// Collect parts that already finished, failing fast on the first error.
fn drain_finished(
    pool: &mut WorkerPool<PartOutcome>,
    completed: &mut Vec<CompletedPart>,
) -> Result<()> {
    while let Some(joined) = pool.try_join_next() {
        completed.push(joined_part(joined)?);
    }
    Ok(())
}

fn joined_part(
    joined: std::result::Result<PartOutcome, tokio::task::JoinError>,
) -> Result<CompletedPart> {
    joined.map_err(|e| Error::Internal(format!("part upload task failed: {e}")))?
}

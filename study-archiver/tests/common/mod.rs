#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream;
use parking_lot::Mutex;
use tokio::sync::Notify;

use study_archiver::notification::CompletionSink;
use study_archiver::pipeline::{JobPipeline, ProgressReporter};
use study_archiver::source::{DatasetMetadata, DatasetSource, DatasetStream};
use study_archiver::storage::{
    CompletedPart, MemoryObjectStorage, ObjectInfo, ObjectStorage, UploadHandle,
};
use study_archiver::upload::UploadResult;
use study_archiver::{ArchiveEngine, EngineConfig, Error, Job, JobId, JobStatus, Result};

const GIB: u64 = 1024 * 1024 * 1024;

/// Defaults with fast polling and no background sampling.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.budget.memory_ceiling_bytes = 14 * GIB;
    config.budget.system_reserve_bytes = 2 * GIB;
    config.budget.max_concurrent_jobs = 4;
    config.retry.max_retries = 2;
    config.metrics.enabled = false;
    config.scheduler.idle_poll_ms = 20;
    config
}

/// Poll until `job_id` reaches `status`.
pub async fn wait_for_status(engine: &ArchiveEngine, job_id: JobId, status: JobStatus) -> Job {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(job) = engine.get(job_id).filter(|job| job.status == status) {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job_id} never reached {status}: {:?}",
            engine.get(job_id).map(|j| j.status)
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn settle(engine: &ArchiveEngine, ids: &[JobId]) {
    tokio::time::timeout(Duration::from_secs(10), engine.wait_until_settled(ids))
        .await
        .expect("jobs did not settle in time");
}

/// Behavior of [`ScriptedPipeline`] for one dataset.
#[derive(Debug, Clone, Copy)]
pub enum Script {
    Succeed,
    /// Fail transiently on the first `n` attempts, then succeed.
    FailTransient(u32),
    AlwaysTransient,
    Fatal,
    Panic,
}

/// Pipeline double that follows a per-dataset script and records what ran.
#[derive(Default)]
pub struct ScriptedPipeline {
    scripts: Mutex<HashMap<String, Script>>,
    holds: Mutex<HashMap<String, Arc<Notify>>>,
    attempts: Mutex<HashMap<String, u32>>,
    started: Mutex<Vec<String>>,
    delay: Mutex<Duration>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedPipeline {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, dataset_id: &str, script: Script) {
        self.scripts.lock().insert(dataset_id.to_string(), script);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Block runs of `dataset_id` until [`ScriptedPipeline::release`].
    pub fn hold(&self, dataset_id: &str) {
        self.holds
            .lock()
            .insert(dataset_id.to_string(), Arc::new(Notify::new()));
    }

    pub fn release(&self, dataset_id: &str) {
        if let Some(gate) = self.holds.lock().remove(dataset_id) {
            gate.notify_one();
        }
    }

    pub fn attempts(&self, dataset_id: &str) -> u32 {
        self.attempts.lock().get(dataset_id).copied().unwrap_or(0)
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct Running<'a>(&'a AtomicUsize);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobPipeline for ScriptedPipeline {
    async fn run(&self, job: &Job, _progress: ProgressReporter) -> Result<UploadResult> {
        let dataset_id = job.input.dataset_id.clone();
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        let _running = Running(&self.running);
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.started.lock().push(dataset_id.clone());
        let attempt = {
            let mut attempts = self.attempts.lock();
            let entry = attempts.entry(dataset_id.clone()).or_default();
            *entry += 1;
            *entry
        };

        let gate = self.holds.lock().get(&dataset_id).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let script = self
            .scripts
            .lock()
            .get(&dataset_id)
            .copied()
            .unwrap_or(Script::Succeed);
        match script {
            Script::Succeed => Ok(result_for(&dataset_id)),
            Script::FailTransient(n) if attempt <= n => {
                Err(Error::storage_transient(format!("SlowDown on attempt {attempt}")))
            }
            Script::FailTransient(_) => Ok(result_for(&dataset_id)),
            Script::AlwaysTransient => Err(Error::storage_transient("ServiceUnavailable")),
            Script::Fatal => Err(Error::storage_rejected("AccessDenied")),
            Script::Panic => panic!("scripted panic for {dataset_id}"),
        }
    }
}

pub fn result_for(dataset_id: &str) -> UploadResult {
    UploadResult {
        key: format!("studies/{dataset_id}.zip"),
        bucket: "study-archives".to_string(),
        size: 4096,
        etag: "\"etag-1\"".to_string(),
        object_url: None,
        public_url: None,
    }
}

/// Wraps [`MemoryObjectStorage`] and fails part uploads of the first
/// `failing_uploads` multi-part uploads.
pub struct FlakyStorage {
    pub inner: MemoryObjectStorage,
    failing_uploads: u32,
    transient: bool,
    created: AtomicU32,
    upload_ordinals: Mutex<HashMap<String, u32>>,
}

impl FlakyStorage {
    pub fn transient(failing_uploads: u32) -> Arc<Self> {
        Arc::new(Self::new(failing_uploads, true))
    }

    pub fn rejecting() -> Arc<Self> {
        Arc::new(Self::new(u32::MAX, false))
    }

    fn new(failing_uploads: u32, transient: bool) -> Self {
        Self {
            inner: MemoryObjectStorage::new(),
            failing_uploads,
            transient,
            created: AtomicU32::new(0),
            upload_ordinals: Mutex::new(HashMap::new()),
        }
    }

    pub fn uploads_created(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStorage for FlakyStorage {
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<UploadHandle> {
        let handle = self
            .inner
            .create_multipart_upload(bucket, key, content_type, metadata)
            .await?;
        let ordinal = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        self.upload_ordinals
            .lock()
            .insert(handle.upload_id.clone(), ordinal);
        Ok(handle)
    }

    async fn upload_part(
        &self,
        handle: &UploadHandle,
        part_number: u32,
        data: Bytes,
    ) -> Result<CompletedPart> {
        let ordinal = self
            .upload_ordinals
            .lock()
            .get(&handle.upload_id)
            .copied()
            .unwrap_or(0);
        if ordinal <= self.failing_uploads {
            return Err(if self.transient {
                Error::storage_transient(format!("SlowDown: part {part_number}"))
            } else {
                Error::storage_rejected("AccessDenied")
            });
        }
        self.inner.upload_part(handle, part_number, data).await
    }

    async fn complete_upload(
        &self,
        handle: &UploadHandle,
        parts: Vec<CompletedPart>,
    ) -> Result<ObjectInfo> {
        self.inner.complete_upload(handle, parts).await
    }

    async fn abort_upload(&self, handle: &UploadHandle) -> Result<()> {
        self.inner.abort_upload(handle).await
    }
}

/// Sink whose every call fails.
#[derive(Default)]
pub struct FailingSink {
    pub calls: AtomicUsize,
}

#[async_trait]
impl CompletionSink for FailingSink {
    async fn job_completed(&self, _job: &Job) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::Internal("notification endpoint down".to_string()))
    }

    async fn job_failed(&self, _job: &Job) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::Internal("notification endpoint down".to_string()))
    }
}

/// In-process dataset source serving fixed chunks, optionally paced.
#[derive(Default)]
pub struct ChunkSource {
    datasets: HashMap<String, (DatasetMetadata, Vec<&'static str>)>,
    chunk_delay: Duration,
}

impl ChunkSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(mut self, metadata: DatasetMetadata, chunks: Vec<&'static str>) -> Self {
        self.datasets.insert(metadata.id.clone(), (metadata, chunks));
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }
}

#[async_trait]
impl DatasetSource for ChunkSource {
    async fn metadata(&self, dataset_id: &str) -> Result<DatasetMetadata> {
        self.datasets
            .get(dataset_id)
            .map(|(metadata, _)| metadata.clone())
            .ok_or_else(|| Error::not_found("dataset", dataset_id))
    }

    async fn open_archive(&self, dataset_id: &str) -> Result<DatasetStream> {
        let (_, chunks) = self
            .datasets
            .get(dataset_id)
            .ok_or_else(|| Error::not_found("dataset", dataset_id))?;
        let delay = self.chunk_delay;
        let body = stream::iter(chunks.clone())
            .then(move |chunk| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok::<_, Error>(Bytes::from_static(chunk.as_bytes()))
            })
            .boxed();
        Ok(DatasetStream {
            content_length: None,
            body,
        })
    }
}

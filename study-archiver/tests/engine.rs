mod common;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll};
use std::time::Duration;

use common::{
    ChunkSource, FailingSink, FlakyStorage, Script, ScriptedPipeline, result_for, settle,
    test_config, wait_for_status,
};
use study_archiver::notification::RecordingSink;
use study_archiver::pipeline::{
    FixedEstimator, JobEvent, JobPipeline, ProgressReporter, QueueDepthStatus,
};
use study_archiver::source::DatasetMetadata;
use study_archiver::storage::MemoryObjectStorage;
use study_archiver::upload::UploadResult;
use study_archiver::{ArchiveEngine, DatasetRef, Error, Job, JobStatus, Priority, Result};

const MIB: u64 = 1024 * 1024;

fn scripted_engine(pipeline: Arc<ScriptedPipeline>) -> ArchiveEngine {
    ArchiveEngine::builder(test_config())
        .pipeline(pipeline)
        .start()
        .unwrap()
}

#[tokio::test]
async fn test_admission_reserves_and_completion_releases() {
    let pipeline = ScriptedPipeline::new();
    pipeline.hold("study-1");
    let engine = ArchiveEngine::builder(test_config())
        .pipeline(pipeline.clone())
        .estimator(Arc::new(FixedEstimator(100 * MIB)))
        .start()
        .unwrap();

    let job = engine
        .submit(DatasetRef::new("study-1"), Priority::Normal)
        .unwrap();
    assert_eq!(job.status, JobStatus::Waiting);
    assert_eq!(job.memory_estimate, 100 * MIB);

    let active = wait_for_status(&engine, job.id, JobStatus::Active).await;
    assert_eq!(active.attempt, 1);
    let budget = engine.budget();
    assert_eq!(budget.reserved_memory, 100 * MIB);
    assert_eq!(budget.active_count, 1);

    pipeline.release("study-1");
    let done = wait_for_status(&engine, job.id, JobStatus::Completed).await;
    assert_eq!(done.result.as_ref().map(|r| r.size), Some(4096));
    assert_eq!(done.progress, 100);
    assert_eq!(done.retry_count, 0);

    let budget = engine.budget();
    assert_eq!(budget.reserved_memory, 0);
    assert_eq!(budget.active_count, 0);

    let stats = engine.shutdown(Duration::from_secs(5)).await;
    assert_eq!(stats.total_jobs, 1);
    assert_eq!(stats.completed_jobs, 1);
    assert_eq!(stats.bytes_processed, 4096);
}

#[tokio::test]
async fn test_transient_part_failures_are_retried_until_success() {
    let mut config = test_config();
    config.retry.max_retries = 2;
    config.upload.part_size_bytes = 8;
    let storage = FlakyStorage::transient(2);
    let source = ChunkSource::new().with_dataset(
        DatasetMetadata::new("1.2.840.1").with_name("Chest CT"),
        vec!["0123456789", "abcdef"],
    );
    let engine = ArchiveEngine::builder(config)
        .source(Arc::new(source))
        .storage(storage.clone())
        .start()
        .unwrap();

    let job = engine
        .submit(DatasetRef::new("1.2.840.1"), Priority::Normal)
        .unwrap();
    settle(&engine, &[job.id]).await;

    let job = engine.get(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 2);
    assert_eq!(job.attempt, 3);

    let result = job.result.unwrap();
    assert_eq!(result.size, 16);
    assert!(result.key.contains("/Chest_CT_1.2.840.1_"));
    assert!(result.key.ends_with(&format!("_{}.zip", job.id)));
    let object = storage.inner.object(&result.bucket, &result.key).unwrap();
    assert_eq!(&object.data[..], b"0123456789abcdef");

    assert_eq!(storage.uploads_created(), 3);
    assert_eq!(storage.inner.aborted_uploads(), 2);
    assert_eq!(storage.inner.open_uploads(), 0);
    assert_eq!(engine.stats().retried_jobs, 2);

    engine.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_repeated_dataset_keeps_both_archives() {
    let storage = Arc::new(MemoryObjectStorage::new());
    let source = ChunkSource::new().with_dataset(
        DatasetMetadata::new("1.2.840.9").with_name("Spine MR"),
        vec!["spine"],
    );
    let engine = ArchiveEngine::builder(test_config())
        .source(Arc::new(source))
        .storage(storage.clone())
        .start()
        .unwrap();

    let first = engine
        .submit(DatasetRef::new("1.2.840.9"), Priority::Normal)
        .unwrap();
    let second = engine
        .submit(DatasetRef::new("1.2.840.9"), Priority::Normal)
        .unwrap();
    settle(&engine, &[first.id, second.id]).await;

    let keys: Vec<String> = [first.id, second.id]
        .iter()
        .map(|id| engine.get(*id).unwrap().result.unwrap().key)
        .collect();
    assert_ne!(keys[0], keys[1]);
    assert_eq!(storage.object_count(), 2);
    for key in &keys {
        let object = storage.object("study-archives", key).unwrap();
        assert_eq!(&object.data[..], b"spine");
    }

    engine.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_rejected_upload_fails_without_retry() {
    let mut config = test_config();
    config.upload.part_size_bytes = 4;
    let storage = FlakyStorage::rejecting();
    let source = ChunkSource::new().with_dataset(DatasetMetadata::new("denied"), vec!["abcdefgh"]);
    let engine = ArchiveEngine::builder(config)
        .source(Arc::new(source))
        .storage(storage.clone())
        .start()
        .unwrap();

    let job = engine
        .submit(DatasetRef::new("denied"), Priority::Normal)
        .unwrap();
    settle(&engine, &[job.id]).await;

    let job = engine.get(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 0);
    assert_eq!(job.attempt, 1);
    assert!(job.error.as_deref().unwrap_or_default().contains("AccessDenied"));
    assert!(job.result.is_none());

    assert_eq!(storage.uploads_created(), 1);
    assert_eq!(storage.inner.aborted_uploads(), 1);
    assert_eq!(storage.inner.object_count(), 0);
    assert_eq!(engine.budget().reserved_memory, 0);

    let stats = engine.stats();
    assert_eq!(stats.failed_jobs, 1);
    assert_eq!(stats.failures_by_kind.get("storage"), Some(&1));

    engine.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_retries_stop_after_max_retries() {
    let pipeline = ScriptedPipeline::new();
    pipeline.script("flaky", Script::AlwaysTransient);
    let engine = scripted_engine(pipeline.clone());

    let job = engine
        .submit(DatasetRef::new("flaky"), Priority::Normal)
        .unwrap();
    settle(&engine, &[job.id]).await;

    let job = engine.get(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(pipeline.attempts("flaky"), 3);
    assert_eq!(job.retry_count, 2);
    assert_eq!(job.max_retries, 2);

    let stats = engine.stats();
    assert_eq!(stats.retried_jobs, 2);
    assert_eq!(stats.failed_jobs, 1);

    engine.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_transient_failure_then_success() {
    let pipeline = ScriptedPipeline::new();
    pipeline.script("wobbly", Script::FailTransient(1));
    let engine = scripted_engine(pipeline.clone());

    let mut events = engine.subscribe();
    let job = engine
        .submit(DatasetRef::new("wobbly"), Priority::Normal)
        .unwrap();
    settle(&engine, &[job.id]).await;

    let job = engine.get(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 1);
    assert_eq!(pipeline.attempts("wobbly"), 2);

    let mut requeued = 0;
    while let Ok(event) = events.try_recv() {
        if let JobEvent::Requeued { retry_count, .. } = event {
            requeued += 1;
            assert_eq!(retry_count, 1);
        }
    }
    assert_eq!(requeued, 1);

    engine.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_pipeline_panic_fails_job() {
    let pipeline = ScriptedPipeline::new();
    pipeline.script("boom", Script::Panic);
    let engine = scripted_engine(pipeline.clone());

    let job = engine
        .submit(DatasetRef::new("boom"), Priority::Normal)
        .unwrap();
    settle(&engine, &[job.id]).await;

    let job = engine.get(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(pipeline.attempts("boom"), 1);
    assert!(job.error.unwrap().contains("panicked"));
    assert_eq!(engine.budget().active_count, 0);

    // The scheduler keeps working after a panicking pipeline.
    let next = engine
        .submit(DatasetRef::new("after"), Priority::Normal)
        .unwrap();
    settle(&engine, &[next.id]).await;
    assert_eq!(engine.get(next.id).unwrap().status, JobStatus::Completed);

    engine.shutdown(Duration::from_secs(5)).await;
}

/// Resolves immediately, then panics when dropped.
struct PanicOnDrop;

impl Future for PanicOnDrop {
    type Output = Result<UploadResult>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        Poll::Ready(Ok(result_for("lost")))
    }
}

impl Drop for PanicOnDrop {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            panic!("pipeline future panicked on drop");
        }
    }
}

/// Pipeline whose task dies after the pipeline itself has returned.
struct LostOutcomePipeline;

impl JobPipeline for LostOutcomePipeline {
    fn run<'a, 'b, 'c>(
        &'a self,
        _job: &'b Job,
        _progress: ProgressReporter,
    ) -> Pin<Box<dyn Future<Output = Result<UploadResult>> + Send + 'c>>
    where
        'a: 'c,
        'b: 'c,
        Self: 'c,
    {
        Box::pin(PanicOnDrop)
    }
}

#[tokio::test]
async fn test_task_lost_without_outcome_releases_budget_and_fails_job() {
    let engine = ArchiveEngine::builder(test_config())
        .pipeline(Arc::new(LostOutcomePipeline))
        .estimator(Arc::new(FixedEstimator(100 * MIB)))
        .start()
        .unwrap();

    let first = engine
        .submit(DatasetRef::new("lost-1"), Priority::Normal)
        .unwrap();
    let second = engine
        .submit(DatasetRef::new("lost-2"), Priority::Normal)
        .unwrap();
    settle(&engine, &[first.id, second.id]).await;

    for id in [first.id, second.id] {
        let job = engine.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 0);
        assert!(job.error.unwrap().contains("job task panicked"));
    }
    let budget = engine.budget();
    assert_eq!(budget.reserved_memory, 0);
    assert_eq!(budget.active_count, 0);

    let stats = engine.shutdown(Duration::from_secs(5)).await;
    assert_eq!(stats.failed_jobs, 2);
}

#[tokio::test]
async fn test_dispatch_order_follows_priority_then_arrival() {
    let mut config = test_config();
    config.budget.max_concurrent_jobs = 1;
    let pipeline = ScriptedPipeline::new();
    pipeline.hold("blocker");
    let engine = ArchiveEngine::builder(config)
        .pipeline(pipeline.clone())
        .start()
        .unwrap();

    let blocker = engine
        .submit(DatasetRef::new("blocker"), Priority::Low)
        .unwrap();
    wait_for_status(&engine, blocker.id, JobStatus::Active).await;

    let b = engine.submit(DatasetRef::new("B"), Priority::Normal).unwrap();
    let c = engine.submit(DatasetRef::new("C"), Priority::Normal).unwrap();
    let a = engine.submit(DatasetRef::new("A"), Priority::High).unwrap();
    assert_eq!(engine.queue_depth_status(), QueueDepthStatus::Normal);

    pipeline.release("blocker");
    settle(&engine, &[blocker.id, a.id, b.id, c.id]).await;

    assert_eq!(pipeline.started(), vec!["blocker", "A", "B", "C"]);
    assert_eq!(pipeline.peak_concurrency(), 1);

    engine.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_concurrency_ceiling_is_never_exceeded() {
    let mut config = test_config();
    config.budget.max_concurrent_jobs = 2;
    let pipeline = ScriptedPipeline::new();
    pipeline.set_delay(Duration::from_millis(30));
    let engine = ArchiveEngine::builder(config)
        .pipeline(pipeline.clone())
        .start()
        .unwrap();

    let ids: Vec<_> = (0..6)
        .map(|i| {
            engine
                .submit(DatasetRef::new(format!("ds-{i}")), Priority::Normal)
                .unwrap()
                .id
        })
        .collect();
    settle(&engine, &ids).await;

    assert!(pipeline.peak_concurrency() <= 2);
    assert_eq!(engine.counts().completed, 6);

    engine.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_memory_budget_limits_parallelism() {
    let mut config = test_config();
    config.budget.memory_ceiling_bytes = 1100;
    config.budget.system_reserve_bytes = 100;
    config.budget.max_concurrent_jobs = 4;
    let pipeline = ScriptedPipeline::new();
    pipeline.set_delay(Duration::from_millis(20));
    let engine = ArchiveEngine::builder(config)
        .pipeline(pipeline.clone())
        .estimator(Arc::new(FixedEstimator(600)))
        .start()
        .unwrap();

    let ids: Vec<_> = (0..4)
        .map(|i| {
            engine
                .submit(DatasetRef::new(format!("big-{i}")), Priority::Normal)
                .unwrap()
                .id
        })
        .collect();
    settle(&engine, &ids).await;

    assert_eq!(pipeline.peak_concurrency(), 1);
    assert_eq!(engine.counts().completed, 4);
    assert_eq!(engine.budget().reserved_memory, 0);

    engine.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_oversized_job_runs_alone() {
    let mut config = test_config();
    config.budget.memory_ceiling_bytes = 1100;
    config.budget.system_reserve_bytes = 100;
    let pipeline = ScriptedPipeline::new();
    let engine = ArchiveEngine::builder(config)
        .pipeline(pipeline.clone())
        .estimator(Arc::new(FixedEstimator(5000)))
        .start()
        .unwrap();

    let job = engine
        .submit(DatasetRef::new("huge"), Priority::Normal)
        .unwrap();
    settle(&engine, &[job.id]).await;
    assert_eq!(engine.get(job.id).unwrap().status, JobStatus::Completed);

    engine.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_progress_is_monotonic_and_ends_at_100() {
    let mut config = test_config();
    config.upload.part_size_bytes = 16;
    let chunks = vec!["abcdefgh"; 20];
    let source = ChunkSource::new()
        .with_dataset(DatasetMetadata::new("paced").with_size(160), chunks)
        .with_chunk_delay(Duration::from_millis(5));
    let storage = FlakyStorage::transient(0);
    let engine = ArchiveEngine::builder(config)
        .source(Arc::new(source))
        .storage(storage)
        .start()
        .unwrap();

    let job = engine
        .submit(DatasetRef::new("paced"), Priority::Normal)
        .unwrap();
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let current = engine.get(job.id).unwrap();
        seen.push(current.progress);
        if current.status.is_terminal() {
            assert_eq!(current.status, JobStatus::Completed);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "job did not finish");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress regressed: {seen:?}");
    assert_eq!(seen.last(), Some(&100));

    engine.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_shutdown_waits_for_active_jobs_and_rejects_submissions() {
    let pipeline = ScriptedPipeline::new();
    pipeline.set_delay(Duration::from_millis(100));
    let engine = scripted_engine(pipeline.clone());

    let job = engine
        .submit(DatasetRef::new("in-flight"), Priority::Normal)
        .unwrap();
    wait_for_status(&engine, job.id, JobStatus::Active).await;

    let stats = engine.shutdown(Duration::from_secs(5)).await;
    assert_eq!(stats.completed_jobs, 1);
    assert_eq!(engine.get(job.id).unwrap().status, JobStatus::Completed);

    let err = engine
        .submit(DatasetRef::new("late"), Priority::Normal)
        .unwrap_err();
    assert!(matches!(err, Error::ShuttingDown));

    // A second shutdown is a no-op.
    let again = engine.shutdown(Duration::from_secs(1)).await;
    assert_eq!(again.completed_jobs, 1);
}

#[tokio::test]
async fn test_shutdown_timeout_fails_active_and_keeps_waiting() {
    let mut config = test_config();
    config.budget.max_concurrent_jobs = 1;
    let pipeline = ScriptedPipeline::new();
    pipeline.hold("stuck");
    let sink = Arc::new(RecordingSink::new());
    let engine = ArchiveEngine::builder(config)
        .pipeline(pipeline.clone())
        .sink(sink.clone())
        .start()
        .unwrap();

    let stuck = engine
        .submit(DatasetRef::new("stuck"), Priority::Normal)
        .unwrap();
    wait_for_status(&engine, stuck.id, JobStatus::Active).await;
    let queued = engine
        .submit(DatasetRef::new("queued"), Priority::High)
        .unwrap();

    engine.shutdown(Duration::from_millis(50)).await;

    let stuck = engine.get(stuck.id).unwrap();
    assert_eq!(stuck.status, JobStatus::Failed);
    assert!(stuck.error.unwrap().contains("shut down"));
    assert_eq!(engine.get(queued.id).unwrap().status, JobStatus::Waiting);
    assert_eq!(pipeline.attempts("queued"), 0);

    let budget = engine.budget();
    assert_eq!(budget.reserved_memory, 0);
    assert_eq!(budget.active_count, 0);

    let failed = sink.failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].input.dataset_id, "stuck");
}

#[tokio::test]
async fn test_sink_failures_do_not_change_outcome() {
    let pipeline = ScriptedPipeline::new();
    pipeline.script("bad", Script::Fatal);
    let sink = Arc::new(FailingSink::default());
    let engine = ArchiveEngine::builder(test_config())
        .pipeline(pipeline.clone())
        .sink(sink.clone())
        .start()
        .unwrap();

    let good = engine
        .submit(DatasetRef::new("good"), Priority::Normal)
        .unwrap();
    let bad = engine
        .submit(DatasetRef::new("bad"), Priority::Normal)
        .unwrap();
    settle(&engine, &[good.id, bad.id]).await;

    engine.shutdown(Duration::from_secs(5)).await;

    assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
    assert_eq!(engine.get(good.id).unwrap().status, JobStatus::Completed);
    let bad = engine.get(bad.id).unwrap();
    assert_eq!(bad.status, JobStatus::Failed);
    assert_eq!(bad.retry_count, 0);
}

#[tokio::test]
async fn test_recording_sink_sees_each_terminal_job_once() {
    let pipeline = ScriptedPipeline::new();
    pipeline.script("retry-then-fail", Script::AlwaysTransient);
    let sink = Arc::new(RecordingSink::new());
    let engine = ArchiveEngine::builder(test_config())
        .pipeline(pipeline.clone())
        .sink(sink.clone())
        .start()
        .unwrap();

    let ok = engine
        .submit(DatasetRef::new("fine"), Priority::Normal)
        .unwrap();
    let failing = engine
        .submit(DatasetRef::new("retry-then-fail"), Priority::Normal)
        .unwrap();
    settle(&engine, &[ok.id, failing.id]).await;
    engine.shutdown(Duration::from_secs(5)).await;

    let completed = sink.completed();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, ok.id);
    let failed = sink.failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, failing.id);
    assert_eq!(failed[0].retry_count, 2);
}

#[tokio::test]
async fn test_empty_dataset_id_rejected() {
    let engine = scripted_engine(ScriptedPipeline::new());
    let err = engine
        .submit(DatasetRef::new("  "), Priority::Normal)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidMetadata { .. }));
    assert!(engine.list_all().is_empty());
    engine.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_storage_required_without_custom_pipeline() {
    let err = ArchiveEngine::builder(test_config()).start().err().unwrap();
    assert!(matches!(err, Error::Configuration(_)));
}

#[tokio::test]
async fn test_prometheus_export_reflects_jobs() {
    let pipeline = ScriptedPipeline::new();
    pipeline.script("nope", Script::Fatal);
    let engine = scripted_engine(pipeline);

    let a = engine
        .submit(DatasetRef::new("yes"), Priority::Normal)
        .unwrap();
    let b = engine
        .submit(DatasetRef::new("nope"), Priority::Normal)
        .unwrap();
    settle(&engine, &[a.id, b.id]).await;

    let text = engine.prometheus();
    assert!(text.contains("study_archiver_jobs_submitted_total 2"));
    assert!(text.contains("study_archiver_jobs_completed_total 1"));
    assert!(text.contains("study_archiver_job_failures_total{kind=\"storage\"} 1"));

    engine.shutdown(Duration::from_secs(5)).await;
}

//! Per-job progress reporting.
//!
//! Pipeline tasks never touch the job registry directly. They own a
//! [`ProgressTracker`] that turns byte counters into a percent and sends
//! [`JobProgressUpdate`] messages to the scheduler, which applies them.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::job_queue::JobId;

/// Percent boundaries of the pipeline phases and the size heuristics used
/// when the archive size is unknown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Percent reached when the fetch phase is complete.
    #[serde(default = "default_fetch_ceiling")]
    pub fetch_ceiling: u8,
    /// Percent reached when every part is uploaded; the rest is finalize.
    #[serde(default = "default_upload_ceiling")]
    pub upload_ceiling: u8,
    /// Assumed archive bytes per dataset instance.
    #[serde(default = "default_bytes_per_instance")]
    pub bytes_per_instance: u64,
    /// Assumed archive size when neither size nor instance count is known.
    #[serde(default = "default_fallback_expected_bytes")]
    pub fallback_expected_bytes: u64,
}

fn default_fetch_ceiling() -> u8 {
    40
}

fn default_upload_ceiling() -> u8 {
    90
}

fn default_bytes_per_instance() -> u64 {
    512 * 1024
}

fn default_fallback_expected_bytes() -> u64 {
    256 * 1024 * 1024
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            fetch_ceiling: default_fetch_ceiling(),
            upload_ceiling: default_upload_ceiling(),
            bytes_per_instance: default_bytes_per_instance(),
            fallback_expected_bytes: default_fallback_expected_bytes(),
        }
    }
}

/// Phase a running job is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressPhase {
    Fetching,
    Uploading,
    Finalizing,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProgressSnapshot {
    pub phase: ProgressPhase,
    pub percent: u8,
    pub bytes_fetched: u64,
    pub bytes_uploaded: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_bytes: Option<u64>,
    pub parts_completed: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct JobProgressUpdate {
    pub job_id: JobId,
    /// Attempt the update belongs to; updates from earlier attempts are stale.
    pub attempt: u32,
    pub snapshot: JobProgressSnapshot,
}

#[derive(Clone)]
pub struct ProgressReporter {
    job_id: JobId,
    attempt: u32,
    tx: mpsc::Sender<JobProgressUpdate>,
}

impl ProgressReporter {
    pub fn new(job_id: JobId, attempt: u32, tx: mpsc::Sender<JobProgressUpdate>) -> Self {
        Self {
            job_id,
            attempt,
            tx,
        }
    }

    pub fn noop(job_id: JobId) -> Self {
        let (tx, _rx) = mpsc::channel::<JobProgressUpdate>(1);
        Self::new(job_id, 1, tx)
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Best-effort send. Snapshots are cumulative, so a dropped one is
    /// superseded by the next.
    pub fn report(&self, mut snapshot: JobProgressSnapshot) {
        snapshot.updated_at = Utc::now();
        let _ = self.tx.try_send(JobProgressUpdate {
            job_id: self.job_id,
            attempt: self.attempt,
            snapshot,
        });
    }
}

/// How the expected archive size was determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeHint {
    /// Exact size from the source (content length or metadata).
    Known(u64),
    /// Estimate from instance count or the configured fallback.
    Estimated(u64),
}

impl SizeHint {
    pub fn resolve(
        known: Option<u64>,
        instance_count: Option<u64>,
        config: &ProgressConfig,
    ) -> Self {
        match (known, instance_count) {
            (Some(size), _) if size > 0 => SizeHint::Known(size),
            (_, Some(count)) if count > 0 => {
                SizeHint::Estimated(count.saturating_mul(config.bytes_per_instance))
            }
            _ => SizeHint::Estimated(config.fallback_expected_bytes.max(1)),
        }
    }

    pub fn bytes(&self) -> u64 {
        match self {
            SizeHint::Known(b) | SizeHint::Estimated(b) => *b,
        }
    }
}

/// Shared byte counters of one pipeline run.
///
/// The fetch transform and the upload manager both feed it; every change that
/// raises the combined percent is pushed to the reporter.
pub struct ProgressTracker {
    reporter: ProgressReporter,
    fetch_ceiling: f64,
    upload_ceiling: f64,
    size_hint: SizeHint,
    fetched: AtomicU64,
    uploaded: AtomicU64,
    parts: AtomicU32,
    fetch_done: AtomicBool,
    last_percent: AtomicU8,
}

impl ProgressTracker {
    pub fn new(reporter: ProgressReporter, size_hint: SizeHint, config: &ProgressConfig) -> Self {
        let upload_ceiling = config.upload_ceiling.min(99);
        let fetch_ceiling = config.fetch_ceiling.min(upload_ceiling);
        Self {
            reporter,
            fetch_ceiling: fetch_ceiling as f64,
            upload_ceiling: upload_ceiling as f64,
            size_hint,
            fetched: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
            parts: AtomicU32::new(0),
            fetch_done: AtomicBool::new(false),
            last_percent: AtomicU8::new(0),
        }
    }

    pub fn bytes_fetched(&self) -> u64 {
        self.fetched.load(Ordering::Relaxed)
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn percent(&self) -> u8 {
        self.last_percent.load(Ordering::Relaxed)
    }

    pub fn record_fetched(&self, bytes: usize) {
        self.fetched.fetch_add(bytes as u64, Ordering::Relaxed);
        self.publish(ProgressPhase::Fetching, None);
    }

    pub fn fetch_finished(&self) {
        self.fetch_done.store(true, Ordering::Relaxed);
        self.publish(ProgressPhase::Uploading, None);
    }

    pub fn record_part_uploaded(&self, bytes: usize) {
        self.uploaded.fetch_add(bytes as u64, Ordering::Relaxed);
        self.parts.fetch_add(1, Ordering::Relaxed);
        self.publish(ProgressPhase::Uploading, None);
    }

    pub fn finalizing(&self) {
        self.publish(ProgressPhase::Finalizing, Some(self.upload_ceiling as u8));
    }

    pub fn finished(&self) {
        self.publish(ProgressPhase::Done, Some(100));
    }

    /// Fraction of the fetch phase completed, in `[0, 1]`.
    pub fn fetch_fraction(&self) -> f64 {
        if self.fetch_done.load(Ordering::Relaxed) {
            return 1.0;
        }
        let fetched = self.bytes_fetched() as f64;
        match self.size_hint {
            SizeHint::Known(total) => (fetched / total as f64).min(0.99),
            SizeHint::Estimated(expected) => {
                let expected = expected as f64;
                if fetched <= expected {
                    0.9 * fetched / expected
                } else {
                    // Past the estimate: keep creeping toward 1 without reaching it.
                    0.9 + 0.09 * (1.0 - expected / fetched)
                }
            }
        }
    }

    /// Fraction of the upload phase completed, in `[0, 1]`.
    pub fn upload_fraction(&self) -> f64 {
        let uploaded = self.bytes_uploaded() as f64;
        let denominator = if self.fetch_done.load(Ordering::Relaxed) {
            self.bytes_fetched()
        } else {
            self.size_hint.bytes().max(self.bytes_fetched())
        };
        if denominator == 0 {
            return if self.fetch_done.load(Ordering::Relaxed) {
                1.0
            } else {
                0.0
            };
        }
        (uploaded / denominator as f64).min(1.0)
    }

    fn combined_percent(&self) -> u8 {
        let fetch = self.fetch_ceiling * self.fetch_fraction();
        let upload = (self.upload_ceiling - self.fetch_ceiling) * self.upload_fraction();
        (fetch + upload).floor().clamp(0.0, self.upload_ceiling) as u8
    }

    fn publish(&self, phase: ProgressPhase, fixed: Option<u8>) {
        let percent = fixed.unwrap_or_else(|| self.combined_percent());
        let previous = self.last_percent.fetch_max(percent, Ordering::Relaxed);
        if percent <= previous && fixed.is_none() {
            return;
        }
        self.reporter.report(JobProgressSnapshot {
            phase,
            percent: percent.max(previous),
            bytes_fetched: self.bytes_fetched(),
            bytes_uploaded: self.bytes_uploaded(),
            expected_bytes: match self.size_hint {
                SizeHint::Known(b) => Some(b),
                SizeHint::Estimated(_) => None,
            },
            parts_completed: self.parts.load(Ordering::Relaxed),
            updated_at: Utc::now(),
        });
    }
}

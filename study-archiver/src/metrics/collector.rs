use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::pipeline::BudgetSnapshot;

/// Aggregate counters updated by the scheduler and the memory sampler.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    jobs_submitted: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_retried: AtomicU64,
    failures_by_kind: DashMap<&'static str, AtomicU64>,
    processing_ms_total: AtomicU64,
    processing_count: AtomicU64,
    bytes_processed: AtomicU64,

    active_jobs: AtomicU64,
    reserved_memory_bytes: AtomicU64,
    memory_ceiling_bytes: AtomicU64,
    queue_depth: AtomicU64,

    current_memory_bytes: AtomicU64,
    peak_memory_bytes: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submitted(&self) {
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self, bytes: u64, duration_ms: u64) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_processed.fetch_add(bytes, Ordering::Relaxed);
        self.record_processing_time(duration_ms);
    }

    pub fn record_failed(&self, kind: &'static str, duration_ms: u64) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        self.failures_by_kind
            .entry(kind)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
        self.record_processing_time(duration_ms);
    }

    pub fn record_retry(&self) {
        self.jobs_retried.fetch_add(1, Ordering::Relaxed);
    }

    fn record_processing_time(&self, duration_ms: u64) {
        self.processing_ms_total
            .fetch_add(duration_ms, Ordering::Relaxed);
        self.processing_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_budget(&self, budget: &BudgetSnapshot) {
        self.active_jobs
            .store(budget.active_count as u64, Ordering::Relaxed);
        self.reserved_memory_bytes
            .store(budget.reserved_memory, Ordering::Relaxed);
        self.memory_ceiling_bytes
            .store(budget.memory_ceiling, Ordering::Relaxed);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth as u64, Ordering::Relaxed);
    }

    /// Record a process memory sample; the peak only ever grows.
    pub fn record_memory_sample(&self, bytes: u64) {
        self.current_memory_bytes.store(bytes, Ordering::Relaxed);
        self.peak_memory_bytes.fetch_max(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let processing_count = self.processing_count.load(Ordering::Relaxed);
        let avg_processing_secs = if processing_count > 0 {
            self.processing_ms_total.load(Ordering::Relaxed) as f64
                / processing_count as f64
                / 1000.0
        } else {
            0.0
        };

        MetricsSnapshot {
            total_jobs: self.jobs_submitted.load(Ordering::Relaxed),
            completed_jobs: self.jobs_completed.load(Ordering::Relaxed),
            failed_jobs: self.jobs_failed.load(Ordering::Relaxed),
            retried_jobs: self.jobs_retried.load(Ordering::Relaxed),
            failures_by_kind: self
                .failures_by_kind
                .iter()
                .map(|e| (e.key().to_string(), e.value().load(Ordering::Relaxed)))
                .collect(),
            avg_processing_secs,
            bytes_processed: self.bytes_processed.load(Ordering::Relaxed),
            active_jobs: self.active_jobs.load(Ordering::Relaxed),
            reserved_memory_bytes: self.reserved_memory_bytes.load(Ordering::Relaxed),
            memory_ceiling_bytes: self.memory_ceiling_bytes.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            current_memory_bytes: self.current_memory_bytes.load(Ordering::Relaxed),
            peak_memory_bytes: self.peak_memory_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of every metric.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    /// Requeues after transient failures.
    pub retried_jobs: u64,
    pub failures_by_kind: HashMap<String, u64>,
    /// Mean wall time of terminal jobs, first admission to terminal state.
    pub avg_processing_secs: f64,
    pub bytes_processed: u64,
    pub active_jobs: u64,
    pub reserved_memory_bytes: u64,
    pub memory_ceiling_bytes: u64,
    pub queue_depth: u64,
    pub current_memory_bytes: u64,
    pub peak_memory_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_counters_and_average() {
        let collector = MetricsCollector::new();
        collector.record_submitted();
        collector.record_submitted();
        collector.record_completed(1000, 2000);
        collector.record_failed("storage", 4000);

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.total_jobs, 2);
        assert_eq!(snapshot.completed_jobs, 1);
        assert_eq!(snapshot.failed_jobs, 1);
        assert_eq!(snapshot.bytes_processed, 1000);
        assert_eq!(snapshot.avg_processing_secs, 3.0);
        assert_eq!(snapshot.failures_by_kind.get("storage"), Some(&1));
    }

    #[test]
    fn test_peak_memory_is_monotonic() {
        let collector = MetricsCollector::new();
        collector.record_memory_sample(300);
        collector.record_memory_sample(100);

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.current_memory_bytes, 100);
        assert_eq!(snapshot.peak_memory_bytes, 300);
    }

    #[test]
    fn test_budget_gauges() {
        let collector = MetricsCollector::new();
        collector.set_budget(&BudgetSnapshot {
            memory_ceiling: 14,
            reserved_memory: 3,
            concurrency_ceiling: 4,
            active_count: 2,
        });
        collector.set_queue_depth(5);

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.active_jobs, 2);
        assert_eq!(snapshot.reserved_memory_bytes, 3);
        assert_eq!(snapshot.queue_depth, 5);
    }
}

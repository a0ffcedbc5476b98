//! Prometheus text-format export of [`MetricsCollector`].

use std::fmt::Write;
use std::sync::Arc;

use super::collector::MetricsCollector;

pub struct PrometheusExporter {
    collector: Arc<MetricsCollector>,
    namespace: String,
}

impl PrometheusExporter {
    pub fn new(collector: Arc<MetricsCollector>) -> Self {
        Self::with_namespace(collector, "study_archiver")
    }

    pub fn with_namespace(collector: Arc<MetricsCollector>, namespace: impl Into<String>) -> Self {
        Self {
            collector,
            namespace: namespace.into(),
        }
    }

    pub fn export(&self) -> String {
        let snapshot = self.collector.snapshot();
        let mut output = String::new();

        let counters = [
            ("jobs_submitted_total", "Jobs submitted", snapshot.total_jobs),
            ("jobs_completed_total", "Jobs completed", snapshot.completed_jobs),
            ("jobs_failed_total", "Jobs failed terminally", snapshot.failed_jobs),
            (
                "jobs_retried_total",
                "Requeues after transient failures",
                snapshot.retried_jobs,
            ),
            (
                "bytes_processed_total",
                "Archive bytes uploaded by completed jobs",
                snapshot.bytes_processed,
            ),
        ];
        for (name, help, value) in counters {
            self.write_metric(&mut output, "counter", name, help, value as f64, &[]);
        }

        let mut kinds: Vec<_> = snapshot.failures_by_kind.iter().collect();
        kinds.sort();
        for (kind, count) in kinds {
            self.write_metric(
                &mut output,
                "counter",
                "job_failures_total",
                "Terminal job failures by error kind",
                *count as f64,
                &[("kind", kind.as_str())],
            );
        }

        self.write_metric(
            &mut output,
            "gauge",
            "job_processing_seconds_avg",
            "Average processing time of terminal jobs",
            snapshot.avg_processing_secs,
            &[],
        );

        let gauges = [
            (
                "active_jobs",
                "Jobs currently holding a budget reservation",
                snapshot.active_jobs,
            ),
            (
                "reserved_memory_bytes",
                "Sum of memory estimates of active jobs",
                snapshot.reserved_memory_bytes,
            ),
            (
                "memory_ceiling_bytes",
                "Configured memory ceiling",
                snapshot.memory_ceiling_bytes,
            ),
            ("queue_depth", "Jobs waiting for admission", snapshot.queue_depth),
            (
                "process_memory_bytes",
                "Last sampled resident memory",
                snapshot.current_memory_bytes,
            ),
            (
                "process_memory_peak_bytes",
                "Peak sampled resident memory",
                snapshot.peak_memory_bytes,
            ),
        ];
        for (name, help, value) in gauges {
            self.write_metric(&mut output, "gauge", name, help, value as f64, &[]);
        }

        output
    }

    fn write_metric(
        &self,
        output: &mut String,
        metric_type: &str,
        name: &str,
        help: &str,
        value: f64,
        labels: &[(&str, &str)],
    ) {
        let full_name = format!("{}_{}", self.namespace, name);
        let _ = writeln!(output, "# HELP {} {}", full_name, help);
        let _ = writeln!(output, "# TYPE {} {}", full_name, metric_type);

        if labels.is_empty() {
            let _ = writeln!(output, "{} {}", full_name, value);
        } else {
            let labels_str = labels
                .iter()
                .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
                .collect::<Vec<_>>()
                .join(",");
            let _ = writeln!(output, "{}{{{}}} {}", full_name, labels_str, value);
        }
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

//! Engine metrics.
//!
//! - Job counters (submitted, completed, failed, retried) and processing time
//! - Budget gauges (active jobs, reserved memory, queue depth)
//! - Process memory sampled in the background, current and peak
//! - Prometheus text export

mod collector;
mod prometheus;
mod sampler;

pub use collector::{MetricsCollector, MetricsSnapshot};
pub use prometheus::PrometheusExporter;
pub use sampler::{MemorySampler, SamplerConfig};

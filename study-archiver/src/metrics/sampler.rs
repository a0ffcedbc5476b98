//! Background sampling of the process's resident memory.
//!
//! Samples feed metrics only. Admission never reads them.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::collector::MetricsCollector;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    5
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_secs: default_interval_secs(),
        }
    }
}

pub struct MemorySampler {
    collector: Arc<MetricsCollector>,
    interval: Duration,
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl MemorySampler {
    pub fn new(collector: Arc<MetricsCollector>, config: &SamplerConfig) -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("Process memory sampling unavailable: {}", e);
                None
            }
        };
        Self {
            collector,
            interval: Duration::from_secs(config.interval_secs.max(1)),
            pid,
            system: Mutex::new(System::new()),
        }
    }

    /// Take one sample. Returns the resident memory in bytes, if known.
    pub fn sample(&self) -> Option<u64> {
        let pid = self.pid?;
        let memory = {
            let mut system = self.system.lock();
            system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[pid]),
                true,
                ProcessRefreshKind::nothing().with_memory(),
            );
            system.process(pid).map(|p| p.memory())
        }?;
        self.collector.record_memory_sample(memory);
        Some(memory)
    }

    /// Sample every interval until `cancel` fires.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = self.interval.as_secs(), "Memory sampler started");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Some(bytes) = self.sample() {
                            debug!(bytes, "Sampled process memory");
                        }
                    }
                }
            }
            info!("Memory sampler stopped");
        })
    }
}

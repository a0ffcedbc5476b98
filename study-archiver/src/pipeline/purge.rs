//! Periodic eviction of old terminal job records.
//!
//! Completed and failed jobs stay queryable for the retention window, then
//! are dropped from the registry. Waiting and active jobs are never touched.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::job_queue::JobQueue;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeConfig {
    /// How long terminal jobs stay queryable. 0 keeps them forever.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Interval between purge checks in seconds.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

fn default_retention_secs() -> u64 {
    3600
}

fn default_check_interval_secs() -> u64 {
    60
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

impl PurgeConfig {
    pub fn with_retention_secs(mut self, secs: u64) -> Self {
        self.retention_secs = secs;
        self
    }

    pub fn with_check_interval_secs(mut self, secs: u64) -> Self {
        self.check_interval_secs = secs;
        self
    }
}

pub struct JobPurgeService {
    config: PurgeConfig,
    queue: Arc<JobQueue>,
}

impl JobPurgeService {
    pub fn new(config: PurgeConfig, queue: Arc<JobQueue>) -> Self {
        Self { config, queue }
    }

    /// Evict terminal jobs that finished more than the retention window
    /// before `now`. Returns the number of evicted jobs.
    pub fn run_purge_at(&self, now: DateTime<Utc>) -> usize {
        if self.config.retention_secs == 0 {
            debug!("Job purging disabled (retention_secs = 0)");
            return 0;
        }

        let Some(cutoff) = i64::try_from(self.config.retention_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|retention| now.checked_sub_signed(retention))
        else {
            return 0;
        };
        let evicted = self.queue.evict_terminal_before(cutoff);

        if evicted.is_empty() {
            debug!("No jobs to purge");
        } else {
            info!(
                "Purged {} terminal jobs (retention: {}s)",
                evicted.len(),
                self.config.retention_secs
            );
        }
        evicted.len()
    }

    pub fn run_purge(&self) -> usize {
        self.run_purge_at(Utc::now())
    }

    /// Start the background purge task.
    pub fn start_background_task(
        self: Arc<Self>,
        cancellation_token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut check_interval =
                interval(Duration::from_secs(self.config.check_interval_secs.max(1)));

            info!(
                "Job purge service started (retention: {}s, interval: {}s)",
                self.config.retention_secs, self.config.check_interval_secs
            );

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("Job purge service shutting down");
                        break;
                    }
                    _ = check_interval.tick() => {
                        let deleted = self.run_purge();
                        if deleted > 0 {
                            debug!("Purge cycle completed: {} jobs evicted", deleted);
                        }
                    }
                }
            }
        })
    }

    pub fn config(&self) -> &PurgeConfig {
        &self.config
    }
}

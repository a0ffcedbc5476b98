//! Engine configuration.
//!
//! Every section is defaulted, so an empty config (or environment) yields a
//! working local setup. Environment overrides use `ARCHIVER_*` keys.

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::logging::LoggingConfig;
use crate::metrics::SamplerConfig;
use crate::pipeline::{
    BudgetConfig, InstanceCountEstimator, JobQueueConfig, ProgressConfig, PurgeConfig,
    RetryPolicy, SchedulerConfig,
};
use crate::source::SourceConfig;
use crate::upload::UploadConfig;
use crate::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub queue: JobQueueConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub estimator: InstanceCountEstimator,
    #[serde(default)]
    pub purge: PurgeConfig,
    #[serde(default)]
    pub metrics: SamplerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Defaults overridden by `ARCHIVER_*` environment variables, after
    /// loading `.env` if present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for `ARCHIVER_*` keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        parse_into(&get, "ARCHIVER_MEMORY_CEILING_BYTES", &mut config.budget.memory_ceiling_bytes)?;
        parse_into(&get, "ARCHIVER_SYSTEM_RESERVE_BYTES", &mut config.budget.system_reserve_bytes)?;
        parse_into(&get, "ARCHIVER_MAX_CONCURRENT_JOBS", &mut config.budget.max_concurrent_jobs)?;
        parse_into(&get, "ARCHIVER_MAX_RETRIES", &mut config.retry.max_retries)?;
        parse_into(&get, "ARCHIVER_QUEUE_WARNING_DEPTH", &mut config.queue.warning_threshold)?;
        parse_into(&get, "ARCHIVER_QUEUE_CRITICAL_DEPTH", &mut config.queue.critical_threshold)?;

        parse_into(&get, "ARCHIVER_SOURCE_BASE_URL", &mut config.source.base_url)?;
        parse_into(&get, "ARCHIVER_SOURCE_AUTH_HEADER", &mut config.source.auth_header)?;
        if let Some(token) = get("ARCHIVER_SOURCE_AUTH_TOKEN") {
            config.source.auth_token = Some(token);
        }
        parse_into(
            &get,
            "ARCHIVER_SOURCE_CONNECT_TIMEOUT_SECS",
            &mut config.source.connect_timeout_secs,
        )?;
        parse_into(
            &get,
            "ARCHIVER_SOURCE_READ_TIMEOUT_SECS",
            &mut config.source.read_timeout_secs,
        )?;
        parse_into(
            &get,
            "ARCHIVER_SOURCE_METADATA_TIMEOUT_SECS",
            &mut config.source.metadata_timeout_secs,
        )?;
        parse_into(
            &get,
            "ARCHIVER_SOURCE_POOL_MAX_IDLE",
            &mut config.source.pool_max_idle_per_host,
        )?;
        parse_into(
            &get,
            "ARCHIVER_METADATA_CACHE_TTL_SECS",
            &mut config.source.metadata_cache_ttl_secs,
        )?;

        parse_into(&get, "ARCHIVER_UPLOAD_BUCKET", &mut config.upload.bucket)?;
        parse_into(&get, "ARCHIVER_UPLOAD_KEY_PREFIX", &mut config.upload.key_prefix)?;
        parse_into(&get, "ARCHIVER_UPLOAD_PART_SIZE_BYTES", &mut config.upload.part_size_bytes)?;
        parse_into(&get, "ARCHIVER_UPLOAD_PART_CONCURRENCY", &mut config.upload.part_concurrency)?;
        parse_into(
            &get,
            "ARCHIVER_UPLOAD_PART_TIMEOUT_SECS",
            &mut config.upload.part_timeout_secs,
        )?;
        parse_into(&get, "ARCHIVER_UPLOAD_CONTENT_TYPE", &mut config.upload.content_type)?;
        if let Some(base) = get("ARCHIVER_PUBLIC_BASE_URL") {
            config.upload.public_base_url = Some(base);
        }

        parse_into(&get, "ARCHIVER_PROGRESS_FETCH_CEILING", &mut config.progress.fetch_ceiling)?;
        parse_into(&get, "ARCHIVER_PROGRESS_UPLOAD_CEILING", &mut config.progress.upload_ceiling)?;

        parse_into(&get, "ARCHIVER_ESTIMATE_BASE_BYTES", &mut config.estimator.base_bytes)?;
        parse_into(
            &get,
            "ARCHIVER_ESTIMATE_PER_INSTANCE_BYTES",
            &mut config.estimator.per_instance_bytes,
        )?;
        parse_into(&get, "ARCHIVER_ESTIMATE_MAX_BYTES", &mut config.estimator.max_bytes)?;
        parse_into(&get, "ARCHIVER_ESTIMATE_FALLBACK_BYTES", &mut config.estimator.fallback_bytes)?;

        parse_into(&get, "ARCHIVER_RETENTION_SECS", &mut config.purge.retention_secs)?;
        parse_into(&get, "ARCHIVER_PURGE_INTERVAL_SECS", &mut config.purge.check_interval_secs)?;
        parse_into(&get, "ARCHIVER_MEMORY_SAMPLING", &mut config.metrics.enabled)?;
        parse_into(&get, "ARCHIVER_MEMORY_SAMPLE_SECS", &mut config.metrics.interval_secs)?;
        parse_into(&get, "ARCHIVER_IDLE_POLL_MS", &mut config.scheduler.idle_poll_ms)?;

        if let Some(filter) = get("ARCHIVER_LOG_FILTER") {
            config.logging.filter = Some(filter);
        }
        parse_into(&get, "ARCHIVER_LOG_FORMAT", &mut config.logging.format)?;
        if let Some(dir) = get("ARCHIVER_LOG_DIR") {
            config.logging.log_dir = Some(dir);
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.budget.validate()?;
        self.source.validate()?;
        self.upload.validate()?;

        let progress = &self.progress;
        if progress.fetch_ceiling == 0
            || progress.fetch_ceiling >= progress.upload_ceiling
            || progress.upload_ceiling >= 100
        {
            return Err(Error::config(format!(
                "progress ceilings must satisfy 0 < fetch ({}) < upload ({}) < 100",
                progress.fetch_ceiling, progress.upload_ceiling
            )));
        }

        if self.estimator.max_bytes < self.estimator.base_bytes {
            return Err(Error::config("estimator max_bytes is below base_bytes"));
        }
        if self.queue.warning_threshold > self.queue.critical_threshold {
            return Err(Error::config(
                "queue warning threshold exceeds the critical threshold",
            ));
        }
        Ok(())
    }
}

fn parse_into<T, G>(get: &G, key: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: Display,
    G: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("invalid value for {key}: {e}")))?;
    }
    Ok(())
}

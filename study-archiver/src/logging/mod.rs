//! Logging setup with a reloadable filter and optional daily log files.

use std::path::PathBuf;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

use crate::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "study_archiver=info";

/// Timestamps in the server's local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(Error::config(format!("unknown log format `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive; `RUST_LOG` wins when set.
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub format: LogFormat,
    /// Directory for daily rolling log files. Console only when unset.
    #[serde(default)]
    pub log_dir: Option<String>,
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
}

fn default_file_prefix() -> String {
    "study-archiver.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: None,
            format: LogFormat::default(),
            log_dir: None,
            file_prefix: default_file_prefix(),
        }
    }
}

impl LoggingConfig {
    /// Filter used when `RUST_LOG` is not set.
    pub fn directive(&self) -> &str {
        self.filter
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .unwrap_or(DEFAULT_LOG_FILTER)
    }
}

pub type FilterHandle = Handle<EnvFilter, Registry>;

/// Runtime control over the installed subscriber.
pub struct LoggingHandle {
    handle: FilterHandle,
    log_dir: Option<PathBuf>,
}

impl LoggingHandle {
    pub fn get_filter(&self) -> String {
        self.handle
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    pub fn set_filter(&self, directive: &str) -> Result<()> {
        let new_filter = EnvFilter::try_new(directive)
            .map_err(|e| Error::config(format!("Invalid filter directive: {}", e)))?;

        self.handle
            .reload(new_filter)
            .map_err(|e| Error::Internal(format!("Failed to reload filter: {}", e)))?;

        info!(directive = %directive, "Log filter updated");
        Ok(())
    }

    pub fn log_dir(&self) -> Option<&PathBuf> {
        self.log_dir.as_ref()
    }
}

/// Install the global subscriber.
///
/// Returns the control handle and, when file logging is enabled, the
/// appender's guard. Keep the guard alive for the process lifetime or
/// buffered lines are lost.
pub fn init_logging(config: &LoggingConfig) -> Result<(LoggingHandle, Option<WorkerGuard>)> {
    let initial_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.directive()))
        .map_err(|e| Error::config(format!("Invalid filter directive: {}", e)))?;
    let (filter_layer, filter_handle) = reload::Layer::new(initial_filter);

    let (file_writer, guard, log_dir) = match &config.log_dir {
        Some(dir) => {
            let log_path = PathBuf::from(dir);
            std::fs::create_dir_all(&log_path)?;
            let file_appender = tracing_appender::rolling::daily(&log_path, &config.file_prefix);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            (Some(non_blocking), Some(guard), Some(log_path))
        }
        None => (None, None, None),
    };

    let console = match config.format {
        LogFormat::Text => fmt::layer().with_ansi(true).with_timer(LocalTimer).boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_timer(LocalTimer)
            .boxed(),
    };
    let file = file_writer.map(|writer| {
        fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_timer(LocalTimer)
    });

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| Error::Internal(format!("Failed to set global default subscriber: {}", e)))?;

    Ok((
        LoggingHandle {
            handle: filter_handle,
            log_dir,
        },
        guard,
    ))
}

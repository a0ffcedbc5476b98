//! study-archiver library crate.
//!
//! A resource-bounded engine that streams remote dataset archives into
//! multi-part object storage uploads.

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod notification;
pub mod pipeline;
pub mod source;
pub mod storage;
pub mod upload;
pub mod utils;

pub use config::EngineConfig;
pub use engine::{ArchiveEngine, EngineBuilder};
pub use error::{Error, Result};
pub use pipeline::{DatasetRef, Job, JobEvent, JobId, JobStatus, Priority};

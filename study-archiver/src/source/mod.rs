//! Remote dataset archive source.
//!
//! The source exposes two operations per dataset: its metadata and a
//! streamed archive of its full content.

mod http;

pub use http::{HttpDatasetSource, SourceConfig};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Dataset metadata as returned by the archive source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    /// Identifier of the dataset.
    pub id: String,
    /// Human-readable name, used to name the output object.
    #[serde(default, alias = "description")]
    pub name: Option<String>,
    /// Number of instances (files) in the dataset.
    #[serde(default, alias = "instances_count")]
    pub instance_count: Option<u64>,
    /// Number of series/parts in the dataset.
    #[serde(default, alias = "series_count")]
    pub part_count: Option<u64>,
    /// Archive size in bytes, when the source knows it.
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

impl DatasetMetadata {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            instance_count: None,
            part_count: None,
            size_bytes: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_instance_count(mut self, count: u64) -> Self {
        self.instance_count = Some(count);
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size_bytes = Some(size);
        self
    }

    /// Reject metadata that cannot name an output object.
    pub fn validate(&self, requested_id: &str) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::invalid_metadata(requested_id, "empty dataset id"));
        }
        if self.id != requested_id {
            return Err(Error::invalid_metadata(
                requested_id,
                format!("source returned metadata for {}", self.id),
            ));
        }
        Ok(())
    }

    /// Name used for the output object.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.id)
    }
}

/// An open archive byte stream.
pub struct DatasetStream {
    /// Content length announced by the source, if any.
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes>>,
}

impl std::fmt::Debug for DatasetStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetStream")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// A remote source of dataset archives.
#[async_trait]
pub trait DatasetSource: Send + Sync {
    /// Fetch metadata for `dataset_id`.
    async fn metadata(&self, dataset_id: &str) -> Result<DatasetMetadata>;

    /// Open a streaming archive of the full dataset.
    async fn open_archive(&self, dataset_id: &str) -> Result<DatasetStream>;
}

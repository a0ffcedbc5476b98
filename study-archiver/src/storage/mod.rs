//! Object storage capability used by the upload manager.
//!
//! Only the four multi-part operations are required. Backends map their own
//! failures onto [`Error::Storage`](crate::Error::Storage) with the right
//! retry classification.

mod memory;

pub use memory::MemoryObjectStorage;

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::Result;

/// An open multi-part upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadHandle {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
}

/// A part accepted by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    /// 1-based part number.
    pub part_number: u32,
    pub etag: String,
}

/// The committed object as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub etag: String,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<UploadHandle>;

    async fn upload_part(
        &self,
        handle: &UploadHandle,
        part_number: u32,
        data: Bytes,
    ) -> Result<CompletedPart>;

    /// Commit the upload. `parts` are sorted by part number.
    async fn complete_upload(
        &self,
        handle: &UploadHandle,
        parts: Vec<CompletedPart>,
    ) -> Result<ObjectInfo>;

    /// Discard an upload and every part stored for it.
    async fn abort_upload(&self, handle: &UploadHandle) -> Result<()>;

    /// Direct URL of a stored object, if the backend has one.
    fn object_url(&self, _bucket: &str, _key: &str) -> Option<String> {
        None
    }
}

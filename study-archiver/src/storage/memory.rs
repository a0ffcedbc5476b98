use std::collections::{BTreeMap, HashMap};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tracing::debug;

use super::{CompletedPart, ObjectInfo, ObjectStorage, UploadHandle};
use crate::{Error, Result};

/// An object committed to [`MemoryObjectStorage`].
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub content_type: String,
    pub metadata: HashMap<String, String>,
    pub etag: String,
}

#[derive(Debug)]
struct OpenUpload {
    bucket: String,
    key: String,
    content_type: String,
    metadata: HashMap<String, String>,
    parts: BTreeMap<u32, (String, Bytes)>,
}

/// In-process object store with multi-part semantics.
///
/// Backs the binary's local mode and the tests. Parts are kept until the
/// upload is completed or aborted.
#[derive(Debug, Default)]
pub struct MemoryObjectStorage {
    next_upload: AtomicU64,
    uploads: DashMap<String, OpenUpload>,
    objects: DashMap<(String, String), StoredObject>,
    aborted: AtomicU64,
    base_url: Option<String>,
}

impl MemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `{base_url}/{bucket}/{key}` as the object URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.clone())
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Uploads neither completed nor aborted.
    pub fn open_uploads(&self) -> usize {
        self.uploads.len()
    }

    pub fn aborted_uploads(&self) -> u64 {
        self.aborted.load(Ordering::SeqCst)
    }
}

fn etag_of(data: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<UploadHandle> {
        if bucket.is_empty() {
            return Err(Error::storage_rejected("InvalidBucketName: empty bucket"));
        }
        if key.is_empty() {
            return Err(Error::storage_rejected("InvalidKey: empty key"));
        }

        let upload_id = format!("upload-{}", self.next_upload.fetch_add(1, Ordering::SeqCst) + 1);
        self.uploads.insert(
            upload_id.clone(),
            OpenUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                content_type: content_type.to_string(),
                metadata: metadata.clone(),
                parts: BTreeMap::new(),
            },
        );
        debug!(bucket, key, %upload_id, "Created multipart upload");
        Ok(UploadHandle {
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id,
        })
    }

    async fn upload_part(
        &self,
        handle: &UploadHandle,
        part_number: u32,
        data: Bytes,
    ) -> Result<CompletedPart> {
        if part_number == 0 {
            return Err(Error::storage_rejected("InvalidPart: part numbers start at 1"));
        }
        let mut upload = self
            .uploads
            .get_mut(&handle.upload_id)
            .ok_or_else(|| Error::storage_rejected(format!("NoSuchUpload: {}", handle.upload_id)))?;
        let etag = etag_of(&data);
        upload.parts.insert(part_number, (etag.clone(), data));
        Ok(CompletedPart { part_number, etag })
    }

    async fn complete_upload(
        &self,
        handle: &UploadHandle,
        parts: Vec<CompletedPart>,
    ) -> Result<ObjectInfo> {
        let (_, upload) = self
            .uploads
            .remove(&handle.upload_id)
            .ok_or_else(|| Error::storage_rejected(format!("NoSuchUpload: {}", handle.upload_id)))?;

        let mut body = BytesMut::new();
        let mut etags = String::new();
        let mut previous = 0;
        for part in &parts {
            if part.part_number <= previous {
                return Err(Error::storage_rejected("InvalidPartOrder"));
            }
            previous = part.part_number;
            match upload.parts.get(&part.part_number) {
                Some((etag, data)) if *etag == part.etag => {
                    body.extend_from_slice(data);
                    etags.push_str(etag);
                }
                _ => {
                    return Err(Error::storage_rejected(format!(
                        "InvalidPart: {}",
                        part.part_number
                    )));
                }
            }
        }

        let data = body.freeze();
        let etag = format!("\"{}-{}\"", etag_of(etags.as_bytes()), parts.len());
        let size = data.len() as u64;
        self.objects.insert(
            (upload.bucket.clone(), upload.key.clone()),
            StoredObject {
                data,
                content_type: upload.content_type,
                metadata: upload.metadata,
                etag: etag.clone(),
            },
        );
        debug!(bucket = %upload.bucket, key = %upload.key, size, "Completed multipart upload");
        Ok(ObjectInfo {
            key: upload.key,
            size,
            etag,
        })
    }

    async fn abort_upload(&self, handle: &UploadHandle) -> Result<()> {
        if self.uploads.remove(&handle.upload_id).is_some() {
            self.aborted.fetch_add(1, Ordering::SeqCst);
            debug!(upload_id = %handle.upload_id, "Aborted multipart upload");
        }
        Ok(())
    }

    fn object_url(&self, bucket: &str, key: &str) -> Option<String> {
        self.base_url
            .as_ref()
            .map(|base| format!("{base}/{bucket}/{key}"))
    }
}

use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use moka::future::Cache;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use super::{DatasetMetadata, DatasetSource, DatasetStream};
use crate::utils::http_client::{TransportSettings, build_client};
use crate::{Error, Result};

/// Connection settings for the dataset archive endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_auth_header")]
    pub auth_header: String,
    /// Value sent in `auth_header` on every request.
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Maximum stall between two chunks of a response body.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// Total timeout of a metadata request.
    #[serde(default = "default_metadata_timeout_secs")]
    pub metadata_timeout_secs: u64,
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
    #[serde(default = "default_pool_idle_timeout_secs")]
    pub pool_idle_timeout_secs: u64,
    /// How long fetched metadata is shared between jobs. Zero disables caching.
    #[serde(default = "default_metadata_cache_ttl_secs")]
    pub metadata_cache_ttl_secs: u64,
    #[serde(default = "default_metadata_cache_capacity")]
    pub metadata_cache_capacity: u64,
}

fn default_base_url() -> String {
    "http://localhost:8042".to_string()
}

fn default_auth_header() -> String {
    "Authorization".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_read_timeout_secs() -> u64 {
    300
}

fn default_metadata_timeout_secs() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    8
}

fn default_pool_idle_timeout_secs() -> u64 {
    90
}

fn default_metadata_cache_ttl_secs() -> u64 {
    60
}

fn default_metadata_cache_capacity() -> u64 {
    1024
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            auth_header: default_auth_header(),
            auth_token: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            metadata_timeout_secs: default_metadata_timeout_secs(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout_secs(),
            metadata_cache_ttl_secs: default_metadata_cache_ttl_secs(),
            metadata_cache_capacity: default_metadata_cache_capacity(),
        }
    }
}

impl SourceConfig {
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| Error::config(format!("invalid source base_url: {e}")))?;
        if url.cannot_be_a_base() {
            return Err(Error::config(format!(
                "source base_url cannot be a base: {}",
                self.base_url
            )));
        }
        if self.metadata_timeout_secs == 0 {
            return Err(Error::config("metadata_timeout_secs must be positive"));
        }
        Ok(())
    }

    fn transport(&self) -> TransportSettings {
        TransportSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            pool_max_idle_per_host: self.pool_max_idle_per_host,
            pool_idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
        }
    }
}

/// Dataset source speaking `GET /datasets/{id}` and `GET /datasets/{id}/archive`.
///
/// One pooled client serves both calls. Metadata is cached per dataset id for
/// a short TTL so jobs for the same dataset share a lookup.
pub struct HttpDatasetSource {
    client: Client,
    base_url: Url,
    metadata_timeout: Duration,
    metadata_cache: Option<Cache<String, DatasetMetadata>>,
}

impl HttpDatasetSource {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        config.validate()?;
        let mut base_url = Url::parse(&config.base_url)
            .map_err(|e| Error::config(format!("invalid source base_url: {e}")))?;
        // Keep any path prefix when joining segments.
        if let Ok(mut segments) = base_url.path_segments_mut() {
            segments.pop_if_empty();
        }

        let auth = config
            .auth_token
            .as_deref()
            .map(|token| (config.auth_header.as_str(), token));
        let client = build_client(config.transport(), auth)?;

        let metadata_cache = (config.metadata_cache_ttl_secs > 0).then(|| {
            Cache::builder()
                .max_capacity(config.metadata_cache_capacity)
                .time_to_live(Duration::from_secs(config.metadata_cache_ttl_secs))
                .build()
        });

        Ok(Self {
            client,
            base_url,
            metadata_timeout: Duration::from_secs(config.metadata_timeout_secs),
            metadata_cache,
        })
    }

    fn dataset_url(&self, dataset_id: &str, archive: bool) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| Error::config("source base_url cannot be a base"))?;
            segments.push("datasets").push(dataset_id);
            if archive {
                segments.push("archive");
            }
        }
        Ok(url)
    }

    async fn fetch_metadata(&self, dataset_id: &str) -> Result<DatasetMetadata> {
        let url = self.dataset_url(dataset_id, false)?;
        debug!(%url, "Fetching dataset metadata");

        let response = self
            .client
            .get(url.clone())
            .timeout(self.metadata_timeout)
            .send()
            .await?;
        let response = check_status(response, dataset_id, "metadata")?;

        let body = response.bytes().await?;
        let metadata: DatasetMetadata = serde_json::from_slice(&body)
            .map_err(|e| Error::invalid_metadata(dataset_id, e.to_string()))?;
        metadata.validate(dataset_id)?;
        Ok(metadata)
    }
}

fn check_status(
    response: reqwest::Response,
    dataset_id: &str,
    operation: &'static str,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(Error::not_found("dataset", dataset_id));
    }
    if !status.is_success() {
        return Err(Error::http_status(
            status,
            response.url().as_str(),
            operation,
        ));
    }
    Ok(response)
}

#[async_trait]
impl DatasetSource for HttpDatasetSource {
    #[instrument(skip(self))]
    async fn metadata(&self, dataset_id: &str) -> Result<DatasetMetadata> {
        let Some(cache) = &self.metadata_cache else {
            return self.fetch_metadata(dataset_id).await;
        };

        // Concurrent lookups of one id share a single fetch. Errors are not cached.
        cache
            .try_get_with_by_ref(dataset_id, self.fetch_metadata(dataset_id))
            .await
            .map_err(Error::from_shared)
    }

    #[instrument(skip(self))]
    async fn open_archive(&self, dataset_id: &str) -> Result<DatasetStream> {
        let url = self.dataset_url(dataset_id, true)?;
        debug!(%url, "Opening dataset archive");

        // No total timeout: large archives take as long as they take, the
        // client read timeout bounds stalls.
        let response = self.client.get(url).send().await?;
        let response = check_status(response, dataset_id, "archive")?;

        let content_length = response.content_length().filter(|len| *len > 0);
        let body = response.bytes_stream().map_err(Error::from).boxed();
        Ok(DatasetStream {
            content_length,
            body,
        })
    }
}

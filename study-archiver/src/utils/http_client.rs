use std::{sync::OnceLock, time::Duration};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

use crate::{Error, Result};

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Safe to ignore: can happen if another crate installed it first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Timeouts and pooling for a shared transport.
#[derive(Debug, Clone, Copy)]
pub struct TransportSettings {
    /// Time allowed to establish a connection.
    pub connect_timeout: Duration,
    /// Maximum gap between two received chunks; bounds hung transfers
    /// without capping the total duration of a large download.
    pub read_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
}

/// Build a connection-pooled client that sends `auth` on every request.
pub fn build_client(
    settings: TransportSettings,
    auth: Option<(&str, &str)>,
) -> Result<reqwest::Client> {
    install_rustls_provider();

    let mut headers = HeaderMap::new();
    if let Some((name, value)) = auth {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::config(format!("invalid auth header name `{name}`: {e}")))?;
        let mut value = HeaderValue::from_str(value)
            .map_err(|e| Error::config(format!("invalid auth header value: {e}")))?;
        value.set_sensitive(true);
        headers.insert(name, value);
    }

    let mut builder = reqwest::Client::builder()
        .default_headers(headers)
        .pool_idle_timeout(settings.pool_idle_timeout);

    if settings.connect_timeout > Duration::ZERO {
        builder = builder.connect_timeout(settings.connect_timeout);
    }
    if settings.read_timeout > Duration::ZERO {
        builder = builder.read_timeout(settings.read_timeout);
    }
    if settings.pool_max_idle_per_host > 0 {
        builder = builder.pool_max_idle_per_host(settings.pool_max_idle_per_host);
    }

    builder
        .build()
        .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))
}

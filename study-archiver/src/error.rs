//! Application-wide error types.

use std::sync::Arc;

use reqwest::StatusCode;
use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("operation timed out: {operation}")]
    Timeout { operation: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {message}")]
    Storage { message: String, retryable: bool },

    #[error("invalid dataset metadata for {dataset_id}: {reason}")]
    InvalidMetadata { dataset_id: String, reason: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),

    /// Copy of an error that several callers received from one shared request.
    #[error("{message}")]
    Shared {
        message: String,
        retryable: bool,
        kind: &'static str,
    },
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn http_status(status: StatusCode, url: impl Into<String>, operation: &'static str) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// A storage failure worth retrying (throttling, 5xx, dropped connection).
    pub fn storage_transient(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            retryable: true,
        }
    }

    /// The storage backend rejected the request outright.
    pub fn storage_rejected(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn invalid_metadata(dataset_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidMetadata {
            dataset_id: dataset_id.into(),
            reason: reason.into(),
        }
    }

    /// Take back an error handed to every caller of a coalesced request.
    ///
    /// The caller holding the only reference gets the original. Others get a
    /// copy that keeps the message, the retry classification and the kind.
    pub fn from_shared(shared: Arc<Error>) -> Self {
        Arc::try_unwrap(shared).unwrap_or_else(|shared| shared.duplicate())
    }

    fn duplicate(&self) -> Self {
        match self {
            Self::HttpStatus {
                status,
                url,
                operation,
            } => Self::http_status(*status, url.clone(), *operation),
            Self::Timeout { operation } => Self::timeout(operation.clone()),
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
            Self::Storage { message, retryable } => Self::Storage {
                message: message.clone(),
                retryable: *retryable,
            },
            Self::InvalidMetadata { dataset_id, reason } => {
                Self::invalid_metadata(dataset_id.clone(), reason.clone())
            }
            Self::NotFound { entity_type, id } => Self::not_found(entity_type.clone(), id.clone()),
            Self::InvalidStateTransition { from, to } => Self::InvalidStateTransition {
                from: from.clone(),
                to: to.clone(),
            },
            Self::Configuration(msg) => Self::Configuration(msg.clone()),
            Self::ShuttingDown => Self::ShuttingDown,
            Self::Internal(msg) => Self::Internal(msg.clone()),
            Self::Network { .. } | Self::Serialization(_) | Self::Shared { .. } => Self::Shared {
                message: self.to_string(),
                retryable: self.is_retryable(),
                kind: self.kind(),
            },
        }
    }

    /// Whether the failure is transient and the job may be attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { source } => {
                if let Some(status) = source.status() {
                    return is_retryable_status(status);
                }
                source.is_timeout() || source.is_connect() || source.is_request() || source.is_body()
            }
            Self::HttpStatus { status, .. } => is_retryable_status(*status),
            Self::Timeout { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::Interrupted
            ),
            Self::Storage { retryable, .. } | Self::Shared { retryable, .. } => *retryable,
            Self::InvalidMetadata { .. }
            | Self::NotFound { .. }
            | Self::Serialization(_)
            | Self::InvalidStateTransition { .. }
            | Self::Configuration(_)
            | Self::ShuttingDown
            | Self::Internal(_) => false,
        }
    }

    /// Short label of the error class, used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::HttpStatus { .. } => "http_status",
            Self::Timeout { .. } => "timeout",
            Self::Io(_) => "io",
            Self::Storage { .. } => "storage",
            Self::InvalidMetadata { .. } => "invalid_metadata",
            Self::NotFound { .. } => "not_found",
            Self::Serialization(_) => "serialization",
            Self::InvalidStateTransition { .. } => "invalid_state",
            Self::Configuration(_) => "configuration",
            Self::ShuttingDown => "shutdown",
            Self::Internal(_) => "internal",
            Self::Shared { kind, .. } => kind,
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

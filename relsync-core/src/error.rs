//! Error types shared by the backends and the repository.
//!
//! Two layers:
//! - [`BlobError`] is what a [`BlobStoreClient`](crate::contract::BlobStoreClient) reports
//!   for a single call. It knows whether retrying could help.
//! - [`RepositoryError`] is what [`ObjectRepository`](crate::repository::ObjectRepository)
//!   surfaces to callers. Every variant produced from a backend call carries the
//!   human-readable operation description ("Uploading X", "Downloading Y").

use crate::feed::FeedError;

/// Result alias for backend calls.
pub type BlobResult<T> = Result<T, BlobError>;

/// Result alias for repository operations.
pub type RepoResult<T> = Result<T, RepositoryError>;

/// Failure of a single backend call.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("object `{key}` not found")]
    NotFound { key: String },

    /// The create-if-absent condition failed: someone else created the object first.
    #[error("object `{key}` already exists")]
    Conflict { key: String },

    #[error("HTTP {status} for `{key}`: {message}")]
    Http {
        key: String,
        status: u16,
        message: String,
    },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("attempt timed out after {0:?}")]
    TimedOut(std::time::Duration),

    #[error("checksum mismatch for `{key}`: expected {expected}, got {actual}")]
    ChecksumMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("invalid object key `{key}`: {reason}")]
    InvalidKey { key: String, reason: String },

    /// Failure reported by an `object_store` backed client.
    #[error("object store error for `{key}`: {source}")]
    Store {
        key: String,
        #[source]
        source: object_store::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BlobError {
    /// Whether another attempt of the same call might succeed.
    ///
    /// Not-found, conflicts and client-side HTTP errors are final. Request
    /// timeouts (408), throttling (429) and server errors are transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            BlobError::NotFound { .. }
            | BlobError::Conflict { .. }
            | BlobError::InvalidKey { .. } => false,
            BlobError::Http { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            BlobError::Transport(e) => !e.is_builder(),
            BlobError::Store { source, .. } => !matches!(
                source,
                object_store::Error::PermissionDenied { .. }
                    | object_store::Error::Unauthenticated { .. }
                    | object_store::Error::InvalidPath { .. }
                    | object_store::Error::NotSupported { .. }
                    | object_store::Error::NotImplemented
                    | object_store::Error::UnknownConfigurationKey { .. }
            ),
            BlobError::TimedOut(_) | BlobError::ChecksumMismatch { .. } | BlobError::Io(_) => true,
        }
    }
}

/// Failure of a repository operation, as surfaced to callers.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The remote feed exists but its content is not a valid feed.
    #[error("release feed `{key}` is malformed: {source}")]
    Parse {
        key: String,
        #[source]
        source: FeedError,
    },

    /// Lost a create-if-absent race. Terminal; never retried.
    #[error("{description}: `{key}` was created concurrently by another publisher")]
    Conflict { description: String, key: String },

    #[error("{description}: `{key}` does not exist")]
    NotFound { description: String, key: String },

    #[error("{description} failed after {attempts} attempt(s): {source}")]
    Exhausted {
        description: String,
        attempts: u32,
        #[source]
        source: BlobError,
    },

    /// A non-retryable backend failure other than conflict or not-found.
    #[error("{description} failed: {source}")]
    Failed {
        description: String,
        #[source]
        source: BlobError,
    },

    #[error("{description} was cancelled")]
    Cancelled { description: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl RepositoryError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, RepositoryError::Conflict { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RepositoryError::Cancelled { .. })
    }

    /// Wraps a final (non-retryable) backend error with the operation description.
    pub(crate) fn from_blob(description: &str, err: BlobError) -> Self {
        match err {
            BlobError::Conflict { key } => RepositoryError::Conflict {
                description: description.to_string(),
                key,
            },
            BlobError::NotFound { key } => RepositoryError::NotFound {
                description: description.to_string(),
                key,
            },
            other => RepositoryError::Failed {
                description: description.to_string(),
                source: other,
            },
        }
    }
}

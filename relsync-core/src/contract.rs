//! # contract: the capability a blob backend must provide
//!
//! [`BlobStoreClient`] is the only thing the repository knows about storage.
//! Implement it once per backend (cloud blob service, local directory, plain
//! HTTP target); the orchestration in [`crate::repository`] never sees a
//! vendor type.
//!
//! ## Rules for implementors
//! - Keys are backend-relative. The client prepends its own normalized prefix
//!   (see [`normalize_prefix`]).
//! - "Absent" is a value, not an error: [`get_bytes`](BlobStoreClient::get_bytes) and
//!   [`get_properties`](BlobStoreClient::get_properties) return `Ok(None)`.
//! - [`delete`](BlobStoreClient::delete) of a missing key succeeds.
//! - [`UploadCondition::IfAbsent`] must be atomic on the store side and report
//!   [`BlobError::Conflict`] when the object already exists.
//!
//! ## Mocking & Testing
//! The trait is annotated for `mockall`; `MockBlobStoreClient` is exported
//! behind the `test-export-mocks` feature so integration tests can use it.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;

use crate::error::{BlobError, BlobResult};

/// Cache-control value attached to objects that must never be served stale.
pub const NO_CACHE: &str = "no-cache";

/// Precondition for [`BlobStoreClient::put_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadCondition {
    /// Atomic create: fail with [`BlobError::Conflict`] if the key exists.
    IfAbsent,
    /// Unconditional overwrite.
    Overwrite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOptions {
    pub condition: UploadCondition,
    /// Cache-Control response header to store with the object.
    pub cache_control: Option<String>,
    /// Lowercase hex SHA-256 of the file, for backends that keep it as metadata.
    pub content_sha256: Option<String>,
}

impl PutOptions {
    pub fn new(condition: UploadCondition) -> Self {
        Self {
            condition,
            cache_control: None,
            content_sha256: None,
        }
    }
}

/// Receives the running byte count of a transfer.
///
/// Called after every chunk with the total written so far, so the last call
/// carries the final size. Clones share the same callback.
#[derive(Clone)]
pub struct TransferProgress(Arc<dyn Fn(u64) + Send + Sync>);

impl TransferProgress {
    pub fn new(on_bytes: impl Fn(u64) + Send + Sync + 'static) -> Self {
        Self(Arc::new(on_bytes))
    }

    pub fn report(&self, bytes_so_far: u64) {
        (self.0)(bytes_so_far)
    }
}

impl fmt::Debug for TransferProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransferProgress")
    }
}

/// What a properties lookup reports about a stored object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobProperties {
    /// Lowercase hex SHA-256, when the backend knows it.
    pub content_sha256: Option<String>,
    pub size: Option<u64>,
}

#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait BlobStoreClient: Send + Sync {
    /// Fetch a whole object. `Ok(None)` when it does not exist.
    async fn get_bytes(&self, key: &str) -> BlobResult<Option<Vec<u8>>>;

    /// Upload a local file under `key`.
    async fn put_file(&self, key: &str, local_path: &Path, options: PutOptions) -> BlobResult<()>;

    /// Remove an object. Removing a missing object is a success.
    async fn delete(&self, key: &str) -> BlobResult<()>;

    /// Stored properties of an object. `Ok(None)` when it does not exist.
    async fn get_properties(&self, key: &str) -> BlobResult<Option<BlobProperties>>;

    /// Stream an object into `local_path`, creating or truncating it.
    /// Returns the number of bytes written. Missing objects are [`BlobError::NotFound`].
    /// `progress`, when given, receives the running byte count.
    async fn download_file(
        &self,
        key: &str,
        local_path: &Path,
        progress: Option<TransferProgress>,
    ) -> BlobResult<u64>;
}

#[async_trait]
impl<T> BlobStoreClient for Arc<T>
where
    T: BlobStoreClient + ?Sized,
{
    async fn get_bytes(&self, key: &str) -> BlobResult<Option<Vec<u8>>> {
        (**self).get_bytes(key).await
    }

    async fn put_file(&self, key: &str, local_path: &Path, options: PutOptions) -> BlobResult<()> {
        (**self).put_file(key, local_path, options).await
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        (**self).delete(key).await
    }

    async fn get_properties(&self, key: &str) -> BlobResult<Option<BlobProperties>> {
        (**self).get_properties(key).await
    }

    async fn download_file(
        &self,
        key: &str,
        local_path: &Path,
        progress: Option<TransferProgress>,
    ) -> BlobResult<u64> {
        (**self).download_file(key, local_path, progress).await
    }
}

/// Normalizes a key prefix: empty when unset or blank, otherwise ending in `/`
/// with no leading `/`.
pub fn normalize_prefix(prefix: Option<&str>) -> String {
    let trimmed = prefix.unwrap_or_default().trim().trim_start_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    }
}

/// Rejects keys that could escape the configured prefix.
pub fn validate_key(key: &str) -> BlobResult<()> {
    let reason = if key.is_empty() {
        Some("key is empty")
    } else if key.starts_with('/') || key.starts_with('\\') {
        Some("key must be relative")
    } else if key.split(['/', '\\']).any(|segment| segment == "..") {
        Some("key must not contain `..` segments")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(BlobError::InvalidKey {
            key: key.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

//! Local directory acting as an object store.
//!
//! Useful for staging feeds on a file share and for tests. Objects are plain
//! files under `<root>/<prefix>`. Writes go through a temporary file in the
//! target directory and a rename, so readers never observe half-written
//! objects; create-if-absent uses a no-clobber rename. The client is
//! stateless apart from its paths and is safe to share across tasks.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::checksum::file_sha256;
use crate::config::DownloadOptions;
use crate::contract::{
    normalize_prefix, validate_key, BlobProperties, BlobStoreClient, PutOptions, TransferProgress,
    UploadCondition,
};
use crate::error::{BlobError, BlobResult, RepoResult, RepositoryError};
use crate::repository::ClientFactory;

const COPY_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalConnection {
    pub root: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct LocalFactory;

impl ClientFactory for LocalFactory {
    type Connection = LocalConnection;
    type Client = LocalDirectoryClient;

    fn create_client(&self, options: &DownloadOptions<LocalConnection>) -> RepoResult<LocalDirectoryClient> {
        if options.connection.root.as_os_str().is_empty() {
            return Err(RepositoryError::Config(
                "local backend needs a root directory".to_string(),
            ));
        }
        Ok(LocalDirectoryClient::new(
            options.connection.root.clone(),
            options.prefix.as_deref(),
        ))
    }
}

#[derive(Debug, Clone)]
pub struct LocalDirectoryClient {
    root: PathBuf,
    prefix: String,
}

impl LocalDirectoryClient {
    pub fn new(root: impl Into<PathBuf>, prefix: Option<&str>) -> Self {
        Self {
            root: root.into(),
            prefix: normalize_prefix(prefix),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn path_for(&self, key: &str) -> BlobResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(format!("{}{}", self.prefix, key)))
    }
}

fn not_found_as_none<T>(result: io::Result<T>) -> BlobResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(BlobError::Io(e)),
    }
}

#[async_trait]
impl BlobStoreClient for LocalDirectoryClient {
    async fn get_bytes(&self, key: &str) -> BlobResult<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        not_found_as_none(tokio::fs::read(&path).await)
    }

    async fn put_file(&self, key: &str, local_path: &Path, options: PutOptions) -> BlobResult<()> {
        let path = self.path_for(key)?;
        let parent = path.parent().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
        tokio::fs::create_dir_all(&parent).await?;

        let staged = tempfile::Builder::new()
            .prefix(".relsync-")
            .tempfile_in(&parent)?
            .into_temp_path();
        tokio::fs::copy(local_path, &staged).await?;

        if let Some(cache_control) = options.cache_control.as_deref() {
            debug!(key, cache_control, "Local backend stores no cache metadata");
        }

        match options.condition {
            UploadCondition::Overwrite => staged.persist(&path).map_err(|e| e.error)?,
            UploadCondition::IfAbsent => {
                if let Err(e) = staged.persist_noclobber(&path) {
                    if e.error.kind() == io::ErrorKind::AlreadyExists {
                        return Err(BlobError::Conflict {
                            key: key.to_string(),
                        });
                    }
                    return Err(BlobError::Io(e.error));
                }
            }
        }
        debug!(key, path = %path.display(), "Stored object");
        Ok(())
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        let path = self.path_for(key)?;
        not_found_as_none(tokio::fs::remove_file(&path).await)?;
        Ok(())
    }

    async fn get_properties(&self, key: &str) -> BlobResult<Option<BlobProperties>> {
        let path = self.path_for(key)?;
        let Some(metadata) = not_found_as_none(tokio::fs::metadata(&path).await)? else {
            return Ok(None);
        };
        let hash = not_found_as_none(file_sha256(&path))?;
        Ok(hash.map(|sha| BlobProperties {
            content_sha256: Some(sha),
            size: Some(metadata.len()),
        }))
    }

    async fn download_file(
        &self,
        key: &str,
        local_path: &Path,
        progress: Option<TransferProgress>,
    ) -> BlobResult<u64> {
        let path = self.path_for(key)?;
        let mut source = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(BlobError::NotFound {
                    key: key.to_string(),
                })
            }
            Err(e) => return Err(BlobError::Io(e)),
        };

        let mut target = tokio::fs::File::create(local_path).await?;
        let mut buffer = vec![0u8; COPY_CHUNK];
        let mut written = 0u64;
        loop {
            let read = source.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            target.write_all(&buffer[..read]).await?;
            written += read as u64;
            if let Some(progress) = &progress {
                progress.report(written);
            }
        }
        target.flush().await?;
        Ok(written)
    }
}

//! Object repository: publishes and retrieves release assets through any
//! [`BlobStoreClient`].
//!
//! The repository holds no durable state. Each public operation builds a
//! client from its options via the [`ClientFactory`], does its work and drops
//! the client again; everything persistent lives in the object store.
//!
//! # Publish ordering
//! [`ObjectRepository::publish`] uploads assets first and the feed last, so a
//! reader never sees a feed entry whose asset is not there yet. The feed is a
//! read-modify-write without a lock: two publishers racing on one channel can
//! lose an entry. Releases are expected to come from one pipeline per channel.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checksum::file_sha256;
use crate::config::{DownloadOptions, UploadOptions};
use crate::contract::{BlobStoreClient, PutOptions, TransferProgress, UploadCondition, NO_CACHE};
use crate::error::{BlobError, RepoResult, RepositoryError};
use crate::feed::{AssetEntry, ReleaseFeed};
use crate::retry::RetryExecutor;

/// Builds a backend client from options. Construction must not touch the network.
pub trait ClientFactory: Send + Sync {
    type Connection: Send + Sync;
    type Client: BlobStoreClient;

    fn create_client(
        &self,
        options: &DownloadOptions<Self::Connection>,
    ) -> RepoResult<Self::Client>;
}

/// A factory that hands out one shared, pre-built client regardless of options.
#[derive(Debug)]
pub struct SharedClientFactory<T: ?Sized> {
    client: Arc<T>,
}

impl<T: ?Sized> SharedClientFactory<T> {
    pub fn new(client: Arc<T>) -> Self {
        Self { client }
    }
}

impl<T> ClientFactory for SharedClientFactory<T>
where
    T: BlobStoreClient + ?Sized,
{
    type Connection = ();
    type Client = Arc<T>;

    fn create_client(&self, _options: &DownloadOptions<()>) -> RepoResult<Arc<T>> {
        Ok(self.client.clone())
    }
}

/// Result of [`ObjectRepository::upload_object`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The file was written. `overwrote` is true when a differing object was replaced.
    Uploaded { overwrote: bool },
    /// The remote object already has identical content.
    SkippedIdentical,
    /// The remote object differs and overwriting was not requested.
    SkippedDiffers,
}

/// A local file to publish, with the feed entry describing it.
#[derive(Debug, Clone)]
pub struct LocalAsset {
    pub entry: AssetEntry,
    pub path: PathBuf,
}

#[derive(Debug, Default)]
pub struct PublishReport {
    pub feed_key: String,
    pub uploaded: Vec<String>,
    pub skipped: Vec<String>,
    pub feed_entries: usize,
    pub pruned: Vec<String>,
    /// Pruned keys whose deletion failed. Pruning is best-effort.
    pub prune_failures: Vec<String>,
    /// Local assets not uploaded because retention would prune them right away.
    pub stale: Vec<String>,
}

pub struct ObjectRepository<F> {
    factory: F,
    cancel: CancellationToken,
}

impl<F: ClientFactory> ObjectRepository<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            cancel: CancellationToken::new(),
        }
    }

    /// Operations abort with [`RepositoryError::Cancelled`] once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn create_client(&self, options: &DownloadOptions<F::Connection>) -> RepoResult<F::Client> {
        self.factory.create_client(options)
    }

    /// Retry policy for one operation with these options.
    pub fn retry_executor(&self, options: &DownloadOptions<F::Connection>) -> RetryExecutor {
        options
            .retry_executor()
            .with_cancellation(self.cancel.clone())
    }

    /// Fetches the channel's feed. A missing or empty feed object is an empty feed.
    pub async fn get_releases(&self, options: &DownloadOptions<F::Connection>) -> RepoResult<ReleaseFeed> {
        let client = self.create_client(options)?;
        let retry = self.retry_executor(options);
        self.fetch_feed(&client, &retry, options).await
    }

    /// Newest full release strictly newer than `current_version`, if any.
    pub async fn check_for_updates(
        &self,
        options: &DownloadOptions<F::Connection>,
        current_version: &str,
    ) -> RepoResult<Option<AssetEntry>> {
        let feed = self.get_releases(options).await?;
        let update = feed.update_for(current_version).cloned();
        match &update {
            Some(entry) => info!(
                current = current_version,
                available = %entry.version,
                file = %entry.file_name,
                "Update available"
            ),
            None => info!(current = current_version, "No updates available"),
        }
        Ok(update)
    }

    /// Downloads one asset to `destination`.
    ///
    /// Each attempt writes into a temporary file next to the destination and
    /// only renames it into place after the transfer (and checksum, when the
    /// entry has one) succeeded. A failed attempt leaves nothing behind.
    pub async fn save_entry_to_file(
        &self,
        options: &DownloadOptions<F::Connection>,
        entry: &AssetEntry,
        destination: &Path,
    ) -> RepoResult<u64> {
        self.download_entry(options, entry, destination, None).await
    }

    /// [`save_entry_to_file`](Self::save_entry_to_file) that also reports
    /// progress as a percentage of `entry.size`.
    ///
    /// Reported values only ever increase, also across retried attempts.
    /// Without a known size there are no intermediate reports; 100 is
    /// reported once the file is in place.
    pub async fn save_entry_to_file_with_progress(
        &self,
        options: &DownloadOptions<F::Connection>,
        entry: &AssetEntry,
        destination: &Path,
        on_percent: impl Fn(u8) + Send + Sync + 'static,
    ) -> RepoResult<u64> {
        let on_percent: Arc<dyn Fn(u8) + Send + Sync> = Arc::new(on_percent);
        let highest = Arc::new(AtomicU8::new(0));
        let emit = {
            let on_percent = on_percent.clone();
            let highest = highest.clone();
            move |percent: u8| {
                if highest.fetch_max(percent, Ordering::SeqCst) < percent {
                    on_percent(percent);
                }
            }
        };

        let progress = entry.size.filter(|total| *total > 0).map(|total| {
            let emit = emit.clone();
            TransferProgress::new(move |bytes| emit(percent_of(bytes, total)))
        });
        let written = self.download_entry(options, entry, destination, progress).await?;
        emit(100);
        Ok(written)
    }

    async fn download_entry(
        &self,
        options: &DownloadOptions<F::Connection>,
        entry: &AssetEntry,
        destination: &Path,
        progress: Option<TransferProgress>,
    ) -> RepoResult<u64> {
        let client = self.create_client(options)?;
        let retry = self.retry_executor(options);
        let directory = match destination.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&directory)
            .await
            .map_err(|source| RepositoryError::Io {
                context: format!("creating {}", directory.display()),
                source,
            })?;

        let key = entry.file_name.as_str();
        let description = format!("Downloading {key}");
        let written = retry
            .retry_ret(&description, || {
                let client = &client;
                let directory = &directory;
                let progress = progress.clone();
                async move {
                    let partial = tempfile::Builder::new()
                        .prefix(".relsync-")
                        .suffix(".partial")
                        .tempfile_in(directory)?
                        .into_temp_path();
                    let written = client.download_file(key, &partial, progress).await?;
                    if let Some(expected) = entry.sha256.as_deref() {
                        let actual = file_sha256(&partial)?;
                        if !actual.eq_ignore_ascii_case(expected) {
                            return Err(BlobError::ChecksumMismatch {
                                key: key.to_string(),
                                expected: expected.to_string(),
                                actual,
                            });
                        }
                    }
                    partial.persist(destination).map_err(|e| e.error)?;
                    Ok(written)
                }
            })
            .await?;

        info!(
            file = key,
            destination = %destination.display(),
            bytes = written,
            "Downloaded asset"
        );
        Ok(written)
    }

    /// Uploads `local_file` under `key`, skipping the transfer when the remote
    /// object already has the same content.
    ///
    /// Without `overwrite_remote` a differing remote object is left alone (the
    /// call still succeeds) and new objects are created with an atomic
    /// create-if-absent condition; losing that race is a
    /// [`RepositoryError::Conflict`]. `no_cache` marks the object as not cacheable.
    pub async fn upload_object(
        &self,
        client: &F::Client,
        retry: &RetryExecutor,
        key: &str,
        local_file: &Path,
        overwrite_remote: bool,
        no_cache: bool,
    ) -> RepoResult<UploadOutcome> {
        let local_hash = hash_local(local_file)?;
        self.upload_hashed(client, retry, key, local_file, &local_hash, overwrite_remote, no_cache)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_hashed(
        &self,
        client: &F::Client,
        retry: &RetryExecutor,
        key: &str,
        local_file: &Path,
        local_hash: &str,
        overwrite_remote: bool,
        no_cache: bool,
    ) -> RepoResult<UploadOutcome> {
        let remote = tokio::select! {
            biased;
            _ = retry.cancellation().cancelled() => {
                return Err(RepositoryError::Cancelled {
                    description: format!("Uploading {key}"),
                });
            }
            remote = client.get_properties(key) => remote,
        };

        let mut overwrote = false;
        match remote {
            Ok(Some(properties)) => match properties.content_sha256 {
                Some(remote) if remote.eq_ignore_ascii_case(local_hash) => {
                    info!(key, "Object already exists with identical content, skipping upload");
                    return Ok(UploadOutcome::SkippedIdentical);
                }
                Some(remote) if !overwrite_remote => {
                    warn!(
                        key,
                        remote_sha256 = %remote,
                        local_sha256 = %local_hash,
                        "Remote object differs from local file; not overwriting"
                    );
                    return Ok(UploadOutcome::SkippedDiffers);
                }
                Some(remote) => {
                    warn!(
                        key,
                        remote_sha256 = %remote,
                        local_sha256 = %local_hash,
                        "Remote object differs from local file; overwriting"
                    );
                    overwrote = true;
                }
                None => debug!(key, "Remote object has no content hash"),
            },
            Ok(None) => debug!(key, "No remote object yet"),
            // Only dedup depends on the properties.
            Err(e) => debug!(key, error = %e, "Reading remote properties failed, uploading without dedup"),
        }

        let options = PutOptions {
            condition: if overwrite_remote {
                UploadCondition::Overwrite
            } else {
                UploadCondition::IfAbsent
            },
            cache_control: no_cache.then(|| NO_CACHE.to_string()),
            content_sha256: Some(local_hash.to_string()),
        };

        let description = format!("Uploading {key}");
        retry
            .retry(&description, || client.put_file(key, local_file, options.clone()))
            .await?;

        info!(key, condition = ?options.condition, no_cache, "Uploaded object");
        Ok(UploadOutcome::Uploaded { overwrote })
    }

    /// Deletes `key`. Deleting a missing object succeeds.
    pub async fn delete_object(&self, client: &F::Client, retry: &RetryExecutor, key: &str) -> RepoResult<()> {
        let description = format!("Deleting {key}");
        retry.retry(&description, || client.delete(key)).await?;
        info!(key, "Deleted object");
        Ok(())
    }

    /// Full publish cycle: assets, then feed, then best-effort pruning.
    ///
    /// Published entries carry the SHA-256 and size of the local file. An
    /// entry whose object was (re)written replaces the feed's entry of the same
    /// name; a remote object left alone because it differs keeps whatever the
    /// feed already says about it. With retention enabled, assets that would be
    /// pruned by this very publish are not uploaded and end up in
    /// [`PublishReport::stale`].
    pub async fn publish(
        &self,
        options: &UploadOptions<F::Connection>,
        assets: &[LocalAsset],
    ) -> RepoResult<PublishReport> {
        let download = &options.download;
        let feed_key = download.feed_key().map_err(|e| RepositoryError::Config(e.to_string()))?;
        let client = self.create_client(download)?;
        let retry = self.retry_executor(download);

        info!(
            channel = %download.channel,
            assets = assets.len(),
            overwrite = options.overwrite,
            keep_max_releases = options.keep_max_releases,
            "Publishing release"
        );

        let mut report = PublishReport {
            feed_key: feed_key.clone(),
            ..PublishReport::default()
        };

        let stale = if options.keep_max_releases > 0 {
            let current = self.fetch_feed(&client, &retry, download).await?;
            stale_assets(&current, assets, options.keep_max_releases)
        } else {
            HashSet::new()
        };

        let mut rewritten = Vec::new();
        let mut unchanged = Vec::new();
        let mut diverged = Vec::new();
        for asset in assets {
            let key = asset.entry.file_name.as_str();
            if stale.contains(key) {
                warn!(
                    key,
                    version = %asset.entry.version,
                    keep_max_releases = options.keep_max_releases,
                    "Asset is older than the retained releases, not uploading"
                );
                report.stale.push(key.to_string());
                continue;
            }

            let local_hash = hash_local(&asset.path)?;
            let size = tokio::fs::metadata(&asset.path)
                .await
                .map_err(|source| RepositoryError::Io {
                    context: format!("reading {}", asset.path.display()),
                    source,
                })?
                .len();
            let mut entry = asset.entry.clone();
            entry.sha256 = Some(local_hash.clone());
            entry.size = Some(size);

            let outcome = self
                .upload_hashed(&client, &retry, key, &asset.path, &local_hash, options.overwrite, false)
                .await
                .map_err(|e| {
                    error!(key, error = %e, "Asset upload failed, feed left unchanged");
                    e
                })?;
            match outcome {
                UploadOutcome::Uploaded { .. } => {
                    report.uploaded.push(key.to_string());
                    rewritten.push(entry);
                }
                UploadOutcome::SkippedIdentical => {
                    report.skipped.push(key.to_string());
                    unchanged.push(entry);
                }
                UploadOutcome::SkippedDiffers => {
                    report.skipped.push(key.to_string());
                    diverged.push(key.to_string());
                }
            }
        }

        let existing = self.fetch_feed(&client, &retry, download).await?;
        for key in &diverged {
            if existing.get(key).is_none() {
                warn!(key = %key, "Remote asset differs from the local file and is not in the feed; leaving it unlisted");
            }
        }
        // Rewritten objects replace their entries; the rest only fill gaps.
        let merged = existing.upsert(rewritten).merge(unchanged);
        let (feed, pruned) = merged.retain_latest(options.keep_max_releases);
        report.feed_entries = feed.len();

        let bytes = feed
            .to_bytes()
            .map_err(|e| RepositoryError::Config(format!("encoding feed: {e}")))?;
        let mut staged = tempfile::NamedTempFile::new().map_err(|source| RepositoryError::Io {
            context: "staging feed".to_string(),
            source,
        })?;
        staged
            .write_all(&bytes)
            .and_then(|_| staged.flush())
            .map_err(|source| RepositoryError::Io {
                context: "staging feed".to_string(),
                source,
            })?;
        self.upload_object(&client, &retry, &feed_key, staged.path(), true, true)
            .await?;
        info!(feed = %feed_key, entries = feed.len(), "Release feed updated");

        for entry in pruned {
            let key = entry.file_name;
            match self.delete_object(&client, &retry, &key).await {
                Ok(()) => report.pruned.push(key),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to prune old release asset");
                    report.prune_failures.push(key);
                }
            }
        }

        Ok(report)
    }

    async fn fetch_feed(
        &self,
        client: &F::Client,
        retry: &RetryExecutor,
        options: &DownloadOptions<F::Connection>,
    ) -> RepoResult<ReleaseFeed> {
        let key = options.feed_key().map_err(|e| RepositoryError::Config(e.to_string()))?;
        let description = format!("Fetching feed {key}");
        let bytes = retry
            .retry_ret(&description, || client.get_bytes(&key))
            .await?;

        match bytes {
            None => {
                info!(feed = %key, "No release feed yet, starting empty");
                Ok(ReleaseFeed::default())
            }
            Some(bytes) if bytes.is_empty() => {
                info!(feed = %key, "Release feed is empty");
                Ok(ReleaseFeed::default())
            }
            Some(bytes) => {
                let feed = ReleaseFeed::parse(&bytes).map_err(|source| {
                    error!(feed = %key, error = %source, "Release feed is malformed");
                    RepositoryError::Parse {
                        key: key.clone(),
                        source,
                    }
                })?;
                debug!(feed = %key, entries = feed.len(), "Fetched release feed");
                Ok(feed)
            }
        }
    }
}

fn hash_local(path: &Path) -> RepoResult<String> {
    file_sha256(path).map_err(|source| RepositoryError::Io {
        context: format!("hashing {}", path.display()),
        source,
    })
}

/// File names of `assets` that retention would drop from `current` once they
/// were added.
fn stale_assets(current: &ReleaseFeed, assets: &[LocalAsset], keep: usize) -> HashSet<String> {
    let candidate = current.upsert(assets.iter().map(|a| a.entry.clone()));
    let (_, pruned) = candidate.retain_latest(keep);
    let local: HashSet<&str> = assets.iter().map(|a| a.entry.file_name.as_str()).collect();
    pruned
        .into_iter()
        .map(|entry| entry.file_name)
        .filter(|name| local.contains(name.as_str()))
        .collect()
}

fn percent_of(bytes: u64, total: u64) -> u8 {
    (u128::from(bytes.min(total)) * 100 / u128::from(total)) as u8
}

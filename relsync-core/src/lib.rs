#![doc = "relsync-core: release feed synchronisation against arbitrary object stores."]

//! This crate contains the provider-agnostic logic of relsync: the release
//! feed model, the retrying object repository and the blob store contract,
//! plus two backends (local directory and HTTP). CLI concerns live in the
//! `relsync` crate.
//!
//! # Usage
//! Build an [`ObjectRepository`] from a [`ClientFactory`] (for example
//! [`backends::LocalFactory`] or [`backends::HttpFactory`]) and drive it with
//! [`DownloadOptions`] / [`UploadOptions`].

pub mod backends;
pub mod checksum;
pub mod config;
pub mod contract;
pub mod error;
pub mod feed;
pub mod repository;
pub mod retry;
pub mod version;

pub use config::{DownloadOptions, UploadOptions};
pub use contract::{BlobProperties, BlobStoreClient, PutOptions, TransferProgress, UploadCondition};
pub use error::{BlobError, RepositoryError};
pub use feed::{feed_key, AssetEntry, ReleaseFeed};
pub use repository::{ClientFactory, LocalAsset, ObjectRepository, PublishReport, UploadOutcome};
pub use retry::RetryExecutor;
pub use tokio_util::sync::CancellationToken;

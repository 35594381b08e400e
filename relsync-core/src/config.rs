//! Options for repository operations.
//!
//! [`DownloadOptions`] carries what every operation needs; [`UploadOptions`]
//! composes it with the publishing policy. `C` is the backend connection
//! (addressing and credentials), opaque to everything except the backend's
//! [`ClientFactory`](crate::repository::ClientFactory).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::feed::{feed_key, validate_channel, FeedError};
use crate::retry::{RetryExecutor, DEFAULT_ATTEMPTS};

pub const DEFAULT_TIMEOUT_MINUTES: u64 = 30;

fn default_timeout_minutes() -> u64 {
    DEFAULT_TIMEOUT_MINUTES
}

fn default_retries() -> u32 {
    DEFAULT_ATTEMPTS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadOptions<C> {
    /// Release channel. Empty selects the default channel.
    #[serde(default)]
    pub channel: String,
    /// Network timeout per attempt, in minutes.
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    /// Key prefix inside the container/bucket/directory.
    #[serde(default)]
    pub prefix: Option<String>,
    /// Total attempts per network operation.
    #[serde(default = "default_retries")]
    pub retries: u32,
    pub connection: C,
}

impl<C> DownloadOptions<C> {
    pub fn new(channel: impl Into<String>, connection: C) -> Self {
        Self {
            channel: channel.into(),
            timeout_minutes: DEFAULT_TIMEOUT_MINUTES,
            prefix: None,
            retries: DEFAULT_ATTEMPTS,
            connection,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes.max(1).saturating_mul(60))
    }

    pub fn feed_key(&self) -> Result<String, FeedError> {
        validate_channel(&self.channel)?;
        Ok(feed_key(&self.channel))
    }

    pub fn retry_executor(&self) -> RetryExecutor {
        RetryExecutor::new(self.retries).with_attempt_timeout(self.timeout())
    }

    pub fn trace_loaded(&self) {
        info!(
            channel = %self.channel,
            timeout_minutes = self.timeout_minutes,
            retries = self.retries,
            prefix = self.prefix.as_deref().unwrap_or(""),
            "Loaded repository options"
        );
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadOptions<C> {
    #[serde(flatten)]
    pub download: DownloadOptions<C>,
    /// Number of newest releases kept in the feed; older ones are pruned. 0 disables pruning.
    #[serde(default)]
    pub keep_max_releases: usize,
    /// Replace remote objects whose content differs from the local file.
    #[serde(default)]
    pub overwrite: bool,
}

impl<C> UploadOptions<C> {
    pub fn new(download: DownloadOptions<C>) -> Self {
        Self {
            download,
            keep_max_releases: 0,
            overwrite: false,
        }
    }

    pub fn trace_loaded(&self) {
        self.download.trace_loaded();
        debug!(
            keep_max_releases = self.keep_max_releases,
            overwrite = self.overwrite,
            "Loaded upload policy"
        );
    }
}

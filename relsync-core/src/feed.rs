//! Release feed: the per-channel index of published assets.
//!
//! The feed is a JSON document of the shape update clients consume:
//!
//! ```json
//! { "Assets": [ { "PackageId": "App", "Version": "1.0.0", "Type": "Full",
//!                 "FileName": "App-1.0.0-full.nupkg", "SHA256": "...", "Size": 1234 } ] }
//! ```
//!
//! Only `FileName` and `Version` carry meaning here. All other fields of an
//! entry are kept as-is so feeds written by newer tooling survive a
//! read-merge-write cycle untouched.

use std::collections::{BTreeSet, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::version::ReleaseVersion;

/// Feed object key of the default (unnamed) channel.
pub const DEFAULT_FEED_KEY: &str = "releases.json";

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("invalid feed JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("duplicate asset file name `{0}`")]
    DuplicateFileName(String),

    #[error("asset entry with empty file name")]
    EmptyFileName,

    #[error("invalid channel name `{0}`: use letters, digits, '.', '_' or '-'")]
    InvalidChannel(String),
}

/// One published asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetEntry {
    #[serde(rename = "PackageId", default, skip_serializing_if = "Option::is_none")]
    pub package_id: Option<String>,
    #[serde(rename = "Version")]
    pub version: String,
    /// `Full` or `Delta` for packages produced by the packaging step.
    #[serde(rename = "Type", default, skip_serializing_if = "Option::is_none")]
    pub asset_type: Option<String>,
    #[serde(rename = "FileName")]
    pub file_name: String,
    /// Reference checksum. The authoritative comparison at upload time is
    /// against the live object, not this value.
    #[serde(rename = "SHA256", default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(rename = "Size", default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl AssetEntry {
    pub fn new(file_name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            package_id: None,
            version: version.into(),
            asset_type: Some("Full".to_string()),
            file_name: file_name.into(),
            sha256: None,
            size: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.sha256 = Some(sha256.into());
        self
    }

    pub fn is_full(&self) -> bool {
        self.asset_type
            .as_deref()
            .map_or(true, |t| t.eq_ignore_ascii_case("full"))
    }

    pub fn release_version(&self) -> ReleaseVersion {
        ReleaseVersion::parse(&self.version)
    }
}

/// Ordered, file-name-unique list of assets for one channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReleaseFeed {
    #[serde(rename = "Assets", default)]
    assets: Vec<AssetEntry>,
}

impl ReleaseFeed {
    /// Builds a feed, rejecting duplicate or empty file names.
    pub fn from_assets(assets: Vec<AssetEntry>) -> Result<Self, FeedError> {
        let mut seen = HashSet::new();
        for asset in &assets {
            if asset.file_name.is_empty() {
                return Err(FeedError::EmptyFileName);
            }
            if !seen.insert(asset.file_name.as_str()) {
                return Err(FeedError::DuplicateFileName(asset.file_name.clone()));
            }
        }
        Ok(Self { assets })
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, FeedError> {
        let raw: ReleaseFeed = serde_json::from_slice(bytes)?;
        Self::from_assets(raw.assets)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, FeedError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn assets(&self) -> &[AssetEntry] {
        &self.assets
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn get(&self, file_name: &str) -> Option<&AssetEntry> {
        self.assets.iter().find(|a| a.file_name == file_name)
    }

    /// Returns a new feed with every entry of `new_entries` whose file name is
    /// not yet present appended in order. Existing entries are never replaced.
    pub fn merge<I>(&self, new_entries: I) -> ReleaseFeed
    where
        I: IntoIterator<Item = AssetEntry>,
    {
        let mut assets = self.assets.clone();
        let mut seen: HashSet<String> = assets.iter().map(|a| a.file_name.clone()).collect();
        for entry in new_entries {
            if !entry.file_name.is_empty() && seen.insert(entry.file_name.clone()) {
                assets.push(entry);
            }
        }
        ReleaseFeed { assets }
    }

    /// Returns a new feed where each of `entries` replaces the entry with the
    /// same file name in place, or is appended when there is none. Used when
    /// the object behind an entry was rewritten, so the old checksum and size
    /// no longer describe it.
    pub fn upsert<I>(&self, entries: I) -> ReleaseFeed
    where
        I: IntoIterator<Item = AssetEntry>,
    {
        let mut assets = self.assets.clone();
        for entry in entries {
            if entry.file_name.is_empty() {
                continue;
            }
            match assets.iter_mut().find(|a| a.file_name == entry.file_name) {
                Some(slot) => *slot = entry,
                None => assets.push(entry),
            }
        }
        ReleaseFeed { assets }
    }

    /// Splits the feed into the entries of the `keep` newest distinct versions
    /// and the rest. `keep == 0` keeps everything.
    pub fn retain_latest(&self, keep: usize) -> (ReleaseFeed, Vec<AssetEntry>) {
        if keep == 0 {
            return (self.clone(), Vec::new());
        }

        let mut versions: Vec<ReleaseVersion> = Vec::new();
        for asset in &self.assets {
            let version = asset.release_version();
            if !versions.contains(&version) {
                versions.push(version);
            }
        }
        versions.sort_by(|a, b| b.cmp(a));
        versions.truncate(keep);

        let (kept, pruned): (Vec<_>, Vec<_>) = self
            .assets
            .iter()
            .cloned()
            .partition(|a| versions.contains(&a.release_version()));
        (ReleaseFeed { assets: kept }, pruned)
    }

    /// Distinct versions present in the feed, oldest first.
    pub fn versions(&self) -> Vec<String> {
        let mut unique: Vec<ReleaseVersion> = Vec::new();
        for asset in &self.assets {
            let version = asset.release_version();
            if !unique.contains(&version) {
                unique.push(version);
            }
        }
        unique.sort();
        unique.into_iter().map(|v| v.as_str().to_string()).collect()
    }

    /// Newest full asset, optionally restricted to one version.
    pub fn latest_full(&self, version: Option<&str>) -> Option<&AssetEntry> {
        let wanted = version.map(ReleaseVersion::parse);
        self.assets
            .iter()
            .filter(|a| a.is_full())
            .filter(|a| wanted.as_ref().map_or(true, |w| a.release_version() == *w))
            .max_by(|a, b| a.release_version().cmp(&b.release_version()))
    }

    /// Newest full asset strictly newer than `current`.
    pub fn update_for(&self, current: &str) -> Option<&AssetEntry> {
        let current = ReleaseVersion::parse(current);
        self.latest_full(None)
            .filter(|candidate| candidate.release_version() > current)
    }

    /// File names in the feed, sorted. Handy for diagnostics and tests.
    pub fn file_names(&self) -> BTreeSet<&str> {
        self.assets.iter().map(|a| a.file_name.as_str()).collect()
    }
}

fn channel_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").expect("channel pattern is a valid regex")
    })
}

pub fn validate_channel(channel: &str) -> Result<(), FeedError> {
    if channel.is_empty() || channel_pattern().is_match(channel) {
        Ok(())
    } else {
        Err(FeedError::InvalidChannel(channel.to_string()))
    }
}

/// Object key of a channel's feed. The default channel is the empty string.
pub fn feed_key(channel: &str) -> String {
    if channel.is_empty() {
        DEFAULT_FEED_KEY.to_string()
    } else {
        format!("releases.{channel}.json")
    }
}

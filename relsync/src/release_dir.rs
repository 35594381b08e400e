//! Turns a packaging output directory into publishable assets.
//!
//! The packaging step leaves the channel's feed (`releases.<channel>.json`)
//! next to the packages it lists. Every listed file must exist in the
//! directory; entries missing a checksum or size get them filled in from the
//! local file so downloaders can verify what they fetch.

use anyhow::{bail, Context, Result};
use relsync_core::checksum::file_sha256;
use relsync_core::{feed_key, LocalAsset, ReleaseFeed};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

pub fn read_release_dir(dir: &Path, channel: &str) -> Result<Vec<LocalAsset>> {
    let feed_path = dir.join(feed_key(channel));
    info!(path = %feed_path.display(), "Reading local release feed");
    let bytes = fs::read(&feed_path)
        .with_context(|| format!("reading local release feed {}", feed_path.display()))?;
    let feed = ReleaseFeed::parse(&bytes)
        .with_context(|| format!("parsing local release feed {}", feed_path.display()))?;
    if feed.is_empty() {
        bail!("local release feed {} lists no assets", feed_path.display());
    }

    let mut assets = Vec::with_capacity(feed.len());
    for entry in feed.assets() {
        let path = dir.join(&entry.file_name);
        let metadata = fs::metadata(&path)
            .with_context(|| format!("asset {} listed in the feed is missing", path.display()))?;

        let mut entry = entry.clone();
        if entry.sha256.is_none() {
            entry.sha256 = Some(
                file_sha256(&path).with_context(|| format!("hashing {}", path.display()))?,
            );
        }
        entry.size.get_or_insert(metadata.len());
        debug!(file = %entry.file_name, version = %entry.version, "Staged asset");
        assets.push(LocalAsset { entry, path });
    }
    Ok(assets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fills_in_missing_checksums() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("app-1.0.nupkg"), b"hello world").unwrap();
        fs::write(
            dir.path().join("releases.beta.json"),
            br#"{"Assets":[{"Version":"1.0","Type":"Full","FileName":"app-1.0.nupkg"}]}"#,
        )
        .unwrap();

        let assets = read_release_dir(dir.path(), "beta").unwrap();
        assert_eq!(assets.len(), 1);
        assert_eq!(
            assets[0].entry.sha256.as_deref(),
            Some("b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9")
        );
        assert_eq!(assets[0].entry.size, Some(11));
        assert_eq!(assets[0].path, dir.path().join("app-1.0.nupkg"));
    }

    #[test]
    fn missing_package_is_an_error() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("releases.json"),
            br#"{"Assets":[{"Version":"1.0","FileName":"gone.nupkg"}]}"#,
        )
        .unwrap();

        let err = read_release_dir(dir.path(), "").unwrap_err();
        assert!(err.to_string().contains("gone.nupkg"));
    }
}

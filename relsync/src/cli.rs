//! Command line interface for relsync.
//!
//! Parsing and orchestration only: feed handling, retries and storage access
//! live in `relsync-core`. [`run`] is the entrypoint for both `main` and the
//! integration tests.

use crate::load_config::{load_config, BackendConfig, CliConfig};
use crate::release_dir::read_release_dir;
use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use relsync_core::backends::{AzureFactory, HttpFactory, LocalFactory};
use relsync_core::{CancellationToken, ClientFactory, ObjectRepository};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};

/// CLI for relsync: publish and fetch release feeds on object storage.
#[derive(Parser)]
#[clap(
    name = "relsync",
    version,
    about = "Publish application releases to object storage and fetch them back"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct Target {
    /// Path to the YAML config file
    #[clap(long)]
    pub config: PathBuf,
    /// Release channel; overrides the config file
    #[clap(long)]
    pub channel: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the entries of the channel's release feed
    List {
        #[clap(flatten)]
        target: Target,
    },
    /// Download the newest full release (or a specific version) into a directory
    Download {
        #[clap(flatten)]
        target: Target,
        #[clap(long)]
        dest: PathBuf,
        #[clap(long)]
        version: Option<String>,
    },
    /// Report whether a newer release than the given version is published
    Check {
        #[clap(flatten)]
        target: Target,
        #[clap(long)]
        current_version: String,
    },
    /// Upload the packages in a release directory and update the feed
    Publish {
        #[clap(flatten)]
        target: Target,
        /// Directory holding the packages and the local releases.<channel>.json
        #[clap(long)]
        release_dir: PathBuf,
        /// Keep only this many newest releases in the feed; 0 keeps all
        #[clap(long)]
        keep_max_releases: Option<usize>,
        /// Replace remote packages whose content differs
        #[clap(long)]
        overwrite: bool,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::List { .. } => "list",
            Commands::Download { .. } => "download",
            Commands::Check { .. } => "check",
            Commands::Publish { .. } => "publish",
        }
    }

    fn target(&self) -> &Target {
        match self {
            Commands::List { target }
            | Commands::Download { target, .. }
            | Commands::Check { target, .. }
            | Commands::Publish { target, .. } => target,
        }
    }
}

/// Async CLI entrypoint for `main()` and integration tests.
pub async fn run(cli: Cli) -> Result<()> {
    // Emit a top-level 'trace_initialised' event at the very start
    tracing::info!("trace_initialised");

    let command = cli.command;
    let config = load_config(&command.target().config)?;
    tracing::info!(command = command.name(), "Starting command");

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling in-flight operations");
            interrupt.cancel();
        }
    });

    let result = match config.backend.clone() {
        BackendConfig::Local(connection) => {
            let repo = ObjectRepository::new(LocalFactory).with_cancellation(cancel);
            execute(&repo, &config, connection, &command).await
        }
        BackendConfig::Azure(connection) => {
            let repo = ObjectRepository::new(AzureFactory).with_cancellation(cancel);
            execute(&repo, &config, connection, &command).await
        }
        BackendConfig::Http(connection) => {
            let repo = ObjectRepository::new(HttpFactory).with_cancellation(cancel);
            execute(&repo, &config, connection, &command).await
        }
    };

    match &result {
        Ok(()) => tracing::info!(command = command.name(), "Command complete"),
        Err(e) => tracing::error!(command = command.name(), error = %e, "Command failed"),
    }
    result
}

async fn execute<F: ClientFactory>(
    repo: &ObjectRepository<F>,
    config: &CliConfig,
    connection: F::Connection,
    command: &Commands,
) -> Result<()> {
    let channel = command.target().channel.as_deref();
    match command {
        Commands::List { .. } => {
            let options = config.download_options(channel, connection);
            options.trace_loaded();
            let feed = repo.get_releases(&options).await?;
            if feed.is_empty() {
                println!("No releases published on channel '{}'", options.channel);
            }
            for asset in feed.assets() {
                println!(
                    "{}\t{}\t{}",
                    asset.version,
                    asset.asset_type.as_deref().unwrap_or("Full"),
                    asset.file_name
                );
            }
        }
        Commands::Download { dest, version, .. } => {
            let options = config.download_options(channel, connection);
            options.trace_loaded();
            let feed = repo.get_releases(&options).await?;
            let entry = feed.latest_full(version.as_deref()).ok_or_else(|| match version {
                Some(v) => anyhow!("no full release {v} on channel '{}'", options.channel),
                None => anyhow!("no full release on channel '{}'", options.channel),
            })?;
            let destination = destination_for(dest, &entry.file_name)?;
            let file = entry.file_name.clone();
            let logged_decile = AtomicU8::new(0);
            let bytes = repo
                .save_entry_to_file_with_progress(&options, entry, &destination, move |percent| {
                    let decile = percent / 10;
                    if logged_decile.fetch_max(decile, Ordering::Relaxed) < decile {
                        tracing::info!(file = %file, percent, "Download progress");
                    }
                })
                .await?;
            println!("Downloaded {} ({bytes} bytes) to {}", entry.version, destination.display());
        }
        Commands::Check { current_version, .. } => {
            let options = config.download_options(channel, connection);
            options.trace_loaded();
            match repo.check_for_updates(&options, current_version).await? {
                Some(entry) => println!("Update available: {} ({})", entry.version, entry.file_name),
                None => println!("Up to date"),
            }
        }
        Commands::Publish {
            release_dir,
            keep_max_releases,
            overwrite,
            ..
        } => {
            let options = config.upload_options(channel, *keep_max_releases, *overwrite, connection);
            options.trace_loaded();
            let assets = read_release_dir(release_dir, &options.download.channel)?;
            let report = repo.publish(&options, &assets).await?;
            tracing::info!(?report, "Publish complete");
            println!(
                "Published {} asset(s), skipped {}, pruned {}; {} now lists {} entries",
                report.uploaded.len(),
                report.skipped.len(),
                report.pruned.len(),
                report.feed_key,
                report.feed_entries
            );
            if !report.stale.is_empty() {
                eprintln!(
                    "Warning: not uploaded, older than the retained releases: {}",
                    report.stale.join(", ")
                );
            }
            if !report.prune_failures.is_empty() {
                eprintln!(
                    "Warning: could not delete pruned assets: {}",
                    report.prune_failures.join(", ")
                );
            }
        }
    }
    Ok(())
}

/// Remote file names are only ever placed directly inside `dest`.
fn destination_for(dest: &Path, file_name: &str) -> Result<PathBuf> {
    match Path::new(file_name).file_name() {
        Some(name) if name == file_name => Ok(dest.join(name)),
        _ => Err(anyhow!("refusing to download asset with unsafe file name '{file_name}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_rejects_path_components() {
        let dest = Path::new("/tmp/out");
        assert_eq!(
            destination_for(dest, "app-1.0.nupkg").unwrap(),
            PathBuf::from("/tmp/out/app-1.0.nupkg")
        );
        assert!(destination_for(dest, "../evil.nupkg").is_err());
        assert!(destination_for(dest, "nested/app.nupkg").is_err());
    }

    #[test]
    fn publish_flags_parse() {
        let cli = Cli::try_parse_from([
            "relsync",
            "publish",
            "--config",
            "relsync.yaml",
            "--channel",
            "beta",
            "--release-dir",
            "out",
            "--keep-max-releases",
            "4",
            "--overwrite",
        ])
        .unwrap();
        match cli.command {
            Commands::Publish {
                target,
                keep_max_releases,
                overwrite,
                ..
            } => {
                assert_eq!(target.channel.as_deref(), Some("beta"));
                assert_eq!(keep_max_releases, Some(4));
                assert!(overwrite);
            }
            _ => panic!("expected publish"),
        }
    }
}

//! Loads the static YAML config and injects secrets from the environment.
//!
//! Secrets never need to live in the file: `RELSYNC_SAS_TOKEN` applies to the
//! `azure` and `http` backends, `RELSYNC_ACCESS_KEY` to `azure` and
//! `RELSYNC_API_KEY` to `http`. Environment values win over the file.
//!
//! ```yaml
//! backend:
//!   kind: azure
//!   account_name: myaccount
//!   container: releases
//! channel: stable
//! prefix: myapp
//! keep_max_releases: 5
//! ```
//!
//! An `http` backend takes `endpoint` and `container`. A `local` backend
//! takes `root`; relative roots resolve against the directory containing the
//! config file.

use anyhow::{Context, Result};
use relsync_core::backends::{AzureConnection, HttpConnection, LocalConnection};
use relsync_core::config::DEFAULT_TIMEOUT_MINUTES;
use relsync_core::retry::DEFAULT_ATTEMPTS;
use relsync_core::{DownloadOptions, UploadOptions};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use tracing::{error, info};

pub const SAS_TOKEN_ENV: &str = "RELSYNC_SAS_TOKEN";
pub const API_KEY_ENV: &str = "RELSYNC_API_KEY";
pub const ACCESS_KEY_ENV: &str = "RELSYNC_ACCESS_KEY";

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Local(LocalConnection),
    Azure(AzureConnection),
    Http(HttpConnection),
}

#[derive(Debug, Clone, Deserialize)]
pub struct CliConfig {
    pub backend: BackendConfig,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default)]
    pub keep_max_releases: usize,
    #[serde(default)]
    pub overwrite: bool,
}

fn default_timeout_minutes() -> u64 {
    DEFAULT_TIMEOUT_MINUTES
}

fn default_retries() -> u32 {
    DEFAULT_ATTEMPTS
}

impl CliConfig {
    /// Repository options for `connection`, with the channel optionally overridden.
    pub fn download_options<C>(&self, channel: Option<&str>, connection: C) -> DownloadOptions<C> {
        let mut options = DownloadOptions::new(channel.unwrap_or(&self.channel), connection);
        options.prefix = self.prefix.clone();
        options.timeout_minutes = self.timeout_minutes;
        options.retries = self.retries;
        options
    }

    /// Publishing options; CLI flags win over the file.
    pub fn upload_options<C>(
        &self,
        channel: Option<&str>,
        keep_max_releases: Option<usize>,
        overwrite: bool,
        connection: C,
    ) -> UploadOptions<C> {
        let mut options = UploadOptions::new(self.download_options(channel, connection));
        options.keep_max_releases = keep_max_releases.unwrap_or(self.keep_max_releases);
        options.overwrite = overwrite || self.overwrite;
        options
    }
}

/// Reads and parses the YAML config at `path`, then applies environment secrets.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CliConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = fs::read_to_string(path_ref).map_err(|e| {
        error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
        anyhow::anyhow!("Failed to read config file {:?}: {}", path_ref, e)
    })?;

    let mut config: CliConfig = serde_yaml::from_str(&config_content).map_err(|e| {
        error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
        anyhow::anyhow!("Failed to parse config YAML: {e}")
    })?;

    match &mut config.backend {
        BackendConfig::Local(connection) => {
            if connection.root.is_relative() {
                if let Some(base) = path_ref.parent() {
                    connection.root = base.join(&connection.root);
                }
            }
            info!(root = %connection.root.display(), "Using local directory backend");
        }
        BackendConfig::Azure(connection) => {
            if let Some(token) = secret_from_env(SAS_TOKEN_ENV)? {
                connection.sas_token = Some(token);
            }
            if let Some(key) = secret_from_env(ACCESS_KEY_ENV)? {
                connection.access_key = Some(key);
            }
            info!(
                account_name = %connection.account_name,
                container = %connection.container,
                endpoint = connection.endpoint.as_deref().unwrap_or("default"),
                sas_token_set = connection.sas_token.is_some(),
                access_key_set = connection.access_key.is_some(),
                "Using Azure blob backend"
            );
        }
        BackendConfig::Http(connection) => {
            if let Some(token) = secret_from_env(SAS_TOKEN_ENV)? {
                connection.sas_token = Some(token);
            }
            if let Some(key) = secret_from_env(API_KEY_ENV)? {
                connection.api_key = Some(key);
            }
            info!(
                endpoint = %connection.endpoint,
                container = %connection.container,
                sas_token_set = connection.sas_token.is_some(),
                api_key_set = connection.api_key.is_some(),
                "Using HTTP blob backend"
            );
        }
    }

    Ok(config)
}

fn secret_from_env(name: &str) -> Result<Option<String>> {
    match env::var(name) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading {name} from the environment")),
    }
}

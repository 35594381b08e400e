//! Azure Blob Storage backend on `object_store`.
//!
//! `object_store` signs requests with the account key (or uses a SAS token)
//! and maps create-if-absent onto Azure's `If-None-Match: *`. The content
//! SHA-256 is stored as blob metadata (`x-ms-meta-sha256`), the same name the
//! plain HTTP backend writes, so both backends dedup against each other.
//!
//! Uploads are single-shot: the file is read into memory and sent as one
//! block blob. `object_store`'s own retries are disabled; the repository's
//! [`RetryExecutor`](crate::retry::RetryExecutor) owns retry policy.

use std::borrow::Cow;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use object_store::azure::{AzureConfigKey, MicrosoftAzure, MicrosoftAzureBuilder};
use object_store::path::Path as ObjectPath;
use object_store::{
    Attribute, Attributes, ClientOptions, GetOptions, ObjectStore, PutMode, PutPayload,
    RetryConfig,
};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::DownloadOptions;
use crate::contract::{
    normalize_prefix, validate_key, BlobProperties, BlobStoreClient, PutOptions, TransferProgress,
    UploadCondition,
};
use crate::error::{BlobError, BlobResult, RepoResult, RepositoryError};
use crate::repository::ClientFactory;

const SHA256_METADATA: &str = "sha256";

/// Storage account addressing and credentials for [`AzureFactory`].
///
/// With neither `access_key` nor `sas_token` the client falls back to a
/// managed identity.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AzureConnection {
    pub account_name: String,
    pub container: String,
    /// Overrides `https://<account>.blob.core.windows.net`, e.g. for the emulator.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing)]
    pub access_key: Option<String>,
    /// Takes precedence over `access_key`.
    #[serde(default, skip_serializing)]
    pub sas_token: Option<String>,
}

impl fmt::Debug for AzureConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureConnection")
            .field("account_name", &self.account_name)
            .field("container", &self.container)
            .field("endpoint", &self.endpoint)
            .field("access_key", &self.access_key.as_ref().map(|_| "<redacted>"))
            .field("sas_token", &self.sas_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AzureFactory;

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl ClientFactory for AzureFactory {
    type Connection = AzureConnection;
    type Client = AzureBlobClient;

    fn create_client(&self, options: &DownloadOptions<AzureConnection>) -> RepoResult<AzureBlobClient> {
        let connection = &options.connection;
        let account = connection.account_name.trim();
        let container = connection.container.trim().trim_matches('/');
        if account.is_empty() || container.is_empty() {
            return Err(RepositoryError::Config(
                "azure backend needs an account name and a container".to_string(),
            ));
        }

        let mut builder = MicrosoftAzureBuilder::new()
            .with_account(account)
            .with_container_name(container)
            .with_client_options(ClientOptions::new().with_timeout(options.timeout()))
            .with_retry(RetryConfig {
                max_retries: 0,
                ..RetryConfig::default()
            });

        match non_blank(connection.endpoint.as_deref()) {
            Some(endpoint) => {
                builder = builder
                    .with_endpoint(endpoint.to_string())
                    .with_allow_http(endpoint.starts_with("http://"));
            }
            None => info!(
                endpoint = %format!("https://{account}.blob.core.windows.net"),
                "No endpoint configured, using the account's default"
            ),
        }

        let sas = non_blank(connection.sas_token.as_deref());
        let key = non_blank(connection.access_key.as_deref());
        builder = match (sas, key) {
            (Some(token), key) => {
                if key.is_some() {
                    warn!("Both a SAS token and an access key are configured; using the SAS token");
                }
                builder.with_config(AzureConfigKey::SasKey, token.trim_start_matches('?'))
            }
            (None, Some(key)) => builder.with_access_key(key),
            (None, None) => {
                debug!("No azure credentials configured, using managed identity");
                builder
            }
        };

        let store = builder
            .build()
            .map_err(|e| RepositoryError::Config(format!("building azure client: {e}")))?;
        debug!(account, container, "Created Azure blob client");
        Ok(AzureBlobClient {
            store: Arc::new(store),
            prefix: normalize_prefix(options.prefix.as_deref()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct AzureBlobClient {
    store: Arc<MicrosoftAzure>,
    prefix: String,
}

impl AzureBlobClient {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn path_for(&self, key: &str) -> BlobResult<ObjectPath> {
        validate_key(key)?;
        Ok(ObjectPath::from(format!("{}{}", self.prefix, key)))
    }
}

/// Maps `object_store` failures onto the contract's error kinds.
fn store_error(key: &str, err: object_store::Error) -> BlobError {
    match err {
        object_store::Error::NotFound { .. } => BlobError::NotFound {
            key: key.to_string(),
        },
        object_store::Error::AlreadyExists { .. } | object_store::Error::Precondition { .. } => {
            BlobError::Conflict {
                key: key.to_string(),
            }
        }
        source => BlobError::Store {
            key: key.to_string(),
            source,
        },
    }
}

#[async_trait]
impl BlobStoreClient for AzureBlobClient {
    async fn get_bytes(&self, key: &str) -> BlobResult<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        let result = match self.store.get(&path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(store_error(key, e)),
        };
        let bytes = result.bytes().await.map_err(|e| store_error(key, e))?;
        Ok(Some(bytes.to_vec()))
    }

    async fn put_file(&self, key: &str, local_path: &Path, options: PutOptions) -> BlobResult<()> {
        let path = self.path_for(key)?;
        let content = tokio::fs::read(local_path).await?;
        let length = content.len();

        let mut attributes = Attributes::new();
        if let Some(cache_control) = options.cache_control {
            attributes.insert(Attribute::CacheControl, cache_control.into());
        }
        if let Some(sha) = options.content_sha256 {
            attributes.insert(Attribute::Metadata(Cow::Borrowed(SHA256_METADATA)), sha.into());
        }
        let put = object_store::PutOptions {
            mode: match options.condition {
                UploadCondition::IfAbsent => PutMode::Create,
                UploadCondition::Overwrite => PutMode::Overwrite,
            },
            attributes,
            ..Default::default()
        };

        self.store
            .put_opts(&path, PutPayload::from(content), put)
            .await
            .map_err(|e| store_error(key, e))?;
        debug!(key, bytes = length, "Uploaded blob");
        Ok(())
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        let path = self.path_for(key)?;
        match self.store.delete(&path).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => {
                debug!(key, "Delete of missing blob");
                Ok(())
            }
            Err(e) => Err(store_error(key, e)),
        }
    }

    async fn get_properties(&self, key: &str) -> BlobResult<Option<BlobProperties>> {
        let path = self.path_for(key)?;
        let head = GetOptions {
            head: true,
            ..Default::default()
        };
        let result = match self.store.get_opts(&path, head).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(store_error(key, e)),
        };
        let content_sha256 = result
            .attributes
            .get(&Attribute::Metadata(Cow::Borrowed(SHA256_METADATA)))
            .map(|v| v.as_ref().trim().to_ascii_lowercase());
        Ok(Some(BlobProperties {
            content_sha256,
            size: Some(result.meta.size as u64),
        }))
    }

    async fn download_file(
        &self,
        key: &str,
        local_path: &Path,
        progress: Option<TransferProgress>,
    ) -> BlobResult<u64> {
        let path = self.path_for(key)?;
        let result = self.store.get(&path).await.map_err(|e| store_error(key, e))?;

        let mut file = tokio::fs::File::create(local_path).await?;
        let mut written = 0u64;
        let mut stream = result.into_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| store_error(key, e))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            if let Some(progress) = &progress {
                progress.report(written);
            }
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // base64 of "not-a-real-key"
    const ACCESS_KEY: &str = "bm90LWEtcmVhbC1rZXk=";

    fn options(connection: AzureConnection) -> DownloadOptions<AzureConnection> {
        let mut opts = DownloadOptions::new("stable", connection);
        opts.prefix = Some("apps/demo".to_string());
        opts
    }

    #[test]
    fn builds_with_access_key_and_prefixes_keys() {
        let client = AzureFactory
            .create_client(&options(AzureConnection {
                account_name: "myaccount".into(),
                container: "releases".into(),
                access_key: Some(ACCESS_KEY.into()),
                ..AzureConnection::default()
            }))
            .unwrap();
        assert_eq!(client.prefix(), "apps/demo/");
        assert_eq!(
            client.path_for("releases.stable.json").unwrap().to_string(),
            "apps/demo/releases.stable.json"
        );
        assert!(matches!(
            client.path_for("../x"),
            Err(BlobError::InvalidKey { .. })
        ));
    }

    #[test]
    fn builds_with_sas_token_against_custom_endpoint() {
        AzureFactory
            .create_client(&options(AzureConnection {
                account_name: "devstoreaccount1".into(),
                container: "releases".into(),
                endpoint: Some("http://127.0.0.1:10000/devstoreaccount1".into()),
                sas_token: Some("?sv=2021-08-06&ss=b&sig=abc".into()),
                access_key: Some(ACCESS_KEY.into()),
            }))
            .unwrap();
    }

    #[test]
    fn account_and_container_are_required() {
        let err = AzureFactory
            .create_client(&options(AzureConnection {
                container: "releases".into(),
                ..AzureConnection::default()
            }))
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Config(_)));
    }

    #[test]
    fn store_errors_map_onto_contract_kinds() {
        let not_found = object_store::Error::NotFound {
            path: "k".into(),
            source: "missing".into(),
        };
        assert!(matches!(store_error("k", not_found), BlobError::NotFound { .. }));

        let exists = object_store::Error::AlreadyExists {
            path: "k".into(),
            source: "exists".into(),
        };
        let err = store_error("k", exists);
        assert!(matches!(err, BlobError::Conflict { .. }));
        assert!(!err.is_retryable());

        let generic = object_store::Error::Generic {
            store: "MicrosoftAzure",
            source: "connection reset".into(),
        };
        assert!(store_error("k", generic).is_retryable());

        let denied = object_store::Error::PermissionDenied {
            path: "k".into(),
            source: "403".into(),
        };
        assert!(!store_error("k", denied).is_retryable());
    }

    #[test]
    fn secrets_are_redacted() {
        let connection = AzureConnection {
            account_name: "a".into(),
            container: "c".into(),
            access_key: Some("super-secret".into()),
            ..AzureConnection::default()
        };
        assert!(!format!("{connection:?}").contains("super-secret"));
    }
}

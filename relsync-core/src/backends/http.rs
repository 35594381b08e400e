//! Plain HTTP object target.
//!
//! Objects live at `<endpoint>/<container>/<prefix><key>`, with every key
//! segment percent-encoded. Any server that understands `GET`/`HEAD`/`PUT`/
//! `DELETE` plus `If-None-Match: *` works. Requests also carry the `x-ms-*`
//! headers Azure Blob Storage expects, so a container URL with a SAS token is
//! a valid target; signed account-key access goes through
//! [`super::azure`] instead.
//!
//! The content SHA-256 used for dedup is stored as `x-ms-meta-sha256` on
//! upload and read back from `HEAD`. Objects uploaded by other tools without
//! that header simply never dedup.
//!
//! [`HttpBlobClient`] wraps a `reqwest::Client` and is cheap to clone and
//! safe to share between tasks.

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_LENGTH, IF_NONE_MATCH};
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::config::DownloadOptions;
use crate::contract::{
    normalize_prefix, validate_key, BlobProperties, BlobStoreClient, PutOptions, TransferProgress,
    UploadCondition,
};
use crate::error::{BlobError, BlobResult, RepoResult, RepositoryError};
use crate::repository::ClientFactory;

pub const META_SHA256_HEADER: &str = "x-ms-meta-sha256";
const BLOB_CACHE_CONTROL_HEADER: &str = "x-ms-blob-cache-control";
const BLOB_TYPE_HEADER: &str = "x-ms-blob-type";
const VERSION_HEADER: &str = "x-ms-version";
const API_VERSION: &str = "2021-08-06";
pub const DEFAULT_API_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";

fn default_api_key_header() -> String {
    DEFAULT_API_KEY_HEADER.to_string()
}

/// Addressing and credentials for [`HttpFactory`].
///
/// Secrets are never serialized and are redacted from `Debug` output.
#[derive(Clone, Serialize, Deserialize)]
pub struct HttpConnection {
    /// Service endpoint, e.g. `https://cdn-origin.example.com`.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub container: String,
    /// Shared access signature query string. Takes precedence over `api_key`.
    #[serde(default, skip_serializing)]
    pub sas_token: Option<String>,
    /// Static API key sent in `api_key_header` on every request, for targets
    /// behind an API gateway.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
}

impl Default for HttpConnection {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            container: String::new(),
            sas_token: None,
            api_key: None,
            api_key_header: default_api_key_header(),
        }
    }
}

impl fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnection")
            .field("endpoint", &self.endpoint)
            .field("container", &self.container)
            .field("sas_token", &self.sas_token.as_ref().map(|_| "<redacted>"))
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_key_header", &self.api_key_header)
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum AuthMode {
    Anonymous,
    /// Query string appended to every object URL.
    SasToken(String),
    ApiKey { header: HeaderName, key: HeaderValue },
}

impl fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMode::Anonymous => f.write_str("Anonymous"),
            AuthMode::SasToken(_) => f.write_str("SasToken(<redacted>)"),
            AuthMode::ApiKey { header, .. } => write!(f, "ApiKey({header})"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpFactory;

impl HttpFactory {
    fn base_url(connection: &HttpConnection) -> RepoResult<Url> {
        let endpoint = connection.endpoint.trim().trim_end_matches('/');
        if endpoint.is_empty() {
            return Err(RepositoryError::Config(
                "http backend needs an endpoint".to_string(),
            ));
        }
        let mut url = Url::parse(endpoint)
            .map_err(|e| RepositoryError::Config(format!("invalid endpoint `{endpoint}`: {e}")))?;
        let container = connection.container.trim().trim_matches('/');
        if !container.is_empty() {
            url.path_segments_mut()
                .map_err(|_| {
                    RepositoryError::Config(format!("endpoint `{endpoint}` cannot carry a path"))
                })?
                .pop_if_empty()
                .extend(container.split('/'));
        }
        Ok(url)
    }

    fn auth_mode(connection: &HttpConnection) -> RepoResult<AuthMode> {
        let sas = connection.sas_token.as_deref().filter(|t| !t.trim().is_empty());
        let key = connection.api_key.as_deref().filter(|k| !k.trim().is_empty());
        match (sas, key) {
            (Some(token), key) => {
                if key.is_some() {
                    warn!("Both a SAS token and an API key are configured; using the SAS token");
                }
                Ok(AuthMode::SasToken(token.trim().trim_start_matches('?').to_string()))
            }
            (None, Some(key)) => {
                let header = HeaderName::from_bytes(connection.api_key_header.as_bytes())
                    .map_err(|e| RepositoryError::Config(format!("invalid api key header: {e}")))?;
                let mut key = HeaderValue::from_str(key.trim())
                    .map_err(|e| RepositoryError::Config(format!("invalid api key: {e}")))?;
                key.set_sensitive(true);
                Ok(AuthMode::ApiKey { header, key })
            }
            (None, None) => {
                debug!("No credentials configured, using anonymous access");
                Ok(AuthMode::Anonymous)
            }
        }
    }
}

impl ClientFactory for HttpFactory {
    type Connection = HttpConnection;
    type Client = HttpBlobClient;

    fn create_client(&self, options: &DownloadOptions<HttpConnection>) -> RepoResult<HttpBlobClient> {
        let base_url = Self::base_url(&options.connection)?;
        let auth = Self::auth_mode(&options.connection)?;
        let http = reqwest::Client::builder()
            .timeout(options.timeout())
            .build()
            .map_err(|e| RepositoryError::Config(format!("building HTTP client: {e}")))?;

        let client = HttpBlobClient {
            http,
            base_url,
            prefix: normalize_prefix(options.prefix.as_deref()),
            auth,
        };
        debug!(base_url = %client.base_url, prefix = %client.prefix, auth = ?client.auth, "Created HTTP blob client");
        Ok(client)
    }
}

#[derive(Debug, Clone)]
pub struct HttpBlobClient {
    http: reqwest::Client,
    base_url: Url,
    prefix: String,
    auth: AuthMode,
}

impl HttpBlobClient {
    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn auth_mode(&self) -> &AuthMode {
        &self.auth
    }

    pub fn url_for(&self, key: &str) -> BlobResult<Url> {
        validate_key(key)?;
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BlobError::InvalidKey {
                key: key.to_string(),
                reason: "endpoint cannot carry a path".to_string(),
            })?
            .pop_if_empty()
            .extend(self.prefix.split('/').filter(|s| !s.is_empty()))
            .extend(key.split('/'));
        if let AuthMode::SasToken(token) = &self.auth {
            url.set_query(Some(token.as_str()));
        }
        Ok(url)
    }

    fn request(&self, method: Method, key: &str) -> BlobResult<RequestBuilder> {
        let url = self.url_for(key)?;
        let mut builder = self
            .http
            .request(method, url)
            .header(VERSION_HEADER, API_VERSION);
        if let AuthMode::ApiKey { header, key } = &self.auth {
            builder = builder.header(header.clone(), key.clone());
        }
        Ok(builder)
    }
}

const MAX_ERROR_MESSAGE_CHARS: usize = 256;

async fn status_error(key: &str, response: Response) -> BlobError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    BlobError::Http {
        key: key.to_string(),
        status,
        message: truncate_chars(&body, MAX_ERROR_MESSAGE_CHARS),
    }
}

/// First `max` characters of `text`; never splits a UTF-8 sequence.
fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}

#[async_trait]
impl BlobStoreClient for HttpBlobClient {
    async fn get_bytes(&self, key: &str) -> BlobResult<Option<Vec<u8>>> {
        let response = self.request(Method::GET, key)?.send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.bytes().await?.to_vec())),
            _ => Err(status_error(key, response).await),
        }
    }

    async fn put_file(&self, key: &str, local_path: &Path, options: PutOptions) -> BlobResult<()> {
        let file = tokio::fs::File::open(local_path).await?;
        let length = file.metadata().await?.len();

        let mut request = self
            .request(Method::PUT, key)?
            .header(BLOB_TYPE_HEADER, "BlockBlob")
            .header(CONTENT_LENGTH, length);
        if options.condition == UploadCondition::IfAbsent {
            request = request.header(IF_NONE_MATCH, "*");
        }
        if let Some(cache_control) = options.cache_control.as_deref() {
            request = request
                .header(CACHE_CONTROL, cache_control)
                .header(BLOB_CACHE_CONTROL_HEADER, cache_control);
        }
        if let Some(sha) = options.content_sha256.as_deref() {
            request = request.header(META_SHA256_HEADER, sha);
        }

        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let response = request.body(body).send().await?;
        match response.status() {
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED
                if options.condition == UploadCondition::IfAbsent =>
            {
                Err(BlobError::Conflict {
                    key: key.to_string(),
                })
            }
            status if status.is_success() => {
                debug!(key, bytes = length, "Uploaded blob");
                Ok(())
            }
            _ => Err(status_error(key, response).await),
        }
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        let response = self.request(Method::DELETE, key)?.send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!(key, "Delete of missing blob");
                Ok(())
            }
            status if status.is_success() => Ok(()),
            _ => Err(status_error(key, response).await),
        }
    }

    async fn get_properties(&self, key: &str) -> BlobResult<Option<BlobProperties>> {
        let response = self.request(Method::HEAD, key)?.send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let headers = response.headers();
                let content_sha256 = headers
                    .get(META_SHA256_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.trim().to_ascii_lowercase());
                let size = headers
                    .get(CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok());
                Ok(Some(BlobProperties {
                    content_sha256,
                    size,
                }))
            }
            _ => Err(status_error(key, response).await),
        }
    }

    async fn download_file(
        &self,
        key: &str,
        local_path: &Path,
        progress: Option<TransferProgress>,
    ) -> BlobResult<u64> {
        let response = self.request(Method::GET, key)?.send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => {
                return Err(BlobError::NotFound {
                    key: key.to_string(),
                })
            }
            status if status.is_success() => {}
            _ => return Err(status_error(key, response).await),
        }

        let mut file = tokio::fs::File::create(local_path).await?;
        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
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

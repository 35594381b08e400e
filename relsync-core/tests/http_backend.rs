//! Exercises the HTTP backend against an in-process fake blob service.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use relsync_core::backends::{HttpConnection, HttpFactory};
use relsync_core::contract::{BlobStoreClient, PutOptions, UploadCondition, NO_CACHE};
use relsync_core::{AssetEntry, BlobError, DownloadOptions, LocalAsset, ObjectRepository, UploadOptions};
use tempfile::TempDir;

#[derive(Clone)]
struct StoredBlob {
    body: Bytes,
    sha256: Option<String>,
    cache_control: Option<String>,
}

#[derive(Default)]
struct FakeStore {
    blobs: HashMap<String, StoredBlob>,
    seen_api_keys: Vec<Option<String>>,
    seen_queries: Vec<Option<String>>,
    failures_left: u32,
    failure_body: Option<String>,
}

type Shared = Arc<Mutex<FakeStore>>;

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn handle(
    State(store): State<Shared>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let key = uri.path().to_string();
    let mut store = store.lock().unwrap();
    store
        .seen_api_keys
        .push(header(&headers, "ocp-apim-subscription-key"));
    store.seen_queries.push(uri.query().map(str::to_string));

    if store.failures_left > 0 {
        store.failures_left -= 1;
        let body = store
            .failure_body
            .clone()
            .unwrap_or_else(|| "server busy".to_string());
        return (StatusCode::SERVICE_UNAVAILABLE, body).into_response();
    }

    match method {
        Method::GET => match store.blobs.get(&key) {
            Some(blob) => blob.body.clone().into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
        Method::HEAD => match store.blobs.get(&key) {
            Some(blob) => {
                let mut response = StatusCode::OK.into_response();
                if let Some(sha) = &blob.sha256 {
                    response
                        .headers_mut()
                        .insert("x-ms-meta-sha256", sha.parse().unwrap());
                }
                response
            }
            None => StatusCode::NOT_FOUND.into_response(),
        },
        Method::PUT => {
            let create_only = header(&headers, "if-none-match").as_deref() == Some("*");
            if create_only && store.blobs.contains_key(&key) {
                return StatusCode::PRECONDITION_FAILED.into_response();
            }
            let blob = StoredBlob {
                body,
                sha256: header(&headers, "x-ms-meta-sha256"),
                cache_control: header(&headers, "x-ms-blob-cache-control"),
            };
            store.blobs.insert(key, blob);
            StatusCode::CREATED.into_response()
        }
        Method::DELETE => match store.blobs.remove(&key) {
            Some(_) => StatusCode::ACCEPTED.into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

async fn spawn_fake_store() -> (SocketAddr, Shared) {
    let store: Shared = Arc::default();
    let app = Router::new()
        .route("/*key", any(handle))
        .with_state(store.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, store)
}

fn connection(addr: SocketAddr) -> HttpConnection {
    HttpConnection {
        endpoint: format!("http://{addr}"),
        container: "releases".into(),
        ..HttpConnection::default()
    }
}

fn options(connection: HttpConnection) -> DownloadOptions<HttpConnection> {
    let mut options = DownloadOptions::new("stable", connection);
    options.prefix = Some("demo".into());
    options
}

fn write(dir: &Path, name: &str, content: &[u8]) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

#[tokio::test]
async fn client_maps_statuses_onto_the_contract() {
    let (addr, store) = spawn_fake_store().await;
    let client = ObjectRepository::new(HttpFactory)
        .create_client(&options(connection(addr)))
        .unwrap();
    let dir = TempDir::new().unwrap();
    let local = write(dir.path(), "a.bin", b"payload");

    assert_eq!(client.get_bytes("a.bin").await.unwrap(), None);
    assert_eq!(client.get_properties("a.bin").await.unwrap(), None);

    let mut put = PutOptions::new(UploadCondition::IfAbsent);
    put.content_sha256 = Some("abc123".into());
    client.put_file("a.bin", &local, put.clone()).await.unwrap();

    let err = client.put_file("a.bin", &local, put).await.unwrap_err();
    assert!(matches!(err, BlobError::Conflict { .. }));
    assert!(!err.is_retryable());

    assert_eq!(client.get_bytes("a.bin").await.unwrap(), Some(b"payload".to_vec()));
    let properties = client.get_properties("a.bin").await.unwrap().unwrap();
    assert_eq!(properties.content_sha256.as_deref(), Some("abc123"));

    let target = dir.path().join("copy.bin");
    assert_eq!(client.download_file("a.bin", &target, None).await.unwrap(), 7);
    assert_eq!(std::fs::read(&target).unwrap(), b"payload");

    client.delete("a.bin").await.unwrap();
    client.delete("a.bin").await.unwrap();
    let err = client
        .download_file("a.bin", &dir.path().join("gone.bin"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BlobError::NotFound { .. }));

    assert!(store.lock().unwrap().blobs.is_empty());
}

#[tokio::test]
async fn server_errors_are_retryable() {
    let (addr, store) = spawn_fake_store().await;
    store.lock().unwrap().failures_left = 1;
    let client = ObjectRepository::new(HttpFactory)
        .create_client(&options(connection(addr)))
        .unwrap();

    let err = client.get_bytes("feed.json").await.unwrap_err();
    match &err {
        BlobError::Http { status, message, .. } => {
            assert_eq!(*status, 503);
            assert!(message.contains("busy"));
        }
        other => panic!("expected http error, got {other:?}"),
    }
    assert!(err.is_retryable());
}

#[tokio::test]
async fn long_multibyte_error_bodies_are_shortened_safely() {
    let (addr, store) = spawn_fake_store().await;
    {
        let mut store = store.lock().unwrap();
        store.failures_left = 1;
        store.failure_body = Some(format!("{}é and then some more", "a".repeat(255)));
    }
    let client = ObjectRepository::new(HttpFactory)
        .create_client(&options(connection(addr)))
        .unwrap();

    let err = client.get_bytes("feed.json").await.unwrap_err();
    match &err {
        BlobError::Http { status, message, .. } => {
            assert_eq!(*status, 503);
            assert_eq!(message.chars().count(), 256);
            assert!(message.ends_with('é'));
        }
        other => panic!("expected http error, got {other:?}"),
    }
    assert!(err.is_retryable());
}

#[tokio::test]
async fn reserved_characters_in_keys_stay_inside_the_path() {
    let (addr, store) = spawn_fake_store().await;
    let client = ObjectRepository::new(HttpFactory)
        .create_client(&options(connection(addr)))
        .unwrap();
    let dir = TempDir::new().unwrap();
    let local = write(dir.path(), "odd.bin", b"odd");

    client
        .put_file("App#1?.nupkg", &local, PutOptions::new(UploadCondition::IfAbsent))
        .await
        .unwrap();
    assert_eq!(
        client.get_bytes("App#1?.nupkg").await.unwrap(),
        Some(b"odd".to_vec())
    );

    let store = store.lock().unwrap();
    assert!(store.blobs.contains_key("/releases/demo/App%231%3F.nupkg"));
    assert!(store.seen_queries.iter().all(Option::is_none));
}

#[tokio::test]
async fn publish_over_http_writes_assets_then_uncached_feed() {
    let (addr, store) = spawn_fake_store().await;
    let staging = TempDir::new().unwrap();
    let path = write(staging.path(), "app-1.0.nupkg", b"release");
    let asset = LocalAsset {
        entry: AssetEntry::new("app-1.0.nupkg", "1.0"),
        path,
    };

    let repo = ObjectRepository::new(HttpFactory);
    let upload = UploadOptions::new(options(connection(addr)));
    let report = repo.publish(&upload, &[asset]).await.unwrap();
    assert_eq!(report.uploaded, vec!["app-1.0.nupkg".to_string()]);

    {
        let store = store.lock().unwrap();
        let asset = &store.blobs["/releases/demo/app-1.0.nupkg"];
        assert_eq!(asset.body.as_ref(), b"release");
        assert!(asset.sha256.is_some());
        assert_eq!(asset.cache_control, None);

        let feed = &store.blobs["/releases/demo/releases.stable.json"];
        assert_eq!(feed.cache_control.as_deref(), Some(NO_CACHE));
    }

    let feed = repo.get_releases(&upload.download).await.unwrap();
    assert_eq!(feed.len(), 1);
    assert_eq!(feed.assets()[0].file_name, "app-1.0.nupkg");
}

#[tokio::test]
async fn transient_failure_during_download_is_retried() {
    let (addr, store) = spawn_fake_store().await;
    store.lock().unwrap().blobs.insert(
        "/releases/demo/app-1.0.nupkg".into(),
        StoredBlob {
            body: Bytes::from_static(b"release"),
            sha256: None,
            cache_control: None,
        },
    );
    store.lock().unwrap().failures_left = 1;

    let target = TempDir::new().unwrap();
    let destination = target.path().join("app-1.0.nupkg");
    let written = ObjectRepository::new(HttpFactory)
        .save_entry_to_file(
            &options(connection(addr)),
            &AssetEntry::new("app-1.0.nupkg", "1.0"),
            &destination,
        )
        .await
        .unwrap();

    assert_eq!(written, 7);
    assert_eq!(std::fs::read(destination).unwrap(), b"release");
}

#[tokio::test]
async fn credentials_are_sent_with_every_request() {
    let (addr, store) = spawn_fake_store().await;
    let repo = ObjectRepository::new(HttpFactory);

    let keyed = HttpConnection {
        api_key: Some("shared-secret".into()),
        ..connection(addr)
    };
    repo.get_releases(&options(keyed)).await.unwrap();

    let signed = HttpConnection {
        sas_token: Some("?sv=2021&sig=xyz".into()),
        ..connection(addr)
    };
    repo.get_releases(&options(signed)).await.unwrap();

    let store = store.lock().unwrap();
    assert_eq!(store.seen_api_keys[0].as_deref(), Some("shared-secret"));
    assert_eq!(store.seen_queries[0], None);
    assert_eq!(store.seen_api_keys[1], None);
    assert_eq!(store.seen_queries[1].as_deref(), Some("sv=2021&sig=xyz"));
}

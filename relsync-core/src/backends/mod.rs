//! Concrete [`BlobStoreClient`](crate::contract::BlobStoreClient) implementations.

pub mod azure;
pub mod http;
pub mod local;

pub use azure::{AzureBlobClient, AzureConnection, AzureFactory};
pub use http::{HttpBlobClient, HttpConnection, HttpFactory};
pub use local::{LocalConnection, LocalDirectoryClient, LocalFactory};

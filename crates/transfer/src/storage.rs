//! Object storage seams.
//!
//! The engine never talks to a storage SDK. A [`StorageStrategy`] hands out
//! presigned URLs per part and an [`ObjectTransport`] moves bytes against
//! them, so Azure Blob, S3-compatible stores and the in-process
//! [`MemoryStore`](crate::MemoryStore) all look the same.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use relaysync_protocol::TransferDescriptor;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

use crate::TransferError;

/// Boxed future returned by the object-safe traits of this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Time-limited URL authorizing one GET or PUT.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PresignedUrl(String);

impl PresignedUrl {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Presigned URLs embed credentials in the query string.
impl fmt::Debug for PresignedUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = self.0.split('?').next().unwrap_or_default();
        write!(f, "PresignedUrl({base})")
    }
}

/// Issues presigned URLs for the parts of a transfer.
pub trait StorageStrategy: Send + Sync {
    fn upload_url<'a>(
        &'a self,
        descriptor: &'a TransferDescriptor,
        part: u32,
    ) -> BoxFuture<'a, Result<PresignedUrl, TransferError>>;

    fn download_url<'a>(
        &'a self,
        descriptor: &'a TransferDescriptor,
        part: u32,
    ) -> BoxFuture<'a, Result<PresignedUrl, TransferError>>;

    fn delete_object<'a>(
        &'a self,
        descriptor: &'a TransferDescriptor,
        part: u32,
    ) -> BoxFuture<'a, Result<(), TransferError>>;

    fn object_size<'a>(
        &'a self,
        descriptor: &'a TransferDescriptor,
        part: u32,
    ) -> BoxFuture<'a, Result<u64, TransferError>>;
}

/// Outcome of a PUT the storage service answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageResponse {
    pub status: u16,
}

impl StorageResponse {
    pub fn ok() -> Self {
        Self { status: 200 }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Moves bytes against presigned URLs.
///
/// `put` resolves to `Ok` whenever the service answered, whatever the
/// status, so callers can feed the status to the controller. Connection
/// failures and timeouts resolve to `Err`.
pub trait ObjectTransport: Send + Sync {
    fn put<'a>(
        &'a self,
        url: &'a PresignedUrl,
        body: Vec<u8>,
    ) -> BoxFuture<'a, Result<StorageResponse, TransferError>>;

    /// Fetches an object; a non-success status is a `StorageRejected` error.
    fn get<'a>(&'a self, url: &'a PresignedUrl) -> BoxFuture<'a, Result<Vec<u8>, TransferError>>;
}

/// [`ObjectTransport`] over HTTP(S) with a per-request timeout.
#[derive(Clone)]
pub struct HttpObjectTransport {
    client: reqwest::Client,
}

impl HttpObjectTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Uses a preconfigured client (proxy, TLS roots, ...).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl ObjectTransport for HttpObjectTransport {
    fn put<'a>(
        &'a self,
        url: &'a PresignedUrl,
        body: Vec<u8>,
    ) -> BoxFuture<'a, Result<StorageResponse, TransferError>> {
        Box::pin(async move {
            let len = body.len();
            let response = self
                .client
                .put(url.as_str())
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(body)
                .send()
                .await?;
            let status = response.status().as_u16();
            debug!(?url, bytes = len, status, "object PUT");
            Ok(StorageResponse { status })
        })
    }

    fn get<'a>(&'a self, url: &'a PresignedUrl) -> BoxFuture<'a, Result<Vec<u8>, TransferError>> {
        Box::pin(async move {
            let response = self.client.get(url.as_str()).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(TransferError::StorageRejected {
                    status: status.as_u16(),
                });
            }
            let data = response.bytes().await?.to_vec();
            debug!(?url, bytes = data.len(), "object GET");
            Ok(data)
        })
    }
}

//! Remote assertion API of the relay server.

use std::time::Duration;

use relaysync_protocol::constants::routes;
use relaysync_protocol::{
    DownloadFinishedRequest, PartDownloadedRequest, PartUploadedRequest, TransferDescriptor,
    TransferErrorReport, UploadFinishedRequest,
};
use reqwest::Url;
use serde::Serialize;
use tracing::debug;

use crate::TransferError;
use crate::storage::BoxFuture;

/// Progress assertions sent to the relay so peers can follow a transfer.
///
/// A failed assertion aborts the transfer like a failed storage request.
pub trait RemoteAssertions: Send + Sync {
    fn part_uploaded<'a>(
        &'a self,
        descriptor: &'a TransferDescriptor,
        part: u32,
        size: u64,
    ) -> BoxFuture<'a, Result<(), TransferError>>;

    fn upload_finished<'a>(
        &'a self,
        descriptor: &'a TransferDescriptor,
        total_parts: u32,
        sent_length: u64,
    ) -> BoxFuture<'a, Result<(), TransferError>>;

    fn part_downloaded<'a>(
        &'a self,
        descriptor: &'a TransferDescriptor,
        part: u32,
    ) -> BoxFuture<'a, Result<(), TransferError>>;

    fn download_finished<'a>(
        &'a self,
        descriptor: &'a TransferDescriptor,
        total_parts: u32,
    ) -> BoxFuture<'a, Result<(), TransferError>>;

    /// Reports the error that aborted a transfer.
    fn report_error<'a>(
        &'a self,
        descriptor: &'a TransferDescriptor,
        category: &'a str,
        message: &'a str,
    ) -> BoxFuture<'a, Result<(), TransferError>>;
}

/// [`RemoteAssertions`] over the relay's JSON HTTP API.
#[derive(Clone)]
pub struct HttpAssertionClient {
    http: reqwest::Client,
    base: Url,
}

impl HttpAssertionClient {
    /// Creates a client for the API rooted at `base_url`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransferError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Self::with_client(http, base_url)
    }

    pub fn with_client(http: reqwest::Client, base_url: &str) -> Result<Self, TransferError> {
        // Url::join replaces the last segment unless the base ends with '/'.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base = Url::parse(&normalized)
            .map_err(|e| TransferError::Config(format!("invalid API base URL {base_url}: {e}")))?;
        Ok(Self { http, base })
    }

    async fn post<T: Serialize + Sync>(&self, route: String, body: &T) -> Result<(), TransferError> {
        let url = self
            .base
            .join(&route)
            .map_err(|e| TransferError::Config(format!("invalid route {route}: {e}")))?;
        let response = self.http.post(url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Assertion(format!(
                "{route} returned HTTP {}",
                status.as_u16()
            )));
        }
        debug!(%route, "assertion accepted");
        Ok(())
    }
}

impl RemoteAssertions for HttpAssertionClient {
    fn part_uploaded<'a>(
        &'a self,
        d: &'a TransferDescriptor,
        part: u32,
        size: u64,
    ) -> BoxFuture<'a, Result<(), TransferError>> {
        Box::pin(async move {
            let body = PartUploadedRequest {
                file_id: d.file_id.clone(),
                session_id: d.session_id.clone(),
                client_id: d.client_id.clone(),
                part_number: part,
                size,
            };
            self.post(routes::part_uploaded(&d.file_id), &body).await
        })
    }

    fn upload_finished<'a>(
        &'a self,
        d: &'a TransferDescriptor,
        total_parts: u32,
        sent_length: u64,
    ) -> BoxFuture<'a, Result<(), TransferError>> {
        Box::pin(async move {
            let body = UploadFinishedRequest {
                file_id: d.file_id.clone(),
                session_id: d.session_id.clone(),
                client_id: d.client_id.clone(),
                total_parts,
                sent_length,
                plain_length: d.plain_length,
            };
            self.post(routes::upload_finished(&d.file_id), &body).await
        })
    }

    fn part_downloaded<'a>(
        &'a self,
        d: &'a TransferDescriptor,
        part: u32,
    ) -> BoxFuture<'a, Result<(), TransferError>> {
        Box::pin(async move {
            let body = PartDownloadedRequest {
                file_id: d.file_id.clone(),
                client_id: d.client_id.clone(),
                part_number: part,
            };
            self.post(routes::part_downloaded(&d.file_id), &body).await
        })
    }

    fn download_finished<'a>(
        &'a self,
        d: &'a TransferDescriptor,
        total_parts: u32,
    ) -> BoxFuture<'a, Result<(), TransferError>> {
        Box::pin(async move {
            let body = DownloadFinishedRequest {
                file_id: d.file_id.clone(),
                client_id: d.client_id.clone(),
                total_parts,
            };
            self.post(routes::download_finished(&d.file_id), &body).await
        })
    }

    fn report_error<'a>(
        &'a self,
        d: &'a TransferDescriptor,
        category: &'a str,
        message: &'a str,
    ) -> BoxFuture<'a, Result<(), TransferError>> {
        Box::pin(async move {
            let body = TransferErrorReport {
                file_id: d.file_id.clone(),
                client_id: d.client_id.clone(),
                category: category.to_string(),
                message: message.to_string(),
            };
            self.post(routes::transfer_error(&d.file_id), &body).await
        })
    }
}

//! Encrypted chunked file transfer through a relay blob store.
//!
//! Files are cut into AES-GCM slices whose size and upload parallelism adapt
//! to observed network behavior, pushed to object storage through presigned
//! URLs, and merged back in strict part order on the receiving side. One
//! failing slice aborts the whole transfer through the shared
//! [`ErrorManager`].
//!
//! # Pipeline
//!
//! Upload: source file → [`SliceEncrypter`] → bounded hand-off queue →
//! worker pool sized by the [`AdaptiveTransferController`] → storage PUT →
//! part assertion.
//!
//! Download: part-ready notifications → [`DownloadPartsCoordinator`] →
//! storage GET (with prefetch) → [`SliceDecrypter`] → merged artifact →
//! per-destination finalization.

pub mod archive;
pub mod assertions;
pub mod cache;
pub mod config;
pub mod controller;
pub mod crypto;
pub mod delta;
pub mod deps;
pub mod download;
pub mod error_manager;
pub mod memory;
pub mod progress;
pub mod service;
pub mod storage;
pub mod upload;
mod validation;

#[cfg(test)]
mod test_support;

use std::path::PathBuf;

pub use archive::{ArchiveReader, build_archive};
pub use assertions::{HttpAssertionClient, RemoteAssertions};
pub use cache::TransferCache;
pub use config::{ControllerConfig, TransferConfig};
pub use controller::{AdaptiveTransferController, TransferOutcome};
pub use crypto::{KeySupplier, SessionKey, Slice, SliceDecrypter, SliceEncrypter, SliceRead};
pub use delta::{DeltaOp, DeltaPatch, apply_delta, compute_delta};
pub use deps::TransferDeps;
pub use download::{
    DestinationPlan, DownloadEngine, DownloadPartsCoordinator, DownloadReport, DownloadTarget,
    FailedDestination,
};
pub use error_manager::{ErrorManager, TransferState};
pub use memory::{AssertionRecord, MemoryStore};
pub use progress::{
    ProgressEvent, ProgressReporter, ProgressSnapshot, SpeedCalculator, TransferProgressState,
};
pub use service::{DownloadTask, TransferService, UploadTask};
pub use storage::{
    BoxFuture, HttpObjectTransport, ObjectTransport, PresignedUrl, StorageResponse,
    StorageStrategy,
};
pub use upload::{UploadEngine, UploadSummary};
pub use validation::validate_entry_name;

/// Errors produced by the transfer engine.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("storage rejected request with HTTP {status}")]
    StorageRejected { status: u16 },

    #[error("cryptographic failure on part {part}")]
    Crypto { part: u32 },

    #[error("part {got} is out of order (expected {expected})")]
    OutOfOrder { expected: u32, got: u32 },

    #[error("announced total of {announced} parts is below the {merged} already merged")]
    PartCount { announced: u32, merged: u32 },

    #[error("remote assertion failed: {0}")]
    Assertion(String),

    #[error("truncated transfer: {actual} of {expected} bytes")]
    Truncated { expected: u64, actual: u64 },

    #[error("invalid delta patch: {0}")]
    InvalidDelta(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("finalization failed for {} destination(s)", .failed.len())]
    Finalization {
        finalized: Vec<PathBuf>,
        failed: Vec<FailedDestination>,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("key unavailable: {0}")]
    Key(String),

    #[error("cancelled")]
    Cancelled,

    #[error("task join error: {0}")]
    Join(String),
}

impl From<reqwest::Error> for TransferError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if let Some(status) = e.status() {
            Self::StorageRejected {
                status: status.as_u16(),
            }
        } else {
            Self::Transport(e.to_string())
        }
    }
}

impl From<tokio::task::JoinError> for TransferError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Join(e.to_string())
    }
}

impl TransferError {
    /// Whether this failure signals network congestion (back off, shrink).
    pub fn is_congestion(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout => true,
            Self::StorageRejected { status } => is_congestion_status(*status),
            _ => false,
        }
    }

    /// Short category sent to the relay's error endpoint.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Transport(_) | Self::Timeout => "transport",
            Self::StorageRejected { .. } => "storage",
            Self::Crypto { .. } | Self::Key(_) => "crypto",
            Self::Io(_) | Self::Archive(_) | Self::InvalidPath(_) => "io",
            Self::Finalization { .. } => "finalization",
            Self::Assertion(_) => "assertion",
            Self::Cancelled => "cancelled",
            _ => "internal",
        }
    }
}

/// HTTP statuses the controller treats as congestion: 429 and every 5xx.
pub fn is_congestion_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

//! Wire types shared between relaysync clients and the relay API.
//!
//! The relay never sees plaintext: descriptors carry the per-transfer IV,
//! and the session key stays on the peers.

pub mod constants;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use constants::{IV_LEN, KEY_LEN};
pub use messages::{
    DownloadFinishedRequest, FileReadyNotification, PartDownloadedRequest, PartReadyNotification,
    PartUploadedRequest, SlotGrant, TransferErrorReport, UploadFinishedRequest,
};
pub use types::{TransferDescriptor, TransferIv, TransferKind};

/// Errors produced while decoding protocol values.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid IV length: expected {expected}, got {actual}")]
    InvalidIvLength { expected: usize, actual: usize },

    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

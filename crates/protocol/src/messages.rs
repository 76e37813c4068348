use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Assertion payloads (client -> relay API)
// ---------------------------------------------------------------------------

/// Reports that one part is stored remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartUploadedRequest {
    pub file_id: String,
    pub session_id: String,
    pub client_id: String,
    pub part_number: u32,
    /// Ciphertext size of the part in bytes.
    pub size: u64,
}

/// Reports that every part of an upload is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFinishedRequest {
    pub file_id: String,
    pub session_id: String,
    pub client_id: String,
    pub total_parts: u32,
    pub sent_length: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plain_length: Option<u64>,
}

/// Reports that one part has been merged by the receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartDownloadedRequest {
    pub file_id: String,
    pub client_id: String,
    pub part_number: u32,
}

/// Reports that every destination of a download has been finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadFinishedRequest {
    pub file_id: String,
    pub client_id: String,
    pub total_parts: u32,
}

/// Reports the error that aborted a transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferErrorReport {
    pub file_id: String,
    pub client_id: String,
    /// Short machine-readable category (`transport`, `crypto`, `io`, ...).
    pub category: String,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Push notifications (relay -> client)
// ---------------------------------------------------------------------------

/// A part of a remote file can now be fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartReadyNotification {
    pub file_id: String,
    pub part_number: u32,
}

/// The sender finished uploading; the total part count is final.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReadyNotification {
    pub file_id: String,
    pub total_parts: u32,
}

/// Upload slot quota granted by the relay for one transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotGrant {
    pub file_id: String,
    pub slots: usize,
}

/// AES-256 session key length in bytes.
pub const KEY_LEN: usize = 32;

/// Per-transfer IV length in bytes (96-bit GCM nonce base).
pub const IV_LEN: usize = 12;

/// Length of the authentication tag appended to every encrypted slice.
pub const TAG_LEN: usize = 16;

/// First part number of every transfer. Part numbers are 1-based.
pub const FIRST_PART: u32 = 1;

/// Relay API routes, relative to the API base URL.
pub mod routes {
    /// `POST` once a part is stored remotely.
    pub fn part_uploaded(file_id: &str) -> String {
        format!("transfers/{file_id}/parts")
    }

    /// `POST` once every part of an upload is stored.
    pub fn upload_finished(file_id: &str) -> String {
        format!("transfers/{file_id}/upload-finished")
    }

    /// `POST` once a part has been merged locally.
    pub fn part_downloaded(file_id: &str) -> String {
        format!("transfers/{file_id}/parts-downloaded")
    }

    /// `POST` once every destination of a download is finalized.
    pub fn download_finished(file_id: &str) -> String {
        format!("transfers/{file_id}/download-finished")
    }

    /// `POST` with the error that aborted a transfer.
    pub fn transfer_error(file_id: &str) -> String {
        format!("transfers/{file_id}/error")
    }
}

use std::fmt;

use base64::{Engine, engine::general_purpose::STANDARD};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ProtocolError;
use crate::constants::IV_LEN;

/// How the plaintext stream of a transfer is interpreted by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    /// Plaintext is the destination file itself.
    FullCopy,
    /// Plaintext is a patch applied against the receiver's existing file.
    DeltaPatch,
    /// Plaintext is a zip archive multiplexing several logical files.
    Archive,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FullCopy => "full_copy",
            Self::DeltaPatch => "delta_patch",
            Self::Archive => "archive",
        };
        f.write_str(s)
    }
}

/// Per-transfer initialization vector.
///
/// Serialized as base64 in JSON.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferIv([u8; IV_LEN]);

impl TransferIv {
    /// Generates a fresh random IV.
    pub fn random() -> Self {
        let mut bytes = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; IV_LEN]) -> Self {
        Self(bytes)
    }

    /// Builds an IV from a slice, rejecting wrong lengths.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let arr: [u8; IV_LEN] = bytes.try_into().map_err(|_| ProtocolError::InvalidIvLength {
            expected: IV_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; IV_LEN] {
        &self.0
    }
}

impl fmt::Debug for TransferIv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransferIv({})", STANDARD.encode(self.0))
    }
}

impl Serialize for TransferIv {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(self.0).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TransferIv {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = STANDARD.decode(&s).map_err(serde::de::Error::custom)?;
        Self::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Logical identity and crypto parameters of one file transfer.
///
/// The IV is fixed for the lifetime of a descriptor. A failed transfer is
/// restarted with a brand-new descriptor (and therefore a new IV).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferDescriptor {
    pub file_id: String,
    pub session_id: String,
    pub client_id: String,
    pub kind: TransferKind,
    pub iv: TransferIv,
    /// Ciphertext bytes actually sent (upload side, filled once finished).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_length: Option<u64>,
    /// Plaintext length of the source, when the sender announced it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plain_length: Option<u64>,
}

impl TransferDescriptor {
    /// Creates a descriptor with a freshly generated IV.
    pub fn new(
        file_id: impl Into<String>,
        session_id: impl Into<String>,
        client_id: impl Into<String>,
        kind: TransferKind,
    ) -> Self {
        Self {
            file_id: file_id.into(),
            session_id: session_id.into(),
            client_id: client_id.into(),
            kind,
            iv: TransferIv::random(),
            sent_length: None,
            plain_length: None,
        }
    }

    /// Returns a copy with a new IV, for restarting a failed transfer.
    pub fn restarted(&self) -> Self {
        Self {
            iv: TransferIv::random(),
            sent_length: None,
            ..self.clone()
        }
    }
}

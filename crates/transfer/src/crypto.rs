//! Chained AES-256-GCM slice codec.
//!
//! Every slice is sealed with its own nonce (the transfer IV with the part
//! number folded into the last four bytes) and authenticated together with
//! the previous slice's tag. A slice therefore only opens after its
//! predecessor has been opened, which forces strictly sequential decryption
//! and detects dropped, duplicated or reordered parts.

use std::fmt;
use std::io::{ErrorKind, Read};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use relaysync_protocol::constants::{FIRST_PART, TAG_LEN};
use relaysync_protocol::{IV_LEN, KEY_LEN, TransferIv};

use crate::TransferError;

/// Session-wide AES-256 key negotiated out of band.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, TransferError> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            TransferError::Key(format!("expected {KEY_LEN} key bytes, got {}", bytes.len()))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    fn cipher(&self) -> Result<Aes256Gcm, TransferError> {
        Aes256Gcm::new_from_slice(&self.0).map_err(|e| TransferError::Key(e.to_string()))
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

/// Source of the session key. Implemented by the trust layer.
pub trait KeySupplier: Send + Sync {
    fn aes_encryption_key(&self) -> Result<SessionKey, TransferError>;
}

impl KeySupplier for SessionKey {
    fn aes_encryption_key(&self) -> Result<SessionKey, TransferError> {
        Ok(self.clone())
    }
}

/// One encrypted fragment of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slice {
    /// 1-based, dense, strictly increasing per descriptor.
    pub part_number: u32,
    /// Ciphertext followed by the 16-byte tag.
    pub data: Vec<u8>,
    pub plain_len: usize,
}

impl Slice {
    pub fn cipher_len(&self) -> usize {
        self.data.len()
    }
}

/// Result of pulling from a [`SliceEncrypter`].
#[derive(Debug, PartialEq, Eq)]
pub enum SliceRead {
    Slice(Slice),
    EndOfStream,
}

/// Nonce and AAD derivation shared by both directions.
struct Chain {
    cipher: Aes256Gcm,
    iv: [u8; IV_LEN],
    prev_tag: [u8; TAG_LEN],
    next_part: u32,
}

impl Chain {
    fn new(key: &SessionKey, iv: &TransferIv) -> Result<Self, TransferError> {
        Ok(Self {
            cipher: key.cipher()?,
            iv: *iv.as_bytes(),
            prev_tag: [0u8; TAG_LEN],
            next_part: FIRST_PART,
        })
    }

    fn nonce(&self, part: u32) -> [u8; IV_LEN] {
        let mut nonce = self.iv;
        for (b, p) in nonce[IV_LEN - 4..].iter_mut().zip(part.to_be_bytes()) {
            *b ^= p;
        }
        nonce
    }

    fn aad(&self, part: u32) -> [u8; 4 + TAG_LEN] {
        let mut aad = [0u8; 4 + TAG_LEN];
        aad[..4].copy_from_slice(&part.to_be_bytes());
        aad[4..].copy_from_slice(&self.prev_tag);
        aad
    }

    /// Advances past `part`, whose sealed form ends with `sealed_tail`.
    fn advance(&mut self, sealed: &[u8]) {
        self.prev_tag.copy_from_slice(&sealed[sealed.len() - TAG_LEN..]);
        self.next_part += 1;
    }
}

/// Encrypt-on-read producer over a plaintext source.
pub struct SliceEncrypter<R> {
    source: R,
    chain: Chain,
    finished: bool,
}

impl<R: Read> SliceEncrypter<R> {
    pub fn new(source: R, key: &SessionKey, iv: &TransferIv) -> Result<Self, TransferError> {
        Ok(Self {
            source,
            chain: Chain::new(key, iv)?,
            finished: false,
        })
    }

    /// Reads up to `chunk_size` plaintext bytes and seals them.
    ///
    /// An empty source yields exactly one empty slice before end of stream.
    pub fn next_slice(&mut self, chunk_size: usize) -> Result<SliceRead, TransferError> {
        if self.finished {
            return Ok(SliceRead::EndOfStream);
        }

        let chunk_size = chunk_size.max(1);
        let mut plain = vec![0u8; chunk_size];
        let n = read_full(&mut self.source, &mut plain)?;
        plain.truncate(n);

        let first = self.chain.next_part == FIRST_PART;
        if n == 0 && !first {
            self.finished = true;
            return Ok(SliceRead::EndOfStream);
        }
        if n < chunk_size {
            self.finished = true;
        }

        let part = self.chain.next_part;
        let nonce = self.chain.nonce(part);
        let aad = self.chain.aad(part);
        let data = self
            .chain
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &plain,
                    aad: &aad,
                },
            )
            .map_err(|_| TransferError::Crypto { part })?;
        self.chain.advance(&data);

        Ok(SliceRead::Slice(Slice {
            part_number: part,
            data,
            plain_len: n,
        }))
    }

    /// Number of slices produced so far.
    pub fn parts_emitted(&self) -> u32 {
        self.chain.next_part - FIRST_PART
    }
}

/// Strictly sequential decoder of sealed slices.
pub struct SliceDecrypter {
    chain: Chain,
}

impl SliceDecrypter {
    pub fn new(key: &SessionKey, iv: &TransferIv) -> Result<Self, TransferError> {
        Ok(Self {
            chain: Chain::new(key, iv)?,
        })
    }

    /// Part number the next call to [`decrypt`](Self::decrypt) must carry.
    pub fn expected_part(&self) -> u32 {
        self.chain.next_part
    }

    pub fn decrypt(&mut self, part: u32, sealed: &[u8]) -> Result<Vec<u8>, TransferError> {
        if part != self.chain.next_part {
            return Err(TransferError::OutOfOrder {
                expected: self.chain.next_part,
                got: part,
            });
        }
        if sealed.len() < TAG_LEN {
            return Err(TransferError::Crypto { part });
        }

        let nonce = self.chain.nonce(part);
        let aad = self.chain.aad(part);
        let plain = self
            .chain
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload { msg: sealed, aad: &aad },
            )
            .map_err(|_| TransferError::Crypto { part })?;
        self.chain.advance(sealed);
        Ok(plain)
    }
}

/// Fills `buf` unless the source hits EOF first; returns bytes read.
fn read_full<R: Read>(source: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

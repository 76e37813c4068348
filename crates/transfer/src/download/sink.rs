use std::fs::File;
use std::io::{self, Cursor, Read, Seek};
use std::path::Path;

use tempfile::TempPath;
use tokio::io::AsyncWriteExt;

use crate::TransferError;

/// Destination of decrypted plaintext while parts are merged.
pub enum MergeSink {
    /// Appends to a temp file that is removed unless finalized.
    File {
        file: tokio::fs::File,
        path: TempPath,
        written: u64,
    },
    /// Keeps the plaintext in memory (delta patches).
    Buffer(Vec<u8>),
}

impl MergeSink {
    pub fn temp_file(dir: &Path) -> Result<Self, TransferError> {
        std::fs::create_dir_all(dir)?;
        let named = tempfile::Builder::new()
            .prefix(".relaysync-")
            .suffix(".part")
            .tempfile_in(dir)?;
        let (file, path) = named.into_parts();
        Ok(Self::File {
            file: tokio::fs::File::from_std(file),
            path,
            written: 0,
        })
    }

    pub fn buffer() -> Self {
        Self::Buffer(Vec::new())
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<(), TransferError> {
        match self {
            Self::File { file, written, .. } => {
                file.write_all(data).await?;
                *written += data.len() as u64;
            }
            Self::Buffer(buf) => buf.extend_from_slice(data),
        }
        Ok(())
    }

    pub fn len(&self) -> u64 {
        match self {
            Self::File { written, .. } => *written,
            Self::Buffer(buf) => buf.len() as u64,
        }
    }

    pub async fn finish(self) -> Result<MergedArtifact, TransferError> {
        match self {
            Self::File {
                mut file,
                path,
                written,
            } => {
                file.flush().await?;
                file.sync_all().await?;
                drop(file);
                Ok(MergedArtifact::File { path, len: written })
            }
            Self::Buffer(buf) => Ok(MergedArtifact::Buffer(buf)),
        }
    }
}

/// Fully merged plaintext awaiting finalization.
///
/// A file artifact is deleted when dropped, so a failed or partial
/// finalization never leaves it behind.
pub enum MergedArtifact {
    File { path: TempPath, len: u64 },
    Buffer(Vec<u8>),
}

/// Read + Seek view over either artifact kind.
pub trait ArtifactRead: Read + Seek {}
impl<T: Read + Seek> ArtifactRead for T {}

impl MergedArtifact {
    pub fn len(&self) -> u64 {
        match self {
            Self::File { len, .. } => *len,
            Self::Buffer(buf) => buf.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn open(&self) -> io::Result<Box<dyn ArtifactRead + '_>> {
        match self {
            Self::File { path, .. } => Ok(Box::new(File::open(path)?)),
            Self::Buffer(buf) => Ok(Box::new(Cursor::new(buf.as_slice()))),
        }
    }

    pub fn read_all(&self) -> io::Result<Vec<u8>> {
        match self {
            Self::File { path, .. } => std::fs::read(path),
            Self::Buffer(buf) => Ok(buf.clone()),
        }
    }
}

//! Zip containers multiplexing several logical files into one transfer.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::TransferError;
use crate::validation::validate_entry_name;

/// Writes `entries` (logical name → source file) as a deflated zip to
/// `output` and returns the archive size.
pub fn build_archive(
    entries: &BTreeMap<String, PathBuf>,
    output: &Path,
) -> Result<u64, TransferError> {
    let file = File::create(output)?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (name, source) in entries {
        validate_entry_name(name)?;
        zip.start_file(name.as_str(), options)?;
        let mut src = File::open(source)?;
        io::copy(&mut src, &mut zip)?;
    }

    let file = zip.finish()?;
    Ok(file.metadata()?.len())
}

/// Read side of an archive transfer.
pub struct ArchiveReader<R> {
    inner: ZipArchive<R>,
}

impl<R: Read + Seek> ArchiveReader<R> {
    pub fn new(reader: R) -> Result<Self, TransferError> {
        Ok(Self {
            inner: ZipArchive::new(reader)?,
        })
    }

    /// Names of the file entries, skipping directories.
    pub fn entry_names(&self) -> Vec<String> {
        self.inner
            .file_names()
            .filter(|name| !name.ends_with('/'))
            .map(str::to_string)
            .collect()
    }

    /// Streams entry `name` into `out`. Returns the bytes written.
    pub fn extract_to<W: Write>(&mut self, name: &str, out: &mut W) -> Result<u64, TransferError> {
        validate_entry_name(name)?;
        let mut entry = self.inner.by_name(name)?;
        Ok(io::copy(&mut entry, out)?)
    }
}

//! Turning a merged artifact into durable destination files.
//!
//! Every destination is installed through a temp file in its own directory
//! and an atomic rename, so a destination either holds the complete new
//! content or is left untouched. Destinations are independent: one failing
//! does not roll back the others.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::TransferError;
use crate::archive::ArchiveReader;
use crate::delta::DeltaPatch;
use crate::download::sink::MergedArtifact;
use crate::download::target::DestinationPlan;

/// A destination that could not be finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedDestination {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Default)]
pub(crate) struct FinalizeReport {
    pub finalized: Vec<PathBuf>,
    pub failed: Vec<FailedDestination>,
}

impl FinalizeReport {
    fn record(&mut self, path: &Path, result: Result<(), TransferError>) {
        match result {
            Ok(()) => {
                debug!(path = %path.display(), "destination finalized");
                self.finalized.push(path.to_path_buf());
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "destination finalization failed");
                self.failed.push(FailedDestination {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                });
            }
        }
    }

    fn fail_all<'a>(&mut self, paths: impl IntoIterator<Item = &'a PathBuf>, reason: &str) {
        for path in paths {
            self.failed.push(FailedDestination {
                path: path.clone(),
                reason: reason.to_string(),
            });
        }
    }
}

/// Finalizes every destination of `plan`. Blocking.
pub(crate) fn finalize(artifact: &MergedArtifact, plan: &DestinationPlan) -> FinalizeReport {
    let mut report = FinalizeReport::default();
    match plan {
        DestinationPlan::Copy(paths) => {
            let expected = artifact.len();
            for dest in paths {
                let result = artifact
                    .open()
                    .map_err(TransferError::from)
                    .and_then(|mut src| {
                        install(dest, |out| {
                            let actual = io::copy(&mut src, out)?;
                            if actual != expected {
                                return Err(TransferError::Truncated { expected, actual });
                            }
                            Ok(actual)
                        })
                    });
                report.record(dest, result);
            }
        }
        DestinationPlan::Delta(paths) => {
            let patch = artifact
                .read_all()
                .map_err(TransferError::from)
                .and_then(|bytes| DeltaPatch::parse(&bytes));
            match patch {
                Ok(patch) => {
                    for dest in paths {
                        let result = fs::read(dest)
                            .map_err(TransferError::from)
                            .and_then(|baseline| patch.apply(&baseline))
                            .and_then(|output| {
                                install(dest, |out| {
                                    out.write_all(&output)?;
                                    Ok(output.len() as u64)
                                })
                            });
                        report.record(dest, result);
                    }
                }
                Err(e) => report.fail_all(paths, &e.to_string()),
            }
        }
        DestinationPlan::Archive(entries) => {
            let reader = artifact
                .open()
                .map_err(TransferError::from)
                .and_then(ArchiveReader::new);
            match reader {
                Ok(mut reader) => {
                    for (name, dests) in entries {
                        for dest in dests {
                            let result = install(dest, |out| reader.extract_to(name, out));
                            report.record(dest, result);
                        }
                    }
                }
                Err(e) => report.fail_all(entries.values().flatten(), &e.to_string()),
            }
        }
    }
    report
}

/// Writes a destination atomically: temp file next to it, fsync, rename.
///
/// The temp file is removed if any step fails.
fn install<F>(dest: &Path, write: F) -> Result<(), TransferError>
where
    F: FnOnce(&mut NamedTempFile) -> Result<u64, TransferError>,
{
    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".relaysync-")
        .suffix(".tmp")
        .tempfile_in(parent)?;
    let bytes = write(&mut tmp)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| TransferError::Io(e.error))?;
    debug!(path = %dest.display(), bytes, "installed");
    Ok(())
}

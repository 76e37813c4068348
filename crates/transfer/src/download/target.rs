use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use relaysync_protocol::{TransferDescriptor, TransferKind};

use crate::TransferError;
use crate::validation::validate_entry_name;

/// Where the plaintext of a download ends up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationPlan {
    /// Plaintext is written verbatim to every path.
    Copy(Vec<PathBuf>),
    /// Plaintext is a patch applied against each path's current content.
    Delta(Vec<PathBuf>),
    /// Plaintext is a zip; each entry name maps to its destination paths.
    Archive(BTreeMap<String, Vec<PathBuf>>),
}

/// One remote file mapped to its local destinations.
#[derive(Debug, Clone)]
pub struct DownloadTarget {
    descriptor: TransferDescriptor,
    plan: DestinationPlan,
}

impl DownloadTarget {
    /// Validates that `plan` fits the descriptor's transfer kind.
    pub fn new(descriptor: TransferDescriptor, plan: DestinationPlan) -> Result<Self, TransferError> {
        let fits = match (&descriptor.kind, &plan) {
            (TransferKind::FullCopy, DestinationPlan::Copy(paths))
            | (TransferKind::DeltaPatch, DestinationPlan::Delta(paths)) => !paths.is_empty(),
            (TransferKind::Archive, DestinationPlan::Archive(entries)) => {
                for name in entries.keys() {
                    validate_entry_name(name)?;
                }
                !entries.is_empty() && entries.values().all(|paths| !paths.is_empty())
            }
            _ => false,
        };
        if !fits {
            return Err(TransferError::Config(format!(
                "destination plan does not fit {} transfer {}",
                descriptor.kind, descriptor.file_id
            )));
        }
        Ok(Self { descriptor, plan })
    }

    pub fn descriptor(&self) -> &TransferDescriptor {
        &self.descriptor
    }

    pub fn plan(&self) -> &DestinationPlan {
        &self.plan
    }

    /// Every final destination path.
    pub fn destinations(&self) -> Vec<&Path> {
        match &self.plan {
            DestinationPlan::Copy(paths) | DestinationPlan::Delta(paths) => {
                paths.iter().map(PathBuf::as_path).collect()
            }
            DestinationPlan::Archive(entries) => entries
                .values()
                .flatten()
                .map(PathBuf::as_path)
                .collect(),
        }
    }
}

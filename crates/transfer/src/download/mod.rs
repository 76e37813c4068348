//! Download pipeline: one remote file to one or more local destinations.
//!
//! Part-ready notifications feed the [`DownloadPartsCoordinator`]; the
//! [`FileMerger`] fetches, decrypts and appends parts in order; once the
//! total is known and every part is merged, each destination is finalized.

pub mod finalize;
pub mod merger;
pub mod parts;
pub mod sink;
pub mod target;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use relaysync_protocol::TransferKind;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::TransferError;
use crate::config::TransferConfig;
use crate::crypto::SliceDecrypter;
use crate::deps::TransferDeps;
use crate::error_manager::ErrorManager;
use crate::progress::{ProgressEvent, ProgressReporter, ProgressSnapshot, TransferProgressState};

pub use finalize::FailedDestination;
pub use merger::FileMerger;
pub use parts::DownloadPartsCoordinator;
pub use sink::{MergeSink, MergedArtifact};
pub use target::{DestinationPlan, DownloadTarget};

/// Result of a fully finalized download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub total_parts: u32,
    /// Plaintext bytes merged.
    pub bytes_merged: u64,
    pub finalized: Vec<PathBuf>,
}

/// Downloads one remote file. Runs at most once.
pub struct DownloadEngine {
    target: DownloadTarget,
    deps: TransferDeps,
    config: TransferConfig,
    errors: Arc<ErrorManager>,
    parts: Arc<DownloadPartsCoordinator>,
    progress: Arc<TransferProgressState>,
    reporter: Arc<ProgressReporter>,
    started: AtomicBool,
}

impl DownloadEngine {
    pub fn new(target: DownloadTarget, deps: TransferDeps, config: TransferConfig) -> Self {
        let errors = Arc::new(ErrorManager::new(target.descriptor().file_id.clone()));
        let parts = Arc::new(DownloadPartsCoordinator::new(Arc::clone(&errors)));
        Self::with_shared(target, deps, config, errors, parts, Arc::new(ProgressReporter::new()))
    }

    /// Builds an engine around state that already received notifications.
    pub fn with_shared(
        target: DownloadTarget,
        deps: TransferDeps,
        config: TransferConfig,
        errors: Arc<ErrorManager>,
        parts: Arc<DownloadPartsCoordinator>,
        reporter: Arc<ProgressReporter>,
    ) -> Self {
        Self {
            target,
            deps,
            config,
            errors,
            parts,
            progress: Arc::new(TransferProgressState::new()),
            reporter,
            started: AtomicBool::new(false),
        }
    }

    pub fn target(&self) -> &DownloadTarget {
        &self.target
    }

    pub fn parts(&self) -> &Arc<DownloadPartsCoordinator> {
        &self.parts
    }

    pub fn errors(&self) -> &Arc<ErrorManager> {
        &self.errors
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressEvent> {
        self.reporter.subscribe()
    }

    /// Push notification: `part` can be fetched.
    pub fn on_part_ready(&self, part: u32) -> bool {
        self.parts.add_available_part(part)
    }

    /// Push notification: the sender finished with `total_parts` parts.
    pub fn on_file_ready_to_finalize(&self, total_parts: u32) -> bool {
        self.parts.set_total_parts_known(total_parts)
    }

    pub fn cancel(&self) {
        self.errors.cancel();
    }

    /// Merges every part and finalizes every destination.
    ///
    /// The "download finished" assertion is only sent once every
    /// destination is finalized. If some destinations fail, the error is
    /// [`TransferError::Finalization`] listing both groups.
    pub async fn run(&self) -> Result<DownloadReport, TransferError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransferError::Config(format!(
                "download of {} already started",
                self.target.descriptor().file_id
            )));
        }
        let file_id = &self.target.descriptor().file_id;
        info!(%file_id, kind = %self.target.descriptor().kind, "download started");

        match self.execute().await {
            Ok(report) => {
                self.errors.complete();
                info!(
                    %file_id,
                    parts = report.total_parts,
                    bytes = report.bytes_merged,
                    destinations = report.finalized.len(),
                    "download finished"
                );
                Ok(report)
            }
            Err(e) => {
                self.errors.set_error(e);
                let err = self.errors.take_error().unwrap_or(TransferError::Cancelled);
                self.reporter
                    .report_error(self.progress.snapshot().bytes_acknowledged);
                if let Err(e) = self
                    .deps
                    .assertions
                    .report_error(self.target.descriptor(), err.category(), &err.to_string())
                    .await
                {
                    warn!(%file_id, error = %e, "failed to report download error");
                }
                Err(err)
            }
        }
    }

    async fn execute(&self) -> Result<DownloadReport, TransferError> {
        self.config.validate()?;
        let descriptor = self.target.descriptor();
        let key = self.deps.keys.aes_encryption_key()?;
        let decrypter = SliceDecrypter::new(&key, &descriptor.iv)?;

        let sink = match descriptor.kind {
            TransferKind::DeltaPatch => MergeSink::buffer(),
            TransferKind::FullCopy | TransferKind::Archive => {
                MergeSink::temp_file(&self.config.temp_dir())?
            }
        };
        let merger = FileMerger::new(
            descriptor.clone(),
            self.deps.clone(),
            Arc::clone(&self.parts),
            Arc::clone(&self.errors),
            decrypter,
            Arc::clone(&self.progress),
            Arc::clone(&self.reporter),
            self.config.prefetch_depth,
        );
        let Some(artifact) = merger.run(sink).await else {
            return Err(TransferError::Cancelled);
        };

        if let Some(expected) = descriptor.plain_length {
            if artifact.len() != expected {
                return Err(TransferError::Truncated {
                    expected,
                    actual: artifact.len(),
                });
            }
        }

        let total_parts = self.parts.total_parts().unwrap_or_default();
        let bytes_merged = artifact.len();
        let plan = self.target.plan().clone();
        let report = tokio::task::spawn_blocking(move || finalize::finalize(&artifact, &plan)).await?;

        if !report.failed.is_empty() {
            return Err(TransferError::Finalization {
                finalized: report.finalized,
                failed: report.failed,
            });
        }

        self.deps
            .assertions
            .download_finished(descriptor, total_parts)
            .await?;

        Ok(DownloadReport {
            total_parts,
            bytes_merged,
            finalized: report.finalized,
        })
    }
}

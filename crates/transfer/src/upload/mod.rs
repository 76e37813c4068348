//! Upload pipeline: one local file to remote storage.
//!
//! ```text
//! UploadSlicingManager ──► UploadCoordinator (bounded) ──► UploadWorker × N
//!                                                           ▲
//!                                     ParallelismManager ───┘
//! UploadProgressMonitor ◄── finished / error
//! ```

pub mod coordinator;
pub mod monitor;
pub mod parallelism;
pub mod slicer;
pub mod worker;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use relaysync_protocol::TransferDescriptor;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::TransferError;
use crate::config::TransferConfig;
use crate::controller::AdaptiveTransferController;
use crate::crypto::SliceEncrypter;
use crate::deps::TransferDeps;
use crate::error_manager::ErrorManager;
use crate::progress::{ProgressEvent, ProgressReporter, ProgressSnapshot, TransferProgressState};

pub use coordinator::{SlicePublisher, UploadCoordinator};
pub use monitor::UploadProgressMonitor;
pub use parallelism::{ParallelismManager, WorkerSlots};
pub use slicer::UploadSlicingManager;
pub use worker::{UploadWorker, WorkerContext};

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadSummary {
    pub total_parts: u32,
    /// Plaintext bytes acknowledged by storage; equals the source length.
    pub bytes_acknowledged: u64,
    /// Ciphertext bytes stored remotely.
    pub sent_length: u64,
    /// The descriptor with `sent_length` and `plain_length` filled in.
    pub descriptor: TransferDescriptor,
}

/// Uploads one file. Runs at most once.
pub struct UploadEngine {
    source: PathBuf,
    descriptor: TransferDescriptor,
    deps: TransferDeps,
    config: TransferConfig,
    controller: Arc<AdaptiveTransferController>,
    errors: Arc<ErrorManager>,
    progress: Arc<TransferProgressState>,
    reporter: Arc<ProgressReporter>,
    uploaded: Arc<Mutex<Vec<u32>>>,
    started: AtomicBool,
}

impl UploadEngine {
    pub fn new(
        source: impl Into<PathBuf>,
        descriptor: TransferDescriptor,
        deps: TransferDeps,
        config: TransferConfig,
    ) -> Self {
        let controller = Arc::new(AdaptiveTransferController::new(config.controller.clone()));
        let errors = Arc::new(ErrorManager::new(descriptor.file_id.clone()));
        Self {
            source: source.into(),
            descriptor,
            deps,
            config,
            controller,
            errors,
            progress: Arc::new(TransferProgressState::new()),
            reporter: Arc::new(ProgressReporter::new()),
            uploaded: Arc::new(Mutex::new(Vec::new())),
            started: AtomicBool::new(false),
        }
    }

    pub fn descriptor(&self) -> &TransferDescriptor {
        &self.descriptor
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn controller(&self) -> &Arc<AdaptiveTransferController> {
        &self.controller
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

    /// Requests cooperative cancellation.
    pub fn cancel(&self) {
        self.errors.cancel();
    }

    /// Uploads the source file.
    ///
    /// On failure the first error is returned, reported to the relay, and
    /// the parts already stored are deleted on a best-effort basis.
    pub async fn run(&self) -> Result<UploadSummary, TransferError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransferError::Config(format!(
                "upload of {} already started",
                self.descriptor.file_id
            )));
        }
        info!(
            file_id = %self.descriptor.file_id,
            path = %self.source.display(),
            "upload started"
        );

        match self.execute().await {
            Ok(summary) => {
                self.errors.complete();
                self.reporter.report(summary.bytes_acknowledged);
                info!(
                    file_id = %self.descriptor.file_id,
                    parts = summary.total_parts,
                    bytes = summary.bytes_acknowledged,
                    sent_length = summary.sent_length,
                    "upload finished"
                );
                Ok(summary)
            }
            Err(e) => {
                // No-op if a pipeline stage already recorded the first error.
                self.errors.set_error(e);
                let err = self.errors.take_error().unwrap_or(TransferError::Cancelled);
                self.abort(&err).await;
                Err(err)
            }
        }
    }

    async fn execute(&self) -> Result<UploadSummary, TransferError> {
        self.config.validate()?;
        let key = self.deps.keys.aes_encryption_key()?;

        let path = self.source.clone();
        let (file, source_len) = tokio::task::spawn_blocking(move || {
            let file = File::open(&path)?;
            let len = file.metadata()?.len();
            Ok::<_, std::io::Error>((file, len))
        })
        .await??;

        let encrypter = SliceEncrypter::new(file, &key, &self.descriptor.iv)?;
        let (coordinator, publisher) =
            UploadCoordinator::new(self.config.queue_capacity, Arc::clone(&self.errors));
        let coordinator = Arc::new(coordinator);

        let slicer = UploadSlicingManager::new(
            encrypter,
            Arc::clone(&self.controller),
            Arc::clone(&self.progress),
            publisher,
            Arc::clone(&self.errors),
        );
        let ctx = Arc::new(WorkerContext {
            descriptor: self.descriptor.clone(),
            deps: self.deps.clone(),
            controller: Arc::clone(&self.controller),
            coordinator: Arc::clone(&coordinator),
            progress: Arc::clone(&self.progress),
            errors: Arc::clone(&self.errors),
            slots: Arc::new(WorkerSlots::default()),
            uploaded: Arc::clone(&self.uploaded),
        });
        let manager = ParallelismManager::new(ctx, self.config.supervisor_tick());
        let monitor = UploadProgressMonitor::new(
            coordinator,
            Arc::clone(&self.progress),
            Arc::clone(&self.reporter),
            Arc::clone(&self.errors),
            self.config.progress_interval(),
        );

        let slicer_task = tokio::spawn(slicer.run());
        let manager_task = tokio::spawn(manager.run());
        let acknowledged = monitor.run().await;
        let total_parts = slicer_task.await?;
        manager_task.await?;

        if self.errors.is_error() {
            // Stand-in; the recorded first error is what the caller sees.
            return Err(TransferError::Cancelled);
        }

        let snapshot = self.progress.snapshot();
        if acknowledged != source_len || snapshot.slices_completed != total_parts {
            return Err(TransferError::Truncated {
                expected: source_len,
                actual: acknowledged,
            });
        }

        let mut descriptor = self.descriptor.clone();
        descriptor.sent_length = Some(snapshot.cipher_bytes_acknowledged);
        descriptor.plain_length = Some(source_len);
        self.deps
            .assertions
            .upload_finished(&descriptor, total_parts, snapshot.cipher_bytes_acknowledged)
            .await?;

        Ok(UploadSummary {
            total_parts,
            bytes_acknowledged: acknowledged,
            sent_length: snapshot.cipher_bytes_acknowledged,
            descriptor,
        })
    }

    /// Failure epilogue. Every step is best effort.
    async fn abort(&self, err: &TransferError) {
        let snapshot = self.progress.snapshot();
        self.reporter.report_error(snapshot.bytes_acknowledged);

        let file_id = &self.descriptor.file_id;
        if let Err(e) = self
            .deps
            .assertions
            .report_error(&self.descriptor, err.category(), &err.to_string())
            .await
        {
            warn!(%file_id, error = %e, "failed to report upload error");
        }

        let parts = std::mem::take(&mut *self.uploaded.lock().unwrap_or_else(PoisonError::into_inner));
        for part in parts {
            if let Err(e) = self.deps.storage.delete_object(&self.descriptor, part).await {
                warn!(%file_id, part, error = %e, "failed to delete uploaded part");
            }
        }
    }
}

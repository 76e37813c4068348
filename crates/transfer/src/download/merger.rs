use std::collections::HashMap;
use std::sync::Arc;

use relaysync_protocol::TransferDescriptor;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::TransferError;
use crate::crypto::SliceDecrypter;
use crate::deps::TransferDeps;
use crate::download::parts::DownloadPartsCoordinator;
use crate::download::sink::{MergeSink, MergedArtifact};
use crate::error_manager::ErrorManager;
use crate::progress::{ProgressReporter, TransferProgressState};

type Fetch = JoinHandle<Result<Vec<u8>, TransferError>>;

/// Single-threaded merge stage of one download.
///
/// Fetches may run ahead of the merge cursor (up to `prefetch_depth`
/// parts), but decryption and writes happen strictly in part order.
pub struct FileMerger {
    descriptor: TransferDescriptor,
    deps: TransferDeps,
    parts: Arc<DownloadPartsCoordinator>,
    errors: Arc<ErrorManager>,
    decrypter: SliceDecrypter,
    progress: Arc<TransferProgressState>,
    reporter: Arc<ProgressReporter>,
    prefetch_depth: usize,
    fetches: HashMap<u32, Fetch>,
}

impl FileMerger {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        descriptor: TransferDescriptor,
        deps: TransferDeps,
        parts: Arc<DownloadPartsCoordinator>,
        errors: Arc<ErrorManager>,
        decrypter: SliceDecrypter,
        progress: Arc<TransferProgressState>,
        reporter: Arc<ProgressReporter>,
        prefetch_depth: usize,
    ) -> Self {
        Self {
            descriptor,
            deps,
            parts,
            errors,
            decrypter,
            progress,
            reporter,
            prefetch_depth,
            fetches: HashMap::new(),
        }
    }

    /// Merges every part into `sink`.
    ///
    /// Returns `None` if the transfer failed; the cause is recorded in the
    /// [`ErrorManager`].
    pub async fn run(mut self, mut sink: MergeSink) -> Option<MergedArtifact> {
        match self.merge_all(&mut sink).await {
            Ok(()) if self.parts.all_parts_merged() => match sink.finish().await {
                Ok(artifact) => Some(artifact),
                Err(e) => {
                    self.errors.set_error(e);
                    None
                }
            },
            Ok(()) => None,
            Err(e) => {
                self.errors.set_error(e);
                None
            }
        }
    }

    async fn merge_all(&mut self, sink: &mut MergeSink) -> Result<(), TransferError> {
        while let Some(part) = self.parts.next_ready().await {
            self.schedule_prefetch();
            let sealed = self.fetch(part).await?;
            let plain = self.decrypter.decrypt(part, &sealed)?;
            sink.write(&plain).await?;

            self.parts.mark_merged(part);
            self.progress
                .slice_completed(plain.len() as u64, sealed.len() as u64);
            let merged = self.progress.snapshot().bytes_acknowledged;
            self.reporter.report(merged);
            debug!(
                file_id = %self.descriptor.file_id,
                part,
                bytes = plain.len(),
                "part merged"
            );

            self.deps
                .assertions
                .part_downloaded(&self.descriptor, part)
                .await?;
        }
        Ok(())
    }

    fn schedule_prefetch(&mut self) {
        for part in self.parts.prefetch_candidates(self.prefetch_depth) {
            if self.fetches.contains_key(&part) {
                continue;
            }
            let deps = self.deps.clone();
            let descriptor = self.descriptor.clone();
            self.fetches.insert(
                part,
                tokio::spawn(async move { fetch_part(&deps, &descriptor, part).await }),
            );
        }
    }

    async fn fetch(&mut self, part: u32) -> Result<Vec<u8>, TransferError> {
        match self.fetches.remove(&part) {
            Some(mut handle) => tokio::select! {
                biased;
                _ = self.errors.cancelled() => {
                    handle.abort();
                    Err(TransferError::Cancelled)
                }
                joined = &mut handle => joined?,
            },
            None => tokio::select! {
                biased;
                _ = self.errors.cancelled() => Err(TransferError::Cancelled),
                fetched = fetch_part(&self.deps, &self.descriptor, part) => fetched,
            },
        }
    }
}

impl Drop for FileMerger {
    fn drop(&mut self) {
        for (_, handle) in self.fetches.drain() {
            handle.abort();
        }
    }
}

async fn fetch_part(
    deps: &TransferDeps,
    descriptor: &TransferDescriptor,
    part: u32,
) -> Result<Vec<u8>, TransferError> {
    let url = deps.storage.download_url(descriptor, part).await?;
    let (expected, body) = tokio::try_join!(
        deps.storage.object_size(descriptor, part),
        deps.transport.get(&url)
    )?;
    let actual = body.len() as u64;
    if actual != expected {
        warn!(file_id = %descriptor.file_id, part, expected, actual, "short part body");
        return Err(TransferError::Truncated { expected, actual });
    }
    Ok(body)
}

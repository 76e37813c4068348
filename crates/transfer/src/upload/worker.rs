use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use relaysync_protocol::TransferDescriptor;
use tracing::debug;

use crate::TransferError;
use crate::controller::{AdaptiveTransferController, TransferOutcome};
use crate::crypto::Slice;
use crate::deps::TransferDeps;
use crate::error_manager::ErrorManager;
use crate::progress::TransferProgressState;
use crate::upload::coordinator::UploadCoordinator;
use crate::upload::parallelism::WorkerSlots;

/// State shared by the supervisor and every worker of one upload.
pub struct WorkerContext {
    pub descriptor: TransferDescriptor,
    pub deps: TransferDeps,
    pub controller: Arc<AdaptiveTransferController>,
    pub coordinator: Arc<UploadCoordinator>,
    pub progress: Arc<TransferProgressState>,
    pub errors: Arc<ErrorManager>,
    pub slots: Arc<WorkerSlots>,
    /// Parts stored remotely, for cleanup after a failure.
    pub uploaded: Arc<Mutex<Vec<u32>>>,
}

/// Holds one [`WorkerSlots`] claim until the worker exits or retires.
struct SlotGuard<'a> {
    slots: &'a WorkerSlots,
    held: bool,
}

impl SlotGuard<'_> {
    fn retire_if_excess(&mut self, target: usize) -> bool {
        if self.slots.retire_if_excess(target) {
            self.held = false;
        }
        !self.held
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.held {
            self.slots.release();
        }
    }
}

/// Takes slices off the queue and PUTs them until the queue drains, the
/// pool shrinks below it, or the transfer fails. Never retries.
pub struct UploadWorker {
    id: usize,
    ctx: Arc<WorkerContext>,
}

impl UploadWorker {
    pub fn new(id: usize, ctx: Arc<WorkerContext>) -> Self {
        Self { id, ctx }
    }

    pub async fn run(self) {
        let ctx = &self.ctx;
        let mut slot = SlotGuard {
            slots: &ctx.slots,
            held: true,
        };

        loop {
            if slot.retire_if_excess(ctx.controller.desired_parallelism()) {
                debug!(file_id = %ctx.descriptor.file_id, worker = self.id, "worker retired");
                return;
            }
            let Some(slice) = ctx.coordinator.take().await else {
                break;
            };
            if let Err(e) = self.upload(slice).await {
                ctx.errors.set_error(e);
                break;
            }
        }
        debug!(file_id = %ctx.descriptor.file_id, worker = self.id, "worker exiting");
    }

    async fn upload(&self, slice: Slice) -> Result<(), TransferError> {
        let ctx = &self.ctx;
        let part = slice.part_number;
        let plain_len = slice.plain_len as u64;
        let cipher_len = slice.data.len() as u64;

        let url = ctx.deps.storage.upload_url(&ctx.descriptor, part).await?;

        // In-flight PUTs are never dropped: the transport timeout bounds them,
        // and a stored part must reach `uploaded` so cleanup can delete it.
        let started = Instant::now();
        let result = ctx.deps.transport.put(&url, slice.data).await;
        let elapsed = started.elapsed();

        let mut outcome = TransferOutcome {
            elapsed,
            success: false,
            part_number: part,
            status: None,
            error: None,
            actual_bytes: Some(cipher_len),
        };
        match result {
            Ok(response) if response.is_success() => {
                outcome.success = true;
                outcome.status = Some(response.status);
                ctx.controller.record_result(&outcome);
            }
            Ok(response) => {
                let err = TransferError::StorageRejected {
                    status: response.status,
                };
                outcome.status = Some(response.status);
                outcome.error = Some(&err);
                ctx.controller.record_result(&outcome);
                return Err(err);
            }
            Err(err) => {
                outcome.error = Some(&err);
                ctx.controller.record_result(&outcome);
                return Err(err);
            }
        }

        ctx.uploaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(part);
        if ctx.errors.is_error() {
            return Err(TransferError::Cancelled);
        }
        ctx.deps
            .assertions
            .part_uploaded(&ctx.descriptor, part, cipher_len)
            .await?;
        ctx.progress.slice_completed(plain_len, cipher_len);
        ctx.progress.record_controller(
            ctx.controller.next_chunk_size_bytes(),
            ctx.controller.desired_parallelism(),
        );

        debug!(
            file_id = %ctx.descriptor.file_id,
            worker = self.id,
            part,
            bytes = cipher_len,
            elapsed_ms = elapsed.as_millis() as u64,
            "part uploaded"
        );
        Ok(())
    }
}

use std::fs::File;
use std::sync::Arc;

use tracing::debug;

use crate::controller::AdaptiveTransferController;
use crate::crypto::{SliceEncrypter, SliceRead};
use crate::error_manager::ErrorManager;
use crate::progress::TransferProgressState;
use crate::upload::coordinator::SlicePublisher;

/// Producer stage: reads and encrypts the source slice by slice and
/// publishes onto the bounded queue.
pub struct UploadSlicingManager {
    encrypter: SliceEncrypter<File>,
    controller: Arc<AdaptiveTransferController>,
    progress: Arc<TransferProgressState>,
    publisher: SlicePublisher,
    errors: Arc<ErrorManager>,
}

impl UploadSlicingManager {
    pub fn new(
        encrypter: SliceEncrypter<File>,
        controller: Arc<AdaptiveTransferController>,
        progress: Arc<TransferProgressState>,
        publisher: SlicePublisher,
        errors: Arc<ErrorManager>,
    ) -> Self {
        Self {
            encrypter,
            controller,
            progress,
            publisher,
            errors,
        }
    }

    /// Runs until end of file or the first error. Returns the number of
    /// slices produced. The queue is closed when this returns.
    pub async fn run(self) -> u32 {
        let Self {
            mut encrypter,
            controller,
            progress,
            publisher,
            errors,
        } = self;

        loop {
            if errors.is_error() {
                break;
            }

            let chunk = controller.next_chunk_size_bytes();
            progress.record_controller(chunk, controller.desired_parallelism());

            // File reads and AES run off the async workers.
            let joined = tokio::task::spawn_blocking(move || {
                let read = encrypter.next_slice(chunk);
                (encrypter, read)
            })
            .await;
            let read = match joined {
                Ok((enc, read)) => {
                    encrypter = enc;
                    read
                }
                Err(e) => {
                    errors.set_error(e.into());
                    return 0;
                }
            };

            match read {
                Ok(SliceRead::Slice(slice)) => {
                    debug!(
                        file_id = errors.file_id(),
                        part = slice.part_number,
                        bytes = slice.plain_len,
                        chunk_size = chunk,
                        "slice created"
                    );
                    progress.slice_created();
                    if publisher.publish(slice).await.is_err() {
                        break;
                    }
                }
                Ok(SliceRead::EndOfStream) => break,
                Err(e) => {
                    errors.set_error(e);
                    break;
                }
            }
        }

        encrypter.parts_emitted()
    }
}

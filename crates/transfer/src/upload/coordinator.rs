use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc, watch};

use crate::TransferError;
use crate::crypto::Slice;
use crate::error_manager::ErrorManager;

/// Bounded hand-off queue between the slicer and the worker pool, plus the
/// shared completion latch.
pub struct UploadCoordinator {
    rx: Mutex<mpsc::Receiver<Slice>>,
    errors: Arc<ErrorManager>,
    finished: watch::Sender<bool>,
    drained: AtomicBool,
}

/// Producer half of the queue. Dropping it closes the queue.
pub struct SlicePublisher {
    tx: mpsc::Sender<Slice>,
    errors: Arc<ErrorManager>,
}

impl UploadCoordinator {
    pub fn new(capacity: usize, errors: Arc<ErrorManager>) -> (Self, SlicePublisher) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (finished, _) = watch::channel(false);
        let coordinator = Self {
            rx: Mutex::new(rx),
            errors: Arc::clone(&errors),
            finished,
            drained: AtomicBool::new(false),
        };
        (coordinator, SlicePublisher { tx, errors })
    }

    /// Next slice to upload.
    ///
    /// `None` once the transfer failed, or once the producer is gone and
    /// every queued slice has been handed out.
    pub async fn take(&self) -> Option<Slice> {
        if self.errors.is_error() {
            return None;
        }
        let mut rx = tokio::select! {
            biased;
            _ = self.errors.cancelled() => return None,
            rx = self.rx.lock() => rx,
        };
        tokio::select! {
            biased;
            _ = self.errors.cancelled() => None,
            slice = rx.recv() => {
                if slice.is_none() {
                    self.drained.store(true, Ordering::SeqCst);
                }
                slice
            }
        }
    }

    /// The producer finished and the queue is empty.
    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::SeqCst)
    }

    /// Signals that every slice has been uploaded and acknowledged.
    pub fn finish(&self) {
        self.finished.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    pub async fn wait_finished(&self) {
        let mut rx = self.finished.subscribe();
        // The sender lives in `self`, so this only returns once finished.
        let _ = rx.wait_for(|done| *done).await;
    }

    pub fn errors(&self) -> &Arc<ErrorManager> {
        &self.errors
    }
}

impl SlicePublisher {
    /// Enqueues a slice, waiting while the queue is full.
    ///
    /// Fails with `Cancelled` once the transfer has errored; the slice is
    /// dropped.
    pub async fn publish(&self, slice: Slice) -> Result<(), TransferError> {
        if self.errors.is_error() {
            return Err(TransferError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.errors.cancelled() => Err(TransferError::Cancelled),
            sent = self.tx.send(slice) => sent.map_err(|_| TransferError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn slice(part: u32) -> Slice {
        Slice {
            part_number: part,
            data: vec![0; 16],
            plain_len: 0,
        }
    }

    #[tokio::test]
    async fn hands_out_slices_then_drains() {
        let errors = Arc::new(ErrorManager::new("f"));
        let (coord, publisher) = UploadCoordinator::new(2, errors);
        publisher.publish(slice(1)).await.unwrap();
        publisher.publish(slice(2)).await.unwrap();
        drop(publisher);

        assert_eq!(coord.take().await.unwrap().part_number, 1);
        assert_eq!(coord.take().await.unwrap().part_number, 2);
        assert!(!coord.is_drained());
        assert!(coord.take().await.is_none());
        assert!(coord.is_drained());
    }

    #[tokio::test]
    async fn full_queue_blocks_until_error() {
        let errors = Arc::new(ErrorManager::new("f"));
        let (coord, publisher) = UploadCoordinator::new(1, Arc::clone(&errors));
        publisher.publish(slice(1)).await.unwrap();

        let blocked = tokio::spawn(async move { publisher.publish(slice(2)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        errors.set_error(TransferError::Timeout);
        let result = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(TransferError::Cancelled)));
        // Queued slices are never handed out after the error.
        assert!(coord.take().await.is_none());
        assert!(!coord.is_drained());
    }

    #[tokio::test]
    async fn publish_after_error_is_rejected() {
        let errors = Arc::new(ErrorManager::new("f"));
        let (_coord, publisher) = UploadCoordinator::new(4, Arc::clone(&errors));
        errors.set_error(TransferError::Crypto { part: 1 });
        assert!(publisher.publish(slice(1)).await.is_err());
    }

    #[tokio::test]
    async fn waiting_take_wakes_on_error() {
        let errors = Arc::new(ErrorManager::new("f"));
        let (coord, _publisher) = UploadCoordinator::new(1, Arc::clone(&errors));
        let coord = Arc::new(coord);
        let waiter = {
            let coord = Arc::clone(&coord);
            tokio::spawn(async move { coord.take().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        errors.set_error(TransferError::Timeout);
        let taken = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(taken.is_none());
    }

    #[tokio::test]
    async fn finished_latch() {
        let errors = Arc::new(ErrorManager::new("f"));
        let (coord, _publisher) = UploadCoordinator::new(1, errors);
        let coord = Arc::new(coord);
        let waiter = {
            let coord = Arc::clone(&coord);
            tokio::spawn(async move { coord.wait_finished().await })
        };
        assert!(!coord.is_finished());
        coord.finish();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(coord.is_finished());
    }
}

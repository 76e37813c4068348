use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::error_manager::ErrorManager;
use crate::progress::{ProgressReporter, TransferProgressState};
use crate::upload::coordinator::UploadCoordinator;

/// Publishes upload progress until the upload finishes or fails.
pub struct UploadProgressMonitor {
    coordinator: Arc<UploadCoordinator>,
    progress: Arc<TransferProgressState>,
    reporter: Arc<ProgressReporter>,
    errors: Arc<ErrorManager>,
    interval: Duration,
}

impl UploadProgressMonitor {
    pub fn new(
        coordinator: Arc<UploadCoordinator>,
        progress: Arc<TransferProgressState>,
        reporter: Arc<ProgressReporter>,
        errors: Arc<ErrorManager>,
        interval: Duration,
    ) -> Self {
        Self {
            coordinator,
            progress,
            reporter,
            errors,
            interval,
        }
    }

    /// Returns the final acknowledged plaintext byte count.
    pub async fn run(self) -> u64 {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = self.errors.cancelled() => break,
                _ = self.coordinator.wait_finished() => break,
                _ = ticker.tick() => {
                    self.reporter.report(self.progress.snapshot().bytes_acknowledged);
                }
            }
        }
        self.progress.snapshot().bytes_acknowledged
    }
}

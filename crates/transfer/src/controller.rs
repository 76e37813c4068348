//! AIMD controller for slice size and upload parallelism.
//!
//! Both dimensions grow multiplicatively/additively after a window of fast
//! successes and shrink immediately on congestion, the way TCP congestion
//! avoidance treats its window. Fields are independent atomics updated
//! last-writer-wins: concurrent workers converge, they are not serialized.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::ControllerConfig;
use crate::{TransferError, is_congestion_status};

/// Feedback from one slice transfer attempt.
#[derive(Debug, Clone, Copy)]
pub struct TransferOutcome<'a> {
    pub elapsed: Duration,
    pub success: bool,
    pub part_number: u32,
    pub status: Option<u16>,
    pub error: Option<&'a TransferError>,
    /// Bytes actually sent for the part.
    pub actual_bytes: Option<u64>,
}

impl TransferOutcome<'_> {
    fn is_congestion(&self) -> bool {
        match (self.error, self.status) {
            (Some(e), _) => e.is_congestion(),
            (None, Some(status)) => is_congestion_status(status),
            // A failure with neither error nor status is treated as a lost request.
            (None, None) => true,
        }
    }
}

/// Decides chunk size and desired worker count from transfer feedback.
pub struct AdaptiveTransferController {
    config: ControllerConfig,
    chunk_size: AtomicUsize,
    parallelism: AtomicUsize,
    granted_slots: AtomicUsize,
    consecutive_successes: AtomicU32,
}

impl AdaptiveTransferController {
    pub fn new(config: ControllerConfig) -> Self {
        let chunk = bound(
            config.initial_chunk_size,
            config.min_chunk_size,
            config.max_chunk_size,
        );
        let parallelism = bound(
            config.initial_parallelism,
            config.min_parallelism.max(1),
            config.max_parallelism.max(1),
        );
        Self {
            config,
            chunk_size: AtomicUsize::new(chunk),
            parallelism: AtomicUsize::new(parallelism),
            granted_slots: AtomicUsize::new(usize::MAX),
            consecutive_successes: AtomicU32::new(0),
        }
    }

    /// Plaintext bytes the slicer should read for the next slice.
    pub fn next_chunk_size_bytes(&self) -> usize {
        self.chunk_size.load(Ordering::Relaxed)
    }

    /// Worker count the pool should converge to, capped by the granted slots.
    pub fn desired_parallelism(&self) -> usize {
        let local = self.parallelism.load(Ordering::Relaxed);
        local.min(self.granted_slots.load(Ordering::Relaxed))
    }

    /// Local preference before the external slot cap is applied.
    pub fn parallelism(&self) -> usize {
        self.parallelism.load(Ordering::Relaxed)
    }

    /// Imposes a hard external ceiling on [`desired_parallelism`](Self::desired_parallelism).
    ///
    /// A grant of zero pauses uploads until a new grant arrives.
    pub fn set_granted_slots(&self, slots: usize) {
        debug!(slots, "granted upload slots updated");
        self.granted_slots.store(slots, Ordering::Relaxed);
    }

    pub fn granted_slots(&self) -> Option<usize> {
        match self.granted_slots.load(Ordering::Relaxed) {
            usize::MAX => None,
            n => Some(n),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Feeds one transfer result back into the controller.
    pub fn record_result(&self, outcome: &TransferOutcome<'_>) {
        if outcome.success {
            self.on_success(outcome);
        } else {
            self.on_failure(outcome);
        }
    }

    fn on_success(&self, outcome: &TransferOutcome<'_>) {
        let streak = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
        if streak < self.config.success_window.max(1) {
            return;
        }
        self.consecutive_successes.store(0, Ordering::Relaxed);

        let chunk = self.chunk_size.load(Ordering::Relaxed);
        if self.is_fast(outcome, chunk) {
            let grown = ((chunk as f64) * self.config.growth_factor) as usize;
            let grown = bound(grown, self.config.min_chunk_size, self.config.max_chunk_size);
            if grown != chunk {
                self.chunk_size.store(grown, Ordering::Relaxed);
                debug!(part = outcome.part_number, from = chunk, to = grown, "chunk size grown");
            }
        }

        // A full window passed without a failure: try one more worker.
        let current = self.parallelism.load(Ordering::Relaxed);
        if current < self.config.max_parallelism {
            self.parallelism.store(current + 1, Ordering::Relaxed);
            debug!(part = outcome.part_number, parallelism = current + 1, "parallelism raised");
        }
    }

    fn on_failure(&self, outcome: &TransferOutcome<'_>) {
        self.consecutive_successes.store(0, Ordering::Relaxed);
        if !outcome.is_congestion() {
            return;
        }

        let chunk = self.chunk_size.load(Ordering::Relaxed);
        let shrunk = ((chunk as f64) / self.config.backoff_divisor) as usize;
        let shrunk = bound(shrunk, self.config.min_chunk_size, self.config.max_chunk_size);
        self.chunk_size.store(shrunk, Ordering::Relaxed);

        let floor = self.config.min_parallelism.max(1);
        let current = self.parallelism.load(Ordering::Relaxed);
        let reduced = current.saturating_sub(1).max(floor);
        self.parallelism.store(reduced, Ordering::Relaxed);

        warn!(
            part = outcome.part_number,
            status = ?outcome.status,
            chunk_size = shrunk,
            parallelism = reduced,
            "congestion detected, backing off"
        );
    }

    /// Throughput at or above `chunk / target_latency` counts as fast.
    fn is_fast(&self, outcome: &TransferOutcome<'_>, chunk: usize) -> bool {
        let Some(bytes) = outcome.actual_bytes else {
            return false;
        };
        let secs = outcome.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return true;
        }
        let throughput = bytes as f64 / secs;
        let threshold = chunk as f64 / self.config.target_latency().as_secs_f64();
        throughput >= threshold
    }
}

/// Like `clamp`, but an inverted range (rejected later by `validate`)
/// does not panic.
fn bound(value: usize, min: usize, max: usize) -> usize {
    value.min(max).max(min)
}

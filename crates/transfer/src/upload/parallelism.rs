use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::upload::worker::{UploadWorker, WorkerContext};

/// Live worker count, claimed by the supervisor and released by workers.
#[derive(Debug, Default)]
pub struct WorkerSlots {
    live: AtomicUsize,
}

impl WorkerSlots {
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Claims a slot if fewer than `target` workers are live.
    pub fn try_claim(&self, target: usize) -> bool {
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live < target).then_some(live + 1)
            })
            .is_ok()
    }

    /// Releases a slot if more than `target` workers are live.
    ///
    /// Exactly one of several racing workers wins each excess slot.
    pub fn retire_if_excess(&self, target: usize) -> bool {
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live > target).then(|| live - 1)
            })
            .is_ok()
    }

    pub fn release(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Supervisor keeping the worker pool at the controller's desired size.
///
/// Grows the pool by spawning on every tick; shrinks it by letting workers
/// notice the lower target and exit between slices.
pub struct ParallelismManager {
    ctx: Arc<WorkerContext>,
    tick: Duration,
}

impl ParallelismManager {
    pub fn new(ctx: Arc<WorkerContext>, tick: Duration) -> Self {
        Self { ctx, tick }
    }

    /// Runs until every slice is uploaded or the transfer fails, then waits
    /// for the remaining workers to exit.
    pub async fn run(self) {
        let ctx = self.ctx;
        let mut workers = JoinSet::new();
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut next_id = 0usize;

        loop {
            if ctx.errors.is_error() {
                break;
            }
            if ctx.slots.live() == 0 && ctx.coordinator.is_drained() {
                debug!(file_id = ctx.errors.file_id(), "all slices uploaded");
                ctx.coordinator.finish();
                break;
            }

            let target = ctx.controller.desired_parallelism();
            while ctx.slots.try_claim(target) {
                next_id += 1;
                debug!(file_id = ctx.errors.file_id(), worker = next_id, target, "starting upload worker");
                workers.spawn(UploadWorker::new(next_id, Arc::clone(&ctx)).run());
            }

            tokio::select! {
                biased;
                _ = ctx.errors.cancelled() => {}
                Some(joined) = workers.join_next() => {
                    if let Err(e) = joined {
                        ctx.errors.set_error(e.into());
                    }
                }
                _ = ticker.tick() => {}
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                ctx.errors.set_error(e.into());
            }
        }
    }
}

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use relaysync_protocol::constants::FIRST_PART;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::TransferError;
use crate::error_manager::ErrorManager;

#[derive(Debug)]
struct PartsLedger {
    available: BTreeSet<u32>,
    total: Option<u32>,
    next: u32,
    merged: u32,
}

/// Tracks which remote parts can be fetched and releases them to the
/// merger strictly in ascending order.
///
/// Parts may be announced in any order and before the total is known;
/// early parts are kept until the merge cursor reaches them.
pub struct DownloadPartsCoordinator {
    ledger: Mutex<PartsLedger>,
    notify: Notify,
    errors: Arc<ErrorManager>,
}

impl DownloadPartsCoordinator {
    pub fn new(errors: Arc<ErrorManager>) -> Self {
        Self {
            ledger: Mutex::new(PartsLedger {
                available: BTreeSet::new(),
                total: None,
                next: FIRST_PART,
                merged: 0,
            }),
            notify: Notify::new(),
            errors,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PartsLedger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records that `part` can be fetched. Returns `false` if the part was
    /// ignored (already merged, beyond the total, duplicate, or the
    /// transfer failed).
    pub fn add_available_part(&self, part: u32) -> bool {
        if self.errors.is_error() {
            return false;
        }
        let added = {
            let mut ledger = self.lock();
            if part < ledger.next || ledger.total.is_some_and(|total| part > total) {
                debug!(file_id = self.errors.file_id(), part, next = ledger.next, "ignoring part");
                return false;
            }
            ledger.available.insert(part)
        };
        if added {
            self.notify.notify_one();
        }
        added
    }

    /// Announces the total part count. The first announcement wins.
    ///
    /// A total below the number of parts already merged fails the transfer.
    pub fn set_total_parts_known(&self, total: u32) -> bool {
        let merged = {
            let mut ledger = self.lock();
            let current = ledger.total;
            match current {
                Some(existing) => {
                    if existing != total {
                        warn!(
                            file_id = self.errors.file_id(),
                            existing,
                            announced = total,
                            "conflicting total part count ignored"
                        );
                    }
                    return false;
                }
                None if total < FIRST_PART => {
                    warn!(file_id = self.errors.file_id(), "total part count of zero ignored");
                    return false;
                }
                None if total < ledger.merged => ledger.merged,
                None => {
                    ledger.total = Some(total);
                    ledger.available.retain(|&p| p <= total);
                    drop(ledger);
                    self.notify.notify_one();
                    return true;
                }
            }
        };
        self.errors.set_error(TransferError::PartCount {
            announced: total,
            merged,
        });
        false
    }

    /// Waits for the next part in merge order.
    ///
    /// `None` once every part is merged or the transfer failed.
    pub async fn next_ready(&self) -> Option<u32> {
        loop {
            // Register interest before checking so a concurrent notify is kept.
            let notified = self.notify.notified();
            {
                let ledger = self.lock();
                if self.errors.is_error() {
                    return None;
                }
                if ledger.total.is_some_and(|total| ledger.next > total) {
                    return None;
                }
                if ledger.available.contains(&ledger.next) {
                    return Some(ledger.next);
                }
            }
            tokio::select! {
                biased;
                _ = self.errors.cancelled() => return None,
                _ = notified => {}
            }
        }
    }

    /// Advances the merge cursor past `part`, which must be the next one.
    pub fn mark_merged(&self, part: u32) {
        let mut ledger = self.lock();
        if part != ledger.next {
            warn!(file_id = self.errors.file_id(), part, next = ledger.next, "merge out of order ignored");
            return;
        }
        ledger.available.remove(&part);
        ledger.next += 1;
        ledger.merged += 1;
    }

    /// Up to `limit` announced parts at or above the merge cursor.
    pub fn prefetch_candidates(&self, limit: usize) -> Vec<u32> {
        let ledger = self.lock();
        ledger.available.range(ledger.next..).take(limit).copied().collect()
    }

    /// `true` only once the total is known and every part is merged.
    pub fn all_parts_merged(&self) -> bool {
        let ledger = self.lock();
        ledger.total.is_some_and(|total| ledger.merged == total)
    }

    pub fn total_parts(&self) -> Option<u32> {
        self.lock().total
    }

    pub fn merged_parts(&self) -> u32 {
        self.lock().merged
    }

    pub fn next_expected(&self) -> u32 {
        self.lock().next
    }
}

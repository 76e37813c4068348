//! Entry point owning every live transfer of one client.
//!
//! The service keeps one [`UploadEngine`] per uploaded file id and one
//! download slot per downloaded file id. Download slots are created by
//! whichever comes first: a relay notification or `start_download`, since
//! the relay may announce parts before the receiver knows where they go.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_util::FutureExt;
use futures_util::future::Shared;
use relaysync_protocol::{
    FileReadyNotification, PartReadyNotification, SlotGrant, TransferDescriptor,
};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::TransferError;
use crate::cache::TransferCache;
use crate::config::TransferConfig;
use crate::deps::TransferDeps;
use crate::download::{DownloadEngine, DownloadPartsCoordinator, DownloadReport, DownloadTarget};
use crate::error_manager::ErrorManager;
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::storage::BoxFuture;
use crate::upload::{UploadEngine, UploadSummary};

/// Handle to a running upload. Cloneable; every clone sees the same result.
pub type UploadTask = Shared<BoxFuture<'static, Result<UploadSummary, Arc<TransferError>>>>;

/// Handle to a running download. Cloneable; every clone sees the same result.
pub type DownloadTask = Shared<BoxFuture<'static, Result<DownloadReport, Arc<TransferError>>>>;

struct UploadEntry {
    engine: Arc<UploadEngine>,
    task: UploadTask,
}

/// Download state that exists before the engine does.
struct DownloadSlot {
    errors: Arc<ErrorManager>,
    parts: Arc<DownloadPartsCoordinator>,
    reporter: Arc<ProgressReporter>,
    task: Mutex<Option<DownloadTask>>,
}

impl DownloadSlot {
    fn new(file_id: &str) -> Self {
        let errors = Arc::new(ErrorManager::new(file_id));
        Self {
            parts: Arc::new(DownloadPartsCoordinator::new(Arc::clone(&errors))),
            errors,
            reporter: Arc::new(ProgressReporter::new()),
            task: Mutex::new(None),
        }
    }

    fn is_started(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// How many finished download ids are remembered.
const TOMBSTONE_CAPACITY: usize = 1024;

/// Recently finished download ids, oldest evicted first.
///
/// Late or duplicated relay notifications for these ids are dropped instead
/// of creating a slot nobody will start.
#[derive(Default)]
struct Tombstones {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl Tombstones {
    fn insert(&mut self, file_id: &str) {
        if !self.ids.insert(file_id.to_string()) {
            return;
        }
        self.order.push_back(file_id.to_string());
        if self.order.len() > TOMBSTONE_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn remove(&mut self, file_id: &str) {
        if self.ids.remove(file_id) {
            self.order.retain(|id| id != file_id);
        }
    }

    fn contains(&self, file_id: &str) -> bool {
        self.ids.contains(file_id)
    }
}

fn lock_tombstones(tombstones: &Mutex<Tombstones>) -> MutexGuard<'_, Tombstones> {
    tombstones.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct TransferService {
    deps: TransferDeps,
    config: TransferConfig,
    uploads: Arc<TransferCache<UploadEntry>>,
    downloads: Arc<TransferCache<DownloadSlot>>,
    // Locked before `downloads` whenever both are needed.
    finished: Arc<Mutex<Tombstones>>,
}

impl TransferService {
    pub fn new(deps: TransferDeps, config: TransferConfig) -> Self {
        Self {
            deps,
            config,
            uploads: Arc::new(TransferCache::new()),
            downloads: Arc::new(TransferCache::new()),
            finished: Arc::new(Mutex::new(Tombstones::default())),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Starts uploading `source` as `descriptor`, or returns the running
    /// upload with the same file id.
    ///
    /// Must be called from within a Tokio runtime. The upload runs whether
    /// or not the returned task is awaited.
    pub fn start_upload(
        &self,
        source: impl Into<PathBuf>,
        descriptor: TransferDescriptor,
    ) -> UploadTask {
        let file_id = descriptor.file_id.clone();
        let (entry, created) = self.uploads.get_or_insert_with(&file_id, || {
            let engine = Arc::new(UploadEngine::new(
                source,
                descriptor,
                self.deps.clone(),
                self.config.clone(),
            ));
            let task = {
                let engine = Arc::clone(&engine);
                let uploads = Arc::clone(&self.uploads);
                let file_id = file_id.clone();
                async move {
                    let result = engine.run().await.map_err(Arc::new);
                    uploads.remove_if(&file_id, |e| Arc::ptr_eq(&e.engine, &engine));
                    result
                }
                .boxed()
                .shared()
            };
            UploadEntry { engine, task }
        });

        if created {
            tokio::spawn(entry.task.clone());
        } else {
            debug!(%file_id, "upload already running");
        }
        entry.task.clone()
    }

    /// Starts the download of `target`, or returns the running one.
    ///
    /// Parts announced before this call are kept and merged. Starting an id
    /// that already finished begins a fresh download. Must be called from
    /// within a Tokio runtime.
    pub fn start_download(&self, target: DownloadTarget) -> DownloadTask {
        let file_id = target.descriptor().file_id.clone();
        let (slot, _) = {
            let mut finished = lock_tombstones(&self.finished);
            finished.remove(&file_id);
            self.downloads
                .get_or_insert_with(&file_id, || DownloadSlot::new(&file_id))
        };

        let mut task = slot.task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = task.as_ref() {
            debug!(%file_id, "download already running");
            return existing.clone();
        }

        let engine = DownloadEngine::with_shared(
            target,
            self.deps.clone(),
            self.config.clone(),
            Arc::clone(&slot.errors),
            Arc::clone(&slot.parts),
            Arc::clone(&slot.reporter),
        );
        let downloads = Arc::clone(&self.downloads);
        let finished = Arc::clone(&self.finished);
        let weak: Weak<DownloadSlot> = Arc::downgrade(&slot);
        let shared = async move {
            let result = engine.run().await.map_err(Arc::new);
            {
                let mut finished = lock_tombstones(&finished);
                let evicted = downloads
                    .remove_if(&file_id, |e| std::ptr::eq(Arc::as_ptr(e), weak.as_ptr()));
                if evicted.is_some() {
                    finished.insert(&file_id);
                }
            }
            result
        }
        .boxed()
        .shared();

        tokio::spawn(shared.clone());
        *task = Some(shared.clone());
        shared
    }

    /// Relay notification: a part of a remote file can be fetched.
    ///
    /// Returns `false` if the part was rejected (duplicate, already merged,
    /// beyond the announced total, the download failed or already finished).
    pub fn on_part_ready(&self, notification: &PartReadyNotification) -> bool {
        self.download_slot(&notification.file_id)
            .is_some_and(|slot| slot.parts.add_available_part(notification.part_number))
    }

    /// Relay notification: the sender finished; the part count is final.
    pub fn on_file_ready_to_finalize(&self, notification: &FileReadyNotification) -> bool {
        self.download_slot(&notification.file_id)
            .is_some_and(|slot| slot.parts.set_total_parts_known(notification.total_parts))
    }

    /// Relay grant capping the parallelism of one upload.
    pub fn on_slot_grant(&self, grant: &SlotGrant) -> bool {
        match self.uploads.get(&grant.file_id) {
            Some(entry) => {
                entry.engine.controller().set_granted_slots(grant.slots);
                debug!(file_id = %grant.file_id, slots = grant.slots, "slot grant applied");
                true
            }
            None => false,
        }
    }

    /// Slot for a notification, or `None` if the download already finished.
    fn download_slot(&self, file_id: &str) -> Option<Arc<DownloadSlot>> {
        let finished = lock_tombstones(&self.finished);
        if finished.contains(file_id) {
            debug!(%file_id, "notification for finished download dropped");
            return None;
        }
        let (slot, created) = self
            .downloads
            .get_or_insert_with(file_id, || DownloadSlot::new(file_id));
        if created {
            debug!(%file_id, "download slot created");
        }
        Some(slot)
    }

    pub fn upload_progress(&self, file_id: &str) -> Option<watch::Receiver<ProgressEvent>> {
        self.uploads.get(file_id).map(|e| e.engine.subscribe())
    }

    pub fn download_progress(&self, file_id: &str) -> Option<watch::Receiver<ProgressEvent>> {
        self.downloads.get(file_id).map(|s| s.reporter.subscribe())
    }

    /// Cancels the upload and the download of `file_id`, if any.
    pub fn cancel(&self, file_id: &str) -> bool {
        let mut found = false;
        if let Some(entry) = self.uploads.get(file_id) {
            entry.engine.cancel();
            found = true;
        }
        if let Some(slot) = self.downloads.get(file_id) {
            slot.errors.cancel();
            found = true;
            // A slot nobody started would otherwise never be evicted.
            if !slot.is_started() {
                let mut finished = lock_tombstones(&self.finished);
                if self.downloads.remove_if(file_id, |e| Arc::ptr_eq(e, &slot)).is_some() {
                    finished.insert(file_id);
                }
            }
        }
        if found {
            info!(%file_id, "transfer cancelled");
        }
        found
    }

    pub fn active_uploads(&self) -> usize {
        self.uploads.len()
    }

    /// Download slots, including the ones only known through notifications.
    pub fn active_downloads(&self) -> usize {
        self.downloads.len()
    }
}

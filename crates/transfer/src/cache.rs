//! Registry of live transfers keyed by file id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Holds at most one entry per file id.
///
/// The cache owns the entries; callers get `Arc` handles that stay valid
/// after the entry is removed.
pub struct TransferCache<E> {
    entries: Mutex<HashMap<String, Arc<E>>>,
}

impl<E> Default for TransferCache<E> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<E> TransferCache<E> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<E>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the entry for `file_id`, creating it with `create` if absent.
    ///
    /// The flag is `true` when the entry was created by this call. `create`
    /// runs under the cache lock and must not touch the cache.
    pub fn get_or_insert_with<F>(&self, file_id: &str, create: F) -> (Arc<E>, bool)
    where
        F: FnOnce() -> E,
    {
        let mut entries = self.lock();
        if let Some(existing) = entries.get(file_id) {
            return (Arc::clone(existing), false);
        }
        let entry = Arc::new(create());
        entries.insert(file_id.to_string(), Arc::clone(&entry));
        (entry, true)
    }

    pub fn get(&self, file_id: &str) -> Option<Arc<E>> {
        self.lock().get(file_id).cloned()
    }

    pub fn remove(&self, file_id: &str) -> Option<Arc<E>> {
        self.lock().remove(file_id)
    }

    /// Removes the entry only if `pred` holds for it.
    ///
    /// Used to evict a finished transfer without evicting a newer one that
    /// reused the same id.
    pub fn remove_if<P>(&self, file_id: &str, pred: P) -> Option<Arc<E>>
    where
        P: FnOnce(&Arc<E>) -> bool,
    {
        let mut entries = self.lock();
        match entries.get(file_id) {
            Some(entry) if pred(entry) => entries.remove(file_id),
            _ => None,
        }
    }

    pub fn file_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

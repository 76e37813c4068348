use std::sync::Arc;

use crate::assertions::RemoteAssertions;
use crate::crypto::{KeySupplier, SessionKey};
use crate::memory::MemoryStore;
use crate::storage::{ObjectTransport, StorageStrategy};

/// External collaborators every engine is constructed with.
#[derive(Clone)]
pub struct TransferDeps {
    pub storage: Arc<dyn StorageStrategy>,
    pub transport: Arc<dyn ObjectTransport>,
    pub assertions: Arc<dyn RemoteAssertions>,
    pub keys: Arc<dyn KeySupplier>,
}

impl TransferDeps {
    pub fn new(
        storage: Arc<dyn StorageStrategy>,
        transport: Arc<dyn ObjectTransport>,
        assertions: Arc<dyn RemoteAssertions>,
        keys: Arc<dyn KeySupplier>,
    ) -> Self {
        Self {
            storage,
            transport,
            assertions,
            keys,
        }
    }

    /// Wires every seam to one in-process store.
    pub fn in_memory(store: Arc<MemoryStore>, key: SessionKey) -> Self {
        Self {
            storage: store.clone(),
            transport: store.clone(),
            assertions: store,
            keys: Arc::new(key),
        }
    }
}

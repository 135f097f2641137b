//! Per-queue client handle into a shared message store.

use bytes::Bytes;

use crate::core::{Guid, StoreRef};

use super::{MsgStore, MsgStoreResult};

/// A queue's handle on one store. The `ref` exists purely for
/// crash-recovery bookkeeping: the store records it in its clean-shutdown
/// marker, and presenting it again at the next open is how the queue takes
/// part in the clean/dirty negotiation.
#[derive(Clone)]
pub struct StoreClient {
    store: MsgStore,
    store_ref: StoreRef,
}

impl StoreClient {
    pub(crate) fn new(store: MsgStore, store_ref: StoreRef) -> Self {
        Self { store, store_ref }
    }

    pub fn store_ref(&self) -> StoreRef {
        self.store_ref
    }

    pub fn write(&self, guid: Guid, body: &Bytes) -> MsgStoreResult<()> {
        self.store.write(guid, body)
    }

    pub fn read(&self, guid: Guid) -> MsgStoreResult<Bytes> {
        self.store.read(guid)
    }

    pub fn contains(&self, guid: Guid) -> bool {
        self.store.contains(guid)
    }

    pub fn remove(&self, guids: &[Guid]) -> MsgStoreResult<()> {
        self.store.remove(guids)
    }

    pub fn release(&self, guids: &[Guid]) -> MsgStoreResult<()> {
        self.store.release(guids)
    }

    pub fn sync(&self, guids: &[Guid], callback: Box<dyn FnOnce() + Send>) -> MsgStoreResult<()> {
        self.store.sync(guids, callback)
    }

    /// Orderly close. The ref stays registered so the store's next marker
    /// covers it; only `delete` forgets it.
    pub fn terminate(self) {}

    /// Forget the ref entirely (queue deletion).
    pub fn delete(self) {
        self.store.delete_client(self.store_ref);
    }
}

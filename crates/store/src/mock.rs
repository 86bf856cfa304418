//! Deterministic store double that records every call.

use std::collections::BTreeMap;
use std::sync::Arc;

use kubetally_core::{Snapshot, Uid};
use parking_lot::Mutex;

use crate::MetadataStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Get(Uid),
    Set(Uid),
    Remove(Uid),
    List,
}

/// Ordered by uid so `list()` is stable across runs.
#[derive(Default)]
pub struct MockStore {
    items: Mutex<BTreeMap<Uid, Arc<Snapshot>>>,
    calls: Mutex<Vec<StoreCall>>,
}

impl MockStore {
    pub fn new() -> Self { Self::default() }

    /// Pre-populate without recording a call.
    pub fn seed(&self, snapshot: Snapshot) {
        self.items.lock().insert(snapshot.id.uid, Arc::new(snapshot));
    }

    pub fn calls(&self) -> Vec<StoreCall> { self.calls.lock().clone() }

    pub fn writes(&self) -> usize {
        self.calls.lock().iter().filter(|c| matches!(c, StoreCall::Set(_) | StoreCall::Remove(_))).count()
    }
}

impl MetadataStore for MockStore {
    fn get(&self, uid: &Uid) -> Option<Arc<Snapshot>> {
        self.calls.lock().push(StoreCall::Get(*uid));
        self.items.lock().get(uid).cloned()
    }

    fn set(&self, snapshot: Arc<Snapshot>) {
        self.calls.lock().push(StoreCall::Set(snapshot.id.uid));
        self.items.lock().insert(snapshot.id.uid, snapshot);
    }

    fn remove(&self, uid: &Uid) -> Option<Arc<Snapshot>> {
        self.calls.lock().push(StoreCall::Remove(*uid));
        self.items.lock().remove(uid)
    }

    fn list(&self) -> Vec<Arc<Snapshot>> {
        self.calls.lock().push(StoreCall::List);
        self.items.lock().values().cloned().collect()
    }

    fn len(&self) -> usize { self.items.lock().len() }
}

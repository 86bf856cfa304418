//! kubetally store: per-kind correlation cache of last-known snapshots.
//!
//! The collector only sees [`MetadataStore`]; [`InMemoryStore`] is the default and
//! [`MockStore`] is a deterministic double for tests.

#![forbid(unsafe_code)]

use std::sync::Arc;

use kubetally_core::{Snapshot, Uid};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

mod mock;

pub use mock::{MockStore, StoreCall};

/// Key-value cache over resource identity. Writes are last-write-wins by uid.
pub trait MetadataStore: Send + Sync {
    fn get(&self, uid: &Uid) -> Option<Arc<Snapshot>>;
    fn set(&self, snapshot: Arc<Snapshot>);
    fn remove(&self, uid: &Uid) -> Option<Arc<Snapshot>>;
    fn list(&self) -> Vec<Arc<Snapshot>>;

    fn len(&self) -> usize { self.list().len() }
    fn is_empty(&self) -> bool { self.len() == 0 }
}

/// Default store: an `FxHashMap` behind a read-write lock.
#[derive(Default)]
pub struct InMemoryStore {
    map: RwLock<FxHashMap<Uid, Arc<Snapshot>>>,
}

impl InMemoryStore {
    pub fn new() -> Self { Self::default() }
}

impl MetadataStore for InMemoryStore {
    fn get(&self, uid: &Uid) -> Option<Arc<Snapshot>> {
        self.map.read().get(uid).cloned()
    }

    fn set(&self, snapshot: Arc<Snapshot>) {
        self.map.write().insert(snapshot.id.uid, snapshot);
    }

    fn remove(&self, uid: &Uid) -> Option<Arc<Snapshot>> {
        self.map.write().remove(uid)
    }

    fn list(&self) -> Vec<Arc<Snapshot>> {
        self.map.read().values().cloned().collect()
    }

    fn len(&self) -> usize { self.map.read().len() }
}

//! In-process fake cluster: a [`ClusterClient`] whose objects are edited directly.
//!
//! Every subscription first receives a `Restarted` list of the current objects and
//! then live `Applied`/`Deleted` events, like a real list+watch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use kubetally_core::{ClusterClient, ResourceKind, Snapshot, Uid, WatchError, WatchEvent, WatchStream};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;

use crate::{ApiAuth, ClientFactory};

type Item = Result<WatchEvent, WatchError>;

#[derive(Default)]
struct State {
    objects: FxHashMap<ResourceKind, BTreeMap<Uid, Snapshot>>,
    subscribers: FxHashMap<ResourceKind, Vec<mpsc::UnboundedSender<Item>>>,
    unsupported: FxHashSet<ResourceKind>,
    initial_list_delay: Duration,
    watch_calls: usize,
}

#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
}

impl FakeCluster {
    pub fn new() -> Self { Self::default() }

    /// Delay every subscription's first item (the initial list) by `delay`.
    pub fn with_initial_list_delay(self, delay: Duration) -> Self {
        self.state.lock().initial_list_delay = delay;
        self
    }

    /// Make `watch(kind)` fail at subscription setup.
    pub fn with_unsupported(self, kind: ResourceKind) -> Self {
        self.state.lock().unsupported.insert(kind);
        self
    }

    /// Create or replace an object and notify subscribers.
    pub fn apply(&self, snapshot: Snapshot) {
        let mut st = self.state.lock();
        st.objects.entry(snapshot.kind).or_default().insert(snapshot.id.uid, snapshot.clone());
        broadcast(&mut st, snapshot.kind, Ok(WatchEvent::Applied(snapshot)));
    }

    pub fn delete(&self, kind: ResourceKind, uid: &Uid) -> Option<Snapshot> {
        let mut st = self.state.lock();
        let removed = st.objects.get_mut(&kind).and_then(|m| m.remove(uid))?;
        broadcast(&mut st, kind, Ok(WatchEvent::Deleted(removed.clone())));
        Some(removed)
    }

    /// Push a transient stream error to the kind's subscribers.
    pub fn inject_error(&self, kind: ResourceKind, message: &str) {
        let mut st = self.state.lock();
        broadcast(&mut st, kind, Err(WatchError::Stream(message.to_string())));
    }

    /// End every open stream of `kind`, as a dropped connection would.
    pub fn disconnect(&self, kind: ResourceKind) {
        self.state.lock().subscribers.remove(&kind);
    }

    pub fn list(&self, kind: ResourceKind) -> Vec<Snapshot> {
        self.state.lock().objects.get(&kind).map(|m| m.values().cloned().collect()).unwrap_or_default()
    }

    /// Open subscriptions of `kind` whose receiving side is still alive.
    pub fn subscribers(&self, kind: ResourceKind) -> usize {
        let mut st = self.state.lock();
        match st.subscribers.get_mut(&kind) {
            Some(subs) => {
                subs.retain(|tx| !tx.is_closed());
                subs.len()
            }
            None => 0,
        }
    }

    pub fn watch_calls(&self) -> usize { self.state.lock().watch_calls }
}

fn broadcast(st: &mut State, kind: ResourceKind, item: Item) {
    if let Some(subs) = st.subscribers.get_mut(&kind) {
        subs.retain(|tx| tx.send(item.clone()).is_ok());
    }
}

impl ClusterClient for FakeCluster {
    fn watch(&self, kind: ResourceKind) -> Result<WatchStream, WatchError> {
        let mut st = self.state.lock();
        st.watch_calls += 1;
        if st.unsupported.contains(&kind) {
            return Err(WatchError::Unsupported(kind));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let list = st.objects.get(&kind).map(|m| m.values().cloned().collect()).unwrap_or_default();
        // list is queued before the sender is registered, so no live event can overtake it
        let _ = tx.send(Ok(WatchEvent::Restarted(list)));
        st.subscribers.entry(kind).or_default().push(tx);
        let delay = st.initial_list_delay;
        drop(st);

        Ok(futures::stream::unfold((rx, delay), |(mut rx, delay)| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            rx.recv().await.map(|item| (item, (rx, Duration::ZERO)))
        })
        .boxed())
    }
}

#[async_trait::async_trait]
impl ClientFactory for FakeCluster {
    async fn make_client(&self, _auth: ApiAuth) -> Result<Arc<dyn ClusterClient>> {
        Ok(Arc::new(self.clone()))
    }
}

//! kubetally collector: turns resource events into metric records and metadata deltas.
//!
//! Owns one [`MetadataStore`] per watched kind. Every event reads and writes the
//! store of its kind so later lookups (including other kinds' correlation) see
//! the latest snapshot.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use kubetally_core::{
    EventType, Metadata, MetadataDelta, MetricRecord, ResourceEvent, ResourceKind, ResourceStatus, Snapshot, Uid,
    WatchedKind,
};
use kubetally_store::{InMemoryStore, MetadataStore};
use metrics::{gauge, histogram};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

mod derive;

pub use derive::{
    condition_value, node_condition_metric, pod_phase_value, DEPLOYMENT_AVAILABLE, DEPLOYMENT_DESIRED,
    NAMESPACE_PHASE, NODE_CONDITION_PREFIX, POD_PHASE, POD_RESTARTS,
};

/// Output of one [`DataCollector::transform`] call.
#[derive(Debug, Default, Clone)]
pub struct Transformed {
    pub records: Vec<MetricRecord>,
    pub delta: Option<MetadataDelta>,
}

pub struct DataCollector {
    stores: FxHashMap<ResourceKind, Arc<dyn MetadataStore>>,
    node_conditions: Vec<String>,
    /// Node name to uid, kept in step with the node store for pod correlation.
    node_index: RwLock<FxHashMap<String, Uid>>,
}

impl DataCollector {
    /// One in-memory store per kind in `kinds`.
    pub fn new(kinds: &[WatchedKind]) -> Self {
        let mut stores: FxHashMap<ResourceKind, Arc<dyn MetadataStore>> = FxHashMap::default();
        let mut node_conditions = Vec::new();
        for wk in kinds {
            stores.insert(wk.kind(), Arc::new(InMemoryStore::new()));
            if let WatchedKind::Nodes { conditions_to_report } = wk {
                node_conditions = conditions_to_report.clone();
            }
        }
        Self { stores, node_conditions, node_index: RwLock::new(FxHashMap::default()) }
    }

    /// Replace the store of a watched kind. Kinds that are not watched are ignored.
    pub fn with_store(mut self, kind: ResourceKind, store: Arc<dyn MetadataStore>) -> Self {
        match self.stores.get_mut(&kind) {
            Some(slot) => {
                if kind == ResourceKind::Node {
                    *self.node_index.get_mut() = store.list().iter().map(|n| (n.id.name.clone(), n.id.uid)).collect();
                }
                *slot = store
            }
            None => debug!(kind = %kind, "store override for unwatched kind ignored"),
        }
        self
    }

    pub fn store(&self, kind: ResourceKind) -> Option<&Arc<dyn MetadataStore>> {
        self.stores.get(&kind)
    }

    pub fn kinds(&self) -> Vec<ResourceKind> {
        let mut v: Vec<_> = self.stores.keys().copied().collect();
        v.sort_unstable();
        v
    }

    pub fn node_conditions(&self) -> &[String] { &self.node_conditions }

    pub fn transform(&self, event: &ResourceEvent) -> Transformed {
        let started = Instant::now();
        let Some(store) = self.stores.get(&event.kind) else {
            warn!(kind = %event.kind, resource = %event.current.id, "event for unwatched kind dropped");
            return Transformed::default();
        };
        let current = &event.current;
        if event.kind == ResourceKind::Node {
            self.index_node(event);
        }
        let out = match event.event_type {
            EventType::Added => {
                store.set(Arc::clone(current));
                Transformed {
                    records: self.metrics_for(current, event.observed_at),
                    delta: Some(delta(current, EventType::Added, None, current.metadata.clone())),
                }
            }
            EventType::Updated => {
                let previous = event.previous.clone().or_else(|| store.get(current.uid()));
                store.set(Arc::clone(current));
                match previous {
                    Some(prev) if prev.same_state(current) => {
                        debug!(kind = %event.kind, resource = %current.id, "no-op update");
                        Transformed::default()
                    }
                    prev => {
                        let before = prev.map(|p| p.metadata.clone());
                        let changed = before.as_ref() != Some(&current.metadata);
                        let delta = changed.then(|| delta(current, EventType::Updated, before, current.metadata.clone()));
                        Transformed { records: self.metrics_for(current, event.observed_at), delta }
                    }
                }
            }
            EventType::Deleted => {
                let removed = store.remove(current.uid());
                let last = event.previous.clone().or(removed).unwrap_or_else(|| Arc::clone(current));
                Transformed {
                    records: Vec::new(),
                    delta: Some(delta(current, EventType::Deleted, Some(last.metadata.clone()), Metadata::default())),
                }
            }
        };
        gauge!("kubetally_store_objects", store.len() as f64, "kind" => event.kind.as_str());
        histogram!("kubetally_transform_ms", started.elapsed().as_secs_f64() * 1000.0, "kind" => event.kind.as_str());
        out
    }

    /// Records for one snapshot, stamped with `ts`.
    pub fn metrics_for(&self, snap: &Snapshot, ts: DateTime<Utc>) -> Vec<MetricRecord> {
        let corr = self.correlate(snap);
        derive::records(snap, &self.node_conditions, &corr, ts)
    }

    /// Records for every resource currently held by the stores.
    pub fn collect_live(&self, now: DateTime<Utc>) -> Vec<MetricRecord> {
        let mut out = Vec::new();
        for kind in self.kinds() {
            if let Some(store) = self.stores.get(&kind) {
                for snap in store.list() {
                    out.extend(self.metrics_for(&snap, now));
                }
            }
        }
        out
    }

    fn index_node(&self, event: &ResourceEvent) {
        let id = &event.current.id;
        let mut index = self.node_index.write();
        match event.event_type {
            EventType::Added | EventType::Updated => {
                index.insert(id.name.clone(), id.uid);
            }
            EventType::Deleted => {
                if index.get(&id.name) == Some(&id.uid) {
                    index.remove(&id.name);
                }
            }
        }
    }

    fn correlate(&self, snap: &Snapshot) -> derive::Correlation {
        let mut corr = derive::Correlation::default();
        if let ResourceStatus::Pod { node_name: Some(node), .. } = &snap.status {
            if self.stores.contains_key(&ResourceKind::Node) {
                corr.node_uid = self.node_index.read().get(node).copied();
            }
        }
        corr
    }
}

fn delta(snap: &Snapshot, event_type: EventType, before: Option<Metadata>, after: Metadata) -> MetadataDelta {
    MetadataDelta { resource: snap.id.clone(), kind: snap.kind, event_type, before, after }
}

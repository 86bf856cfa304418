//! kubetally core types: resource snapshots, events, metric records and metadata deltas.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use smallvec::SmallVec;

pub mod capability;
pub mod kind;
pub mod sync;

pub use capability::{
    ClusterClient, Host, MetadataConsumer, MetadataSinkBinding, MetricsConsumer, Sink, WatchError, WatchEvent,
    WatchStream,
};
pub use kind::{ResourceKind, UnknownKind, WatchedKind, DEFAULT_NODE_CONDITIONS};
pub use sync::SyncState;

pub type Uid = [u8; 16];

/// Parse a `metadata.uid` string into a [`Uid`].
pub fn parse_uid(s: &str) -> Result<Uid, uuid::Error> {
    Ok(*uuid::Uuid::parse_str(s)?.as_bytes())
}

/// Canonical hyphenated text form of a [`Uid`].
pub fn format_uid(uid: &Uid) -> String {
    uuid::Uuid::from_bytes(*uid).to_string()
}

fn serialize_uid<S: Serializer>(uid: &Uid, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(&uuid::Uuid::from_bytes(*uid))
}

/// Identity of one cluster object.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, Hash)]
pub struct ResourceId {
    pub namespace: Option<String>,
    pub name: String,
    #[serde(serialize_with = "serialize_uid")]
    pub uid: Uid,
}

impl ResourceId {
    pub fn new(namespace: Option<&str>, name: &str, uid: Uid) -> Self {
        Self { namespace: namespace.map(str::to_string), name: name.to_string(), uid }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Labels and annotations. Ordered maps make equality order-independent.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Metadata {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl Metadata {
    pub fn is_empty(&self) -> bool { self.labels.is_empty() && self.annotations.is_empty() }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    #[default]
    Unknown,
}

impl PodPhase {
    pub fn parse(s: &str) -> Self {
        match s {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "True" => Self::True,
            "False" => Self::False,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
pub enum NamespacePhase {
    #[default]
    Active,
    Terminating,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NodeCondition {
    pub kind: String,
    pub status: ConditionStatus,
}

/// Kind-specific status fields captured from the object.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub enum ResourceStatus {
    Pod { phase: PodPhase, node_name: Option<String>, restarts: u32 },
    Node { conditions: Vec<NodeCondition> },
    Namespace { phase: NamespacePhase },
    Deployment { desired: i32, available: i32 },
}

/// Immutable capture of one object's state.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Snapshot {
    pub kind: ResourceKind,
    pub id: ResourceId,
    /// Bookkeeping only; ignored by [`Snapshot::same_state`].
    pub resource_version: Option<String>,
    pub metadata: Metadata,
    pub status: ResourceStatus,
}

impl Snapshot {
    /// True when metadata and status match, regardless of resource version.
    pub fn same_state(&self, other: &Snapshot) -> bool {
        self.kind == other.kind && self.metadata == other.metadata && self.status == other.status
    }

    pub fn uid(&self) -> &Uid { &self.id.uid }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
pub enum EventType {
    Added,
    Updated,
    Deleted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

/// One add/update/delete observed on a kind's change stream.
#[derive(Debug, Clone)]
pub struct ResourceEvent {
    pub kind: ResourceKind,
    pub event_type: EventType,
    pub previous: Option<Arc<Snapshot>>,
    pub current: Arc<Snapshot>,
    pub observed_at: DateTime<Utc>,
}

impl ResourceEvent {
    pub fn added(current: Arc<Snapshot>, observed_at: DateTime<Utc>) -> Self {
        Self { kind: current.kind, event_type: EventType::Added, previous: None, current, observed_at }
    }

    pub fn updated(previous: Arc<Snapshot>, current: Arc<Snapshot>, observed_at: DateTime<Utc>) -> Self {
        Self { kind: current.kind, event_type: EventType::Updated, previous: Some(previous), current, observed_at }
    }

    pub fn deleted(current: Arc<Snapshot>, observed_at: DateTime<Utc>) -> Self {
        Self { kind: current.kind, event_type: EventType::Deleted, previous: None, current, observed_at }
    }
}

/// Attribute list of a metric record: `(key, value)`.
pub type Attributes = SmallVec<[(&'static str, String); 6]>;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricRecord {
    pub resource: ResourceId,
    pub kind: ResourceKind,
    pub name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub attributes: Attributes,
}

impl MetricRecord {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.iter().find(|(k, _)| *k == key).map(|(_, v)| v.as_str())
    }
}

/// Before/after metadata for one resource; emitted only on material change.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetadataDelta {
    pub resource: ResourceId,
    pub kind: ResourceKind,
    pub event_type: EventType,
    pub before: Option<Metadata>,
    pub after: Metadata,
}

pub mod prelude {
    pub use super::{
        EventType, Metadata, MetadataDelta, MetricRecord, ResourceEvent, ResourceId, ResourceKind, ResourceStatus,
        Snapshot, Uid, WatchedKind,
    };
}

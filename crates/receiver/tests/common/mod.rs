#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kubetally_core::{
    ConditionStatus, EventType, Metadata, MetadataConsumer, MetadataDelta, MetricRecord, MetricsConsumer,
    NodeCondition, PodPhase, ResourceId, ResourceKind, ResourceStatus, Sink, Snapshot, Uid,
};
use kubetally_receiver::ReceiverConfig;
use parking_lot::Mutex;

pub fn uid(n: u32) -> Uid {
    let mut u = [0u8; 16];
    u[..4].copy_from_slice(&n.to_be_bytes());
    u[15] = 1;
    u
}

pub fn pod(n: u32, labels: &[(&str, &str)]) -> Snapshot {
    Snapshot {
        kind: ResourceKind::Pod,
        id: ResourceId::new(Some("default"), &format!("pod-{}", n), uid(n)),
        resource_version: Some("1".into()),
        metadata: Metadata {
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            annotations: Default::default(),
        },
        status: ResourceStatus::Pod { phase: PodPhase::Running, node_name: Some("node-a".into()), restarts: 0 },
    }
}

pub fn node(n: u32, name: &str) -> Snapshot {
    Snapshot {
        kind: ResourceKind::Node,
        id: ResourceId::new(None, name, uid(n)),
        resource_version: Some("1".into()),
        metadata: Metadata::default(),
        status: ResourceStatus::Node {
            conditions: vec![NodeCondition { kind: "Ready".into(), status: ConditionStatus::True }],
        },
    }
}

/// Config watching `kinds`, inventory ticker off, short sync timeout.
pub fn config(kinds: &[&str]) -> ReceiverConfig {
    ReceiverConfig {
        collection_interval: Duration::ZERO,
        watched_kinds: kinds.iter().map(|k| k.to_string()).collect(),
        initial_sync_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

/// Metrics consumer keeping every batch it was handed.
#[derive(Default)]
pub struct RecordingConsumer {
    batches: Mutex<Vec<Vec<MetricRecord>>>,
    fail: AtomicBool,
    delay: Option<Duration>,
}

impl RecordingConsumer {
    /// Sleeps `delay` before recording each batch.
    pub fn slow(delay: Duration) -> Self { Self { delay: Some(delay), ..Self::default() } }

    pub fn failing() -> Self {
        let c = Self::default();
        c.fail.store(true, Ordering::Relaxed);
        c
    }

    pub fn batches(&self) -> usize { self.batches.lock().len() }

    pub fn records(&self) -> Vec<MetricRecord> { self.batches.lock().iter().flatten().cloned().collect() }

    /// Distinct identities of `kind` seen in any batch.
    pub fn identities(&self, kind: ResourceKind) -> BTreeSet<Uid> {
        self.batches.lock().iter().flatten().filter(|r| r.kind == kind).map(|r| r.resource.uid).collect()
    }

    pub fn clear(&self) { self.batches.lock().clear() }
}

#[async_trait::async_trait]
impl MetricsConsumer for RecordingConsumer {
    async fn consume_metrics(&self, batch: Vec<MetricRecord>) -> anyhow::Result<()> {
        assert!(!batch.is_empty(), "empty batches are never pushed");
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.batches.lock().push(batch);
        if self.fail.load(Ordering::Relaxed) {
            anyhow::bail!("downstream unavailable");
        }
        Ok(())
    }
}

/// Sink with metadata capability.
#[derive(Default)]
pub struct RecordingMetadataSink {
    deltas: Mutex<Vec<MetadataDelta>>,
}

impl RecordingMetadataSink {
    pub fn deltas(&self) -> Vec<MetadataDelta> { self.deltas.lock().clone() }

    pub fn count(&self, event_type: EventType) -> usize {
        self.deltas.lock().iter().filter(|d| d.event_type == event_type).count()
    }
}

impl Sink for RecordingMetadataSink {
    fn type_name(&self) -> &str { "recording_metadata" }

    fn metadata_consumer(self: Arc<Self>) -> Option<Arc<dyn MetadataConsumer>> { Some(self) }
}

#[async_trait::async_trait]
impl MetadataConsumer for RecordingMetadataSink {
    async fn consume_metadata(&self, delta: &MetadataDelta) -> anyhow::Result<()> {
        self.deltas.lock().push(delta.clone());
        Ok(())
    }
}

/// Metadata sink whose every call fails.
#[derive(Default)]
pub struct FailingMetadataSink {
    calls: Mutex<usize>,
}

impl FailingMetadataSink {
    pub fn calls(&self) -> usize { *self.calls.lock() }
}

impl Sink for FailingMetadataSink {
    fn type_name(&self) -> &str { "failing_metadata" }

    fn metadata_consumer(self: Arc<Self>) -> Option<Arc<dyn MetadataConsumer>> { Some(self) }
}

#[async_trait::async_trait]
impl MetadataConsumer for FailingMetadataSink {
    async fn consume_metadata(&self, _delta: &MetadataDelta) -> anyhow::Result<()> {
        *self.calls.lock() += 1;
        anyhow::bail!("metadata backend rejected delta")
    }
}

/// Metrics consumer that panics on every batch.
pub struct PanickingConsumer;

#[async_trait::async_trait]
impl MetricsConsumer for PanickingConsumer {
    async fn consume_metrics(&self, _batch: Vec<MetricRecord>) -> anyhow::Result<()> {
        panic!("consumer crashed")
    }
}

/// Sink without metadata capability.
pub struct MetricsOnlySink;

impl Sink for MetricsOnlySink {
    fn type_name(&self) -> &str { "metrics_only" }
}

/// Poll `cond` until it holds; panics after five seconds.
pub async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

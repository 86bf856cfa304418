#![forbid(unsafe_code)]

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use kubetally_core::{EventType, ResourceKind};
use kubetally_kubehub::FakeCluster;
use kubetally_receiver::{Receiver, ReceiverConfig, ReceiverError, ReceiverState, SinkRegistry, WatcherError};
use kubetally_store::{MetadataStore, MockStore, StoreCall};

fn receiver(fake: &FakeCluster, cfg: ReceiverConfig, consumer: &Arc<RecordingConsumer>) -> Receiver {
    Receiver::new(cfg, Arc::new(fake.clone()), consumer.clone())
}

fn registry_with(name: &str, sink: &Arc<RecordingMetadataSink>) -> SinkRegistry {
    let mut reg = SinkRegistry::new();
    reg.register(name, sink.clone());
    reg
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_pods_and_a_node_then_one_pod_deleted() {
    let fake = FakeCluster::new();
    fake.apply(pod(1, &[("app", "web")]));
    fake.apply(pod(2, &[("app", "web")]));
    fake.apply(node(10, "node-a"));

    let consumer = Arc::new(RecordingConsumer::default());
    let sink = Arc::new(RecordingMetadataSink::default());
    let cfg = ReceiverConfig { metadata_exporters: vec!["meta".into()], ..config(&["pods", "nodes"]) };
    let mut rx = receiver(&fake, cfg, &consumer);
    rx.start(&registry_with("meta", &sink)).await.unwrap();
    assert_eq!(rx.state(), ReceiverState::Running);

    let watcher = rx.watcher().unwrap().clone();
    eventually("initial sync", || watcher.is_synced()).await;
    eventually("three metric-bearing events", || consumer.batches() == 3).await;
    assert_eq!(consumer.identities(ResourceKind::Pod).len(), 2);
    assert_eq!(consumer.identities(ResourceKind::Node).len(), 1);
    assert_eq!(sink.count(EventType::Added), 3);
    assert!(!watcher.initial_sync_timed_out());

    fake.delete(ResourceKind::Pod, &uid(1));
    eventually("delete delta", || sink.count(EventType::Deleted) == 1).await;
    let gone = sink.deltas().into_iter().find(|d| d.event_type == EventType::Deleted).unwrap();
    assert_eq!(gone.resource.uid, uid(1));
    assert_eq!(gone.before.unwrap().labels.get("app").map(String::as_str), Some("web"));
    assert!(gone.after.is_empty());

    consumer.clear();
    watcher.report_inventory().await;
    assert_eq!(consumer.identities(ResourceKind::Pod).into_iter().collect::<Vec<_>>(), vec![uid(2)]);
    assert_eq!(consumer.identities(ResourceKind::Node).len(), 1);

    rx.shutdown().await;
    assert_eq!(rx.state(), ReceiverState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn thousand_pods_are_all_reported() {
    let fake = FakeCluster::new();
    for n in 0..1000 {
        fake.apply(pod(n, &[]));
    }
    let consumer = Arc::new(RecordingConsumer::default());
    let mut rx = receiver(&fake, config(&["pods"]), &consumer);
    rx.start(&SinkRegistry::new()).await.unwrap();
    let watcher = rx.watcher().unwrap().clone();

    eventually("sync", || watcher.is_synced()).await;
    assert_eq!(consumer.identities(ResourceKind::Pod).len(), 1000);
    assert_eq!(watcher.collector().store(ResourceKind::Pod).unwrap().len(), 1000);
    rx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_initial_list_times_out_but_keeps_processing() {
    let fake = FakeCluster::new().with_initial_list_delay(Duration::from_millis(200));
    fake.apply(pod(1, &[]));
    let consumer = Arc::new(RecordingConsumer::default());
    let cfg = ReceiverConfig { initial_sync_timeout: Duration::from_millis(1), ..config(&["pods"]) };
    let mut rx = receiver(&fake, cfg, &consumer);
    rx.start(&SinkRegistry::new()).await.unwrap();
    let watcher = rx.watcher().unwrap().clone();

    eventually("timeout flag", || watcher.initial_sync_timed_out()).await;
    eventually("late sync", || watcher.is_synced()).await;
    let state = watcher.sync_state(ResourceKind::Pod).unwrap();
    assert!(state.initial_sync_timed_out());
    assert!(state.initial_sync_complete());

    fake.apply(pod(2, &[]));
    eventually("event after timeout", || consumer.identities(ResourceKind::Pod).len() == 2).await;
    assert!(watcher.initial_sync_timed_out());
    rx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn metadata_deltas_follow_label_changes_only() {
    let fake = FakeCluster::new();
    let consumer = Arc::new(RecordingConsumer::default());
    let sink = Arc::new(RecordingMetadataSink::default());
    let cfg = ReceiverConfig { metadata_exporters: vec!["meta".into()], ..config(&["pods"]) };
    let mut rx = receiver(&fake, cfg, &consumer);
    rx.start(&registry_with("meta", &sink)).await.unwrap();
    let watcher = rx.watcher().unwrap().clone();
    eventually("sync", || watcher.is_synced()).await;

    fake.apply(pod(1, &[("app", "web")]));
    eventually("add delta", || sink.count(EventType::Added) == 1).await;

    // same content again, then a label change; events of a kind are ordered
    fake.apply(pod(1, &[("app", "web")]));
    fake.apply(pod(1, &[("app", "api")]));
    eventually("update delta", || sink.count(EventType::Updated) == 1).await;
    assert_eq!(sink.deltas().len(), 2);
    let upd = &sink.deltas()[1];
    assert_eq!(upd.before.as_ref().unwrap().labels.get("app").map(String::as_str), Some("web"));
    assert_eq!(upd.after.labels.get("app").map(String::as_str), Some("api"));

    // direct handler calls go through the same rule
    let current = Arc::new(pod(1, &[("app", "api")]));
    watcher.on_update(current.clone(), current.clone()).await;
    assert_eq!(sink.deltas().len(), 2);
    watcher.on_delete(current).await;
    assert_eq!(sink.count(EventType::Deleted), 1);
    rx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_sink_fails_start_without_subscribing() {
    let fake = FakeCluster::new();
    let consumer = Arc::new(RecordingConsumer::default());
    let cfg = ReceiverConfig { metadata_exporters: vec!["nope".into()], ..config(&["pods"]) };
    let mut rx = receiver(&fake, cfg, &consumer);

    let err = rx.start(&SinkRegistry::new()).await.unwrap_err();
    assert!(matches!(err, ReceiverError::MissingSink { ref name } if name == "nope"), "{:?}", err);
    assert_eq!(rx.state(), ReceiverState::Stopped);
    assert_eq!(fake.watch_calls(), 0);
    assert_eq!(fake.subscribers(ResourceKind::Pod), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sink_without_metadata_capability_is_a_type_error() {
    let fake = FakeCluster::new();
    let consumer = Arc::new(RecordingConsumer::default());
    let cfg = ReceiverConfig { metadata_exporters: vec!["metrics".into()], ..config(&["pods"]) };
    let mut reg = SinkRegistry::new();
    reg.register("metrics", Arc::new(MetricsOnlySink));
    let mut rx = receiver(&fake, cfg, &consumer);

    match rx.start(&reg).await {
        Err(ReceiverError::SinkType { name, actual }) => {
            assert_eq!(name, "metrics");
            assert_eq!(actual, "metrics_only");
        }
        other => panic!("expected type error, got {:?}", other.err()),
    }
    assert_eq!(fake.watch_calls(), 0);
    assert!(rx.watcher().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_subscription_starts_nothing() {
    let fake = FakeCluster::new().with_unsupported(ResourceKind::Node);
    let consumer = Arc::new(RecordingConsumer::default());
    let mut rx = receiver(&fake, config(&["pods", "nodes"]), &consumer);

    let err = rx.start(&SinkRegistry::new()).await.unwrap_err();
    assert!(
        matches!(err, ReceiverError::Watcher(WatcherError::Subscribe { kind: ResourceKind::Node, .. })),
        "{:?}",
        err
    );
    assert_eq!(rx.state(), ReceiverState::Stopped);
    assert_eq!(fake.subscribers(ResourceKind::Pod), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_config_is_rejected_before_client_creation() {
    let fake = FakeCluster::new();
    let consumer = Arc::new(RecordingConsumer::default());
    let mut rx = receiver(&fake, config(&["pods", "gadgets"]), &consumer);
    assert!(matches!(rx.start(&SinkRegistry::new()).await, Err(ReceiverError::Config(_))));
    assert_eq!(fake.watch_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lifecycle_and_restart_after_shutdown() {
    let fake = FakeCluster::new();
    fake.apply(pod(1, &[]));
    let consumer = Arc::new(RecordingConsumer::default());
    let mut rx = receiver(&fake, config(&["pods"]), &consumer);
    assert_eq!(rx.state(), ReceiverState::Created);

    // shutdown before start does nothing
    rx.shutdown().await;
    assert_eq!(rx.state(), ReceiverState::Created);

    let reg = SinkRegistry::new();
    rx.start(&reg).await.unwrap();
    assert!(matches!(rx.start(&reg).await, Err(ReceiverError::InvalidState(ReceiverState::Running))));
    eventually("first run", || consumer.identities(ResourceKind::Pod).len() == 1).await;

    rx.shutdown().await;
    assert_eq!(rx.state(), ReceiverState::Stopped);
    assert_eq!(fake.subscribers(ResourceKind::Pod), 0);
    rx.shutdown().await;
    assert_eq!(rx.state(), ReceiverState::Stopped);

    consumer.clear();
    rx.start(&reg).await.unwrap();
    assert_eq!(rx.state(), ReceiverState::Running);
    eventually("second run relists", || consumer.identities(ResourceKind::Pod).len() == 1).await;
    assert_eq!(fake.subscribers(ResourceKind::Pod), 1);
    rx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_stream_is_resubscribed_and_reconciled() {
    let fake = FakeCluster::new();
    fake.apply(pod(1, &[]));
    fake.apply(pod(2, &[]));
    let consumer = Arc::new(RecordingConsumer::default());
    let sink = Arc::new(RecordingMetadataSink::default());
    let cfg = ReceiverConfig { metadata_exporters: vec!["meta".into()], ..config(&["pods"]) };
    let mut rx = receiver(&fake, cfg, &consumer);
    rx.start(&registry_with("meta", &sink)).await.unwrap();
    let watcher = rx.watcher().unwrap().clone();
    eventually("sync", || watcher.is_synced()).await;

    fake.inject_error(ResourceKind::Pod, "transient");
    fake.disconnect(ResourceKind::Pod);
    // missed while disconnected
    fake.delete(ResourceKind::Pod, &uid(2));
    fake.apply(pod(3, &[]));

    eventually("resubscribe", || fake.watch_calls() == 2).await;
    eventually("relist reconciled", || sink.count(EventType::Deleted) == 1 && sink.count(EventType::Added) == 3).await;
    let store = watcher.collector().store(ResourceKind::Pod).unwrap();
    assert!(store.get(&uid(1)).is_some());
    assert!(store.get(&uid(2)).is_none());
    assert!(store.get(&uid(3)).is_some());
    // pod 1 was relisted unchanged
    assert_eq!(sink.count(EventType::Updated), 0);
    rx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn consumer_errors_do_not_stop_processing() {
    let fake = FakeCluster::new();
    let consumer = Arc::new(RecordingConsumer::failing());
    let sink = Arc::new(RecordingMetadataSink::default());
    let cfg = ReceiverConfig { metadata_exporters: vec!["meta".into()], ..config(&["pods"]) };
    let mut rx = receiver(&fake, cfg, &consumer);
    rx.start(&registry_with("meta", &sink)).await.unwrap();

    fake.apply(pod(1, &[]));
    fake.apply(pod(2, &[]));
    eventually("both pods", || sink.count(EventType::Added) == 2).await;
    assert_eq!(consumer.identities(ResourceKind::Pod).len(), 2);
    rx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_metadata_sink_does_not_block_other_sinks() {
    let fake = FakeCluster::new();
    fake.apply(pod(1, &[("app", "web")]));
    let consumer = Arc::new(RecordingConsumer::default());
    let broken = Arc::new(FailingMetadataSink::default());
    let sink = Arc::new(RecordingMetadataSink::default());
    let mut reg = SinkRegistry::new();
    reg.register("broken", broken.clone()).register("meta", sink.clone());
    let cfg = ReceiverConfig { metadata_exporters: vec!["broken".into(), "meta".into()], ..config(&["pods"]) };
    let mut rx = receiver(&fake, cfg, &consumer);
    rx.start(&reg).await.unwrap();
    let watcher = rx.watcher().unwrap().clone();
    eventually("sync", || watcher.is_synced()).await;
    eventually("first delta", || sink.count(EventType::Added) == 1).await;

    fake.apply(pod(1, &[("app", "api")]));
    fake.apply(pod(2, &[]));
    fake.delete(ResourceKind::Pod, &uid(1));
    eventually("later deltas", || sink.count(EventType::Deleted) == 1).await;
    assert_eq!(sink.count(EventType::Added), 2);
    assert_eq!(sink.count(EventType::Updated), 1);
    // each delta tried once on the broken sink, never retried
    assert_eq!(broken.calls(), sink.deltas().len());
    assert_eq!(consumer.identities(ResourceKind::Pod).len(), 2);
    assert!(watcher.collector().store(ResourceKind::Pod).unwrap().get(&uid(1)).is_none());
    rx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_during_relist_stops_emitting() {
    let fake = FakeCluster::new();
    for n in 0..100 {
        fake.apply(pod(n, &[]));
    }
    let consumer = Arc::new(RecordingConsumer::slow(Duration::from_millis(20)));
    let mut rx = receiver(&fake, config(&["pods"]), &consumer);
    rx.start(&SinkRegistry::new()).await.unwrap();
    eventually("first batch", || consumer.batches() >= 1).await;

    let at_cancel = consumer.batches();
    let began = Instant::now();
    rx.shutdown().await;
    let took = began.elapsed();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let after = consumer.batches();

    assert!(after - at_cancel <= 1, "batches at cancel {}, after shutdown {}", at_cancel, after);
    assert!(after < 100);
    assert!(took < Duration::from_secs(1), "shutdown took {:?}", took);
    assert_eq!(rx.state(), ReceiverState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn live_inventory_ticks_while_running() {
    let fake = FakeCluster::new();
    fake.apply(pod(1, &[]));
    fake.apply(node(10, "node-a"));
    let consumer = Arc::new(RecordingConsumer::default());
    let cfg = ReceiverConfig { collection_interval: Duration::from_millis(50), ..config(&["pods", "nodes"]) };
    let mut rx = receiver(&fake, cfg, &consumer);
    rx.start(&SinkRegistry::new()).await.unwrap();

    // two event batches, then inventory batches covering both kinds at once
    eventually("inventory batch", || consumer.batches() >= 4).await;
    let records = consumer.records();
    let pod_records = records.iter().filter(|r| r.kind == ResourceKind::Pod).count();
    assert!(pod_records >= 4, "pod records from events and inventory: {}", pod_records);
    rx.shutdown().await;

    let after = consumer.batches();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(consumer.batches(), after);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_completes_after_tasks_panic() {
    let fake = FakeCluster::new();
    fake.apply(pod(1, &[]));
    let cfg = ReceiverConfig { collection_interval: Duration::from_millis(20), ..config(&["pods"]) };
    let mut rx = Receiver::new(cfg, Arc::new(fake.clone()), Arc::new(PanickingConsumer));
    rx.start(&SinkRegistry::new()).await.unwrap();
    let watcher = rx.watcher().unwrap().clone();
    eventually("pod stored", || watcher.collector().store(ResourceKind::Pod).unwrap().len() == 1).await;
    // let the ticker fire into the panicking consumer
    tokio::time::sleep(Duration::from_millis(100)).await;

    rx.shutdown().await;
    assert_eq!(rx.state(), ReceiverState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn injected_store_receives_writes() {
    let fake = FakeCluster::new();
    fake.apply(pod(7, &[]));
    let mock = Arc::new(MockStore::new());
    let consumer = Arc::new(RecordingConsumer::default());
    let mut rx = receiver(&fake, config(&["pods"]), &consumer).with_metadata_store(ResourceKind::Pod, mock.clone());
    rx.start(&SinkRegistry::new()).await.unwrap();

    eventually("store write", || mock.calls().contains(&StoreCall::Set(uid(7)))).await;
    fake.delete(ResourceKind::Pod, &uid(7));
    eventually("store remove", || mock.calls().contains(&StoreCall::Remove(uid(7)))).await;
    rx.shutdown().await;
}

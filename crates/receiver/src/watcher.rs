//! Resource Watcher: one change subscription per watched kind feeding the Data Collector.
//!
//! Each kind gets a subscription task (events of a kind are processed in stream
//! order) and a sync-wait task that flags the kind when its initial list does
//! not arrive within the configured timeout. Results go to the metrics consumer
//! and to every bound metadata sink.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::Utc;
use futures::StreamExt;
use kubetally_collector::{DataCollector, Transformed};
use kubetally_core::{
    ClusterClient, MetadataSinkBinding, MetricRecord, MetricsConsumer, ResourceEvent, ResourceKind, Snapshot,
    SyncState, Uid, WatchEvent, WatchStream,
};
use metrics::counter;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::WatcherError;

const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(500);

pub struct ResourceWatcher {
    inner: Arc<Inner>,
    kinds: Vec<ResourceKind>,
    initial_sync_timeout: Duration,
    started: AtomicBool,
    cancellation_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    client: Arc<dyn ClusterClient>,
    collector: DataCollector,
    consumer: Arc<dyn MetricsConsumer>,
    bindings: ArcSwap<Vec<MetadataSinkBinding>>,
    sync: FxHashMap<ResourceKind, Arc<SyncState>>,
    /// Shared with every task; once cancelled nothing more is emitted.
    cancellation_token: CancellationToken,
}

impl ResourceWatcher {
    /// Watches every kind the collector has a store for.
    pub fn new(
        client: Arc<dyn ClusterClient>,
        collector: DataCollector,
        consumer: Arc<dyn MetricsConsumer>,
        initial_sync_timeout: Duration,
    ) -> Self {
        let kinds = collector.kinds();
        let sync = kinds.iter().map(|k| (*k, Arc::new(SyncState::new()))).collect();
        let cancellation_token = CancellationToken::new();
        Self {
            inner: Arc::new(Inner {
                client,
                collector,
                consumer,
                bindings: ArcSwap::from_pointee(Vec::new()),
                sync,
                cancellation_token: cancellation_token.clone(),
            }),
            kinds,
            initial_sync_timeout,
            started: AtomicBool::new(false),
            cancellation_token,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Install the resolved metadata sinks. Takes effect for the next delta.
    pub fn set_metadata_sinks(&self, bindings: Vec<MetadataSinkBinding>) {
        self.inner.bindings.store(Arc::new(bindings));
    }

    pub fn metadata_sinks(&self) -> Vec<String> {
        self.inner.bindings.load().iter().map(|b| b.name.clone()).collect()
    }

    /// Open every subscription, then spawn the per-kind tasks. Does not wait for data.
    ///
    /// If any subscription cannot be opened nothing is spawned and the streams
    /// opened so far are dropped.
    pub fn start(&self) -> Result<(), WatcherError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(WatcherError::AlreadyStarted);
        }
        let mut streams = Vec::with_capacity(self.kinds.len());
        for &kind in &self.kinds {
            match self.inner.client.watch(kind) {
                Ok(stream) => streams.push((kind, stream)),
                Err(source) => {
                    self.started.store(false, Ordering::Release);
                    return Err(WatcherError::Subscribe { kind, source });
                }
            }
        }

        let mut tasks = self.tasks.lock();
        for (kind, stream) in streams {
            let (synced_tx, synced_rx) = watch::channel(false);
            let state = self.inner.sync_state(kind);
            tasks.push(tokio::spawn(subscribe(
                Arc::clone(&self.inner),
                kind,
                stream,
                synced_tx,
                self.cancellation_token.clone(),
            )));
            tasks.push(tokio::spawn(wait_for_sync(
                kind,
                state,
                synced_rx,
                self.initial_sync_timeout,
                self.cancellation_token.clone(),
            )));
        }
        info!(kinds = ?self.kinds, timeout_ms = self.initial_sync_timeout.as_millis() as u64, "resource watcher started");
        Ok(())
    }

    pub async fn on_add(&self, snapshot: Arc<Snapshot>) {
        self.inner.dispatch(ResourceEvent::added(snapshot, Utc::now())).await
    }

    /// Called for every update, including ones with unchanged content.
    pub async fn on_update(&self, old: Arc<Snapshot>, new: Arc<Snapshot>) {
        self.inner.dispatch(ResourceEvent::updated(old, new, Utc::now())).await
    }

    pub async fn on_delete(&self, snapshot: Arc<Snapshot>) {
        self.inner.dispatch(ResourceEvent::deleted(snapshot, Utc::now())).await
    }

    /// Push the live inventory of every store to the consumer as one batch.
    pub async fn report_inventory(&self) -> usize {
        let records = self.inner.collector.collect_live(Utc::now());
        let n = records.len();
        if n > 0 {
            self.inner.push_metrics(None, records).await;
        }
        debug!(records = n, "live inventory reported");
        n
    }

    /// Cancel every task and wait for all of them. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.cancellation_token.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }
        for res in futures::future::join_all(tasks).await {
            if let Err(e) = res {
                warn!(error = %e, "watcher task ended abnormally");
            }
        }
        info!("resource watcher stopped");
    }

    pub fn kinds(&self) -> &[ResourceKind] { &self.kinds }

    pub fn collector(&self) -> &DataCollector { &self.inner.collector }

    pub fn sync_state(&self, kind: ResourceKind) -> Option<&SyncState> {
        self.inner.sync.get(&kind).map(|s| s.as_ref())
    }

    /// True once every kind received its initial list.
    pub fn is_synced(&self) -> bool {
        self.inner.sync.values().all(|s| s.initial_sync_complete())
    }

    /// True if any kind missed its initial sync deadline.
    pub fn initial_sync_timed_out(&self) -> bool {
        self.inner.sync.values().any(|s| s.initial_sync_timed_out())
    }
}

impl Inner {
    fn sync_state(&self, kind: ResourceKind) -> Arc<SyncState> {
        self.sync.get(&kind).cloned().unwrap_or_default()
    }

    fn cancelled(&self) -> bool { self.cancellation_token.is_cancelled() }

    async fn dispatch(&self, event: ResourceEvent) {
        if self.cancelled() {
            return;
        }
        let kind = event.kind;
        counter!("kubetally_events_total", 1, "kind" => kind.as_str(), "type" => event.event_type.as_str());
        let Transformed { records, delta } = self.collector.transform(&event);
        if !records.is_empty() {
            self.push_metrics(Some(&event), records).await;
        }
        if let Some(delta) = delta {
            let bindings = self.bindings.load_full();
            for binding in bindings.iter() {
                let res = tokio::select! {
                    biased;
                    () = self.cancellation_token.cancelled() => return,
                    res = binding.sink.consume_metadata(&delta) => res,
                };
                if let Err(e) = res {
                    warn!(sink = %binding.name, kind = %kind, resource = %delta.resource, error = %e, "metadata sink failed");
                    counter!("kubetally_sink_errors_total", 1, "sink" => binding.name.clone());
                }
            }
        }
    }

    async fn push_metrics(&self, event: Option<&ResourceEvent>, records: Vec<MetricRecord>) {
        let n = records.len();
        let res = tokio::select! {
            biased;
            () = self.cancellation_token.cancelled() => {
                debug!(records = n, "metrics batch dropped on shutdown");
                return;
            }
            res = self.consumer.consume_metrics(records) => res,
        };
        if let Err(e) = res {
            match event {
                Some(ev) => warn!(kind = %ev.kind, resource = %ev.current.id, records = n, error = %e, "metrics consumer failed"),
                None => warn!(records = n, error = %e, "metrics consumer failed on inventory batch"),
            }
            counter!("kubetally_consumer_errors_total", 1);
        }
    }

    /// Turn one stream item into add/update/delete events. `seen` holds the
    /// last snapshot of every identity this subscription has reported.
    async fn apply(&self, event: WatchEvent, seen: &mut FxHashMap<Uid, Arc<Snapshot>>) {
        let now = Utc::now();
        match event {
            WatchEvent::Applied(snap) => {
                let snap = Arc::new(snap);
                let ev = match seen.insert(*snap.uid(), Arc::clone(&snap)) {
                    Some(prev) => ResourceEvent::updated(prev, snap, now),
                    None => ResourceEvent::added(snap, now),
                };
                self.dispatch(ev).await;
            }
            WatchEvent::Deleted(snap) => {
                let snap = Arc::new(snap);
                seen.remove(snap.uid());
                self.dispatch(ResourceEvent::deleted(snap, now)).await;
            }
            WatchEvent::Restarted(list) => {
                let mut previous = std::mem::take(seen);
                for snap in list {
                    let snap = Arc::new(snap);
                    seen.insert(*snap.uid(), Arc::clone(&snap));
                    let ev = match previous.remove(snap.uid()) {
                        Some(prev) => ResourceEvent::updated(prev, snap, now),
                        None => ResourceEvent::added(snap, now),
                    };
                    if self.cancelled() {
                        return;
                    }
                    self.dispatch(ev).await;
                }
                for (_, gone) in previous {
                    if self.cancelled() {
                        return;
                    }
                    self.dispatch(ResourceEvent::deleted(gone, now)).await;
                }
            }
        }
    }
}

async fn subscribe(
    inner: Arc<Inner>,
    kind: ResourceKind,
    mut stream: WatchStream,
    synced_tx: watch::Sender<bool>,
    cancellation_token: CancellationToken,
) {
    let state = inner.sync_state(kind);
    let mut seen = FxHashMap::default();
    loop {
        let item = tokio::select! {
            () = cancellation_token.cancelled() => return,
            item = stream.next() => item,
        };
        match item {
            Some(Ok(event)) => {
                let relist = matches!(event, WatchEvent::Restarted(_));
                inner.apply(event, &mut seen).await;
                if cancellation_token.is_cancelled() {
                    return;
                }
                if relist && state.mark_complete() {
                    info!(kind = %kind, objects = seen.len(), "initial sync complete");
                    synced_tx.send_replace(true);
                }
            }
            Some(Err(e)) => {
                warn!(kind = %kind, error = %e, "watch error");
                counter!("kubetally_watch_errors_total", 1, "kind" => kind.as_str());
            }
            None => match resubscribe(&inner, kind, &cancellation_token).await {
                Some(next) => stream = next,
                None => return,
            },
        }
    }
}

/// Reopen a kind's stream after it ended. `None` once cancelled.
async fn resubscribe(inner: &Inner, kind: ResourceKind, cancellation_token: &CancellationToken) -> Option<WatchStream> {
    debug!(kind = %kind, "watch stream ended; resubscribing");
    loop {
        tokio::select! {
            () = cancellation_token.cancelled() => return None,
            () = tokio::time::sleep(RESUBSCRIBE_DELAY) => (),
        }
        match inner.client.watch(kind) {
            Ok(stream) => return Some(stream),
            Err(e) => {
                warn!(kind = %kind, error = %e, "resubscribe failed");
                counter!("kubetally_watch_errors_total", 1, "kind" => kind.as_str());
            }
        }
    }
}

async fn wait_for_sync(
    kind: ResourceKind,
    state: Arc<SyncState>,
    mut synced_rx: watch::Receiver<bool>,
    timeout: Duration,
    cancellation_token: CancellationToken,
) {
    tokio::select! {
        () = cancellation_token.cancelled() => (),
        res = tokio::time::timeout(timeout, async { synced_rx.wait_for(|done| *done).await.is_ok() }) => {
            if res.is_err() && state.mark_timed_out() {
                warn!(kind = %kind, timeout_ms = timeout.as_millis() as u64, "initial sync timed out; continuing");
                counter!("kubetally_sync_timeouts_total", 1, "kind" => kind.as_str());
            }
        }
    }
}

//! Receiver Orchestrator: lifecycle, sink binding and the live-inventory ticker.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kubetally_collector::DataCollector;
use kubetally_core::{Host, MetadataSinkBinding, MetricsConsumer, ResourceKind};
use kubetally_kubehub::ClientFactory;
use kubetally_store::MetadataStore;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ReceiverConfig;
use crate::error::{ReceiverError, ReceiverResult};
use crate::watcher::ResourceWatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Created,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

pub struct Receiver {
    config: ReceiverConfig,
    client_factory: Arc<dyn ClientFactory>,
    consumer: Arc<dyn MetricsConsumer>,
    store_overrides: Vec<(ResourceKind, Arc<dyn MetadataStore>)>,
    state: ReceiverState,
    watcher: Option<Arc<ResourceWatcher>>,
    ticker: Option<(CancellationToken, JoinHandle<()>)>,
}

impl Receiver {
    pub fn new(config: ReceiverConfig, client_factory: Arc<dyn ClientFactory>, consumer: Arc<dyn MetricsConsumer>) -> Self {
        Self {
            config,
            client_factory,
            consumer,
            store_overrides: Vec::new(),
            state: ReceiverState::Created,
            watcher: None,
            ticker: None,
        }
    }

    /// Use `store` for `kind` instead of a fresh in-memory store on every start.
    pub fn with_metadata_store(mut self, kind: ResourceKind, store: Arc<dyn MetadataStore>) -> Self {
        self.store_overrides.push((kind, store));
        self
    }

    /// Bring the receiver to `Running`. On any error it ends `Stopped` with nothing running.
    pub async fn start(&mut self, host: &dyn Host) -> ReceiverResult<()> {
        match self.state {
            ReceiverState::Created | ReceiverState::Stopped => {}
            other => return Err(ReceiverError::InvalidState(other)),
        }
        self.state = ReceiverState::Starting;
        match self.launch(host).await {
            Ok((watcher, ticker)) => {
                self.watcher = Some(watcher);
                self.ticker = ticker;
                self.state = ReceiverState::Running;
                info!(kinds = self.config.watched_kinds.len(), sinks = self.config.metadata_exporters.len(), "receiver running");
                Ok(())
            }
            Err(e) => {
                self.state = ReceiverState::Stopped;
                error!(error = %e, "receiver failed to start");
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        host: &dyn Host,
    ) -> ReceiverResult<(Arc<ResourceWatcher>, Option<(CancellationToken, JoinHandle<()>)>)> {
        let kinds = self.config.validate()?;
        let client = self
            .client_factory
            .make_client(self.config.auth_type)
            .await
            .map_err(|e| ReceiverError::Client(format!("{:#}", e)))?;

        let collector = self
            .store_overrides
            .iter()
            .fold(DataCollector::new(&kinds), |c, (kind, store)| c.with_store(*kind, Arc::clone(store)));
        let watcher = Arc::new(ResourceWatcher::new(
            client,
            collector,
            Arc::clone(&self.consumer),
            self.config.initial_sync_timeout,
        ));
        watcher.set_metadata_sinks(resolve_bindings(&self.config.metadata_exporters, host)?);
        watcher.start()?;

        let period = self.config.collection_interval;
        let ticker = (!period.is_zero()).then(|| {
            let token = CancellationToken::new();
            let handle = tokio::spawn(report_inventory(Arc::clone(&watcher), period, token.clone()));
            (token, handle)
        });
        Ok((watcher, ticker))
    }

    /// Stop the ticker then the watcher, waiting for both. No-op unless `Running`.
    pub async fn shutdown(&mut self) {
        if self.state != ReceiverState::Running {
            return;
        }
        self.state = ReceiverState::ShuttingDown;
        if let Some((token, handle)) = self.ticker.take() {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "inventory task ended abnormally");
            }
        }
        if let Some(w) = &self.watcher {
            w.shutdown().await;
        }
        self.state = ReceiverState::Stopped;
        info!("receiver stopped");
    }

    pub fn state(&self) -> ReceiverState { self.state }

    /// Watcher of the current (or last) run.
    pub fn watcher(&self) -> Option<&Arc<ResourceWatcher>> { self.watcher.as_ref() }

    pub fn config(&self) -> &ReceiverConfig { &self.config }
}

/// Resolve configured exporter names against the host. Fails on the first
/// missing name or sink without metadata capability.
pub fn resolve_bindings(names: &[String], host: &dyn Host) -> ReceiverResult<Vec<MetadataSinkBinding>> {
    names
        .iter()
        .map(|name| {
            let sink = host.lookup_sink(name).ok_or_else(|| ReceiverError::MissingSink { name: name.clone() })?;
            let actual = sink.type_name().to_string();
            let consumer = sink
                .metadata_consumer()
                .ok_or_else(|| ReceiverError::SinkType { name: name.clone(), actual })?;
            Ok(MetadataSinkBinding { name: name.clone(), sink: consumer })
        })
        .collect()
}

async fn report_inventory(watcher: Arc<ResourceWatcher>, period: Duration, token: CancellationToken) {
    let mut tick = tokio::time::interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = tick.tick() => { watcher.report_inventory().await; }
        }
    }
}

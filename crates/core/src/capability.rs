//! Capabilities at the receiver's boundary: consumers, sinks, host registry and cluster client.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use futures::stream::BoxStream;

use crate::{MetadataDelta, MetricRecord, ResourceKind, Snapshot};

/// Downstream metrics pipeline. Implementations must be safe to call from several kinds at once.
#[async_trait::async_trait]
pub trait MetricsConsumer: Send + Sync {
    async fn consume_metrics(&self, batch: Vec<MetricRecord>) -> anyhow::Result<()>;
}

/// Metadata-consumption capability of a downstream sink.
#[async_trait::async_trait]
pub trait MetadataConsumer: Send + Sync {
    async fn consume_metadata(&self, delta: &MetadataDelta) -> anyhow::Result<()>;
}

/// A sink registered with the host. Only sinks returning `Some` from
/// [`Sink::metadata_consumer`] can be bound to receive metadata deltas.
pub trait Sink: Send + Sync {
    /// Concrete type name, reported when a binding is rejected.
    fn type_name(&self) -> &str;

    fn metadata_consumer(self: Arc<Self>) -> Option<Arc<dyn MetadataConsumer>> {
        None
    }
}

/// Host registry of named sinks, queried once at startup.
pub trait Host: Send + Sync {
    fn lookup_sink(&self, name: &str) -> Option<Arc<dyn Sink>>;
}

/// A configured sink name resolved to its metadata capability.
#[derive(Clone)]
pub struct MetadataSinkBinding {
    pub name: String,
    pub sink: Arc<dyn MetadataConsumer>,
}

impl fmt::Debug for MetadataSinkBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataSinkBinding").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Raw change-stream item for one kind.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Applied(Snapshot),
    Deleted(Snapshot),
    /// Full (re)list of the kind. The first one of a subscription is the initial sync.
    Restarted(Vec<Snapshot>),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum WatchError {
    #[error("kind {0} is not supported by this client")]
    Unsupported(ResourceKind),
    #[error("watch stream: {0}")]
    Stream(String),
    #[error("invalid object: {0}")]
    InvalidObject(String),
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, WatchError>>;

/// Cluster API client able to open one change subscription per kind.
pub trait ClusterClient: Send + Sync {
    fn watch(&self, kind: ResourceKind) -> Result<WatchStream, WatchError>;
}

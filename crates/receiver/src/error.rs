#![forbid(unsafe_code)]

use kubetally_core::{ResourceKind, WatchError};

use crate::ReceiverState;

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("subscribing to {kind}: {source}")]
    Subscribe {
        kind: ResourceKind,
        #[source]
        source: WatchError,
    },
    #[error("resource watcher already started")]
    AlreadyStarted,
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    #[error("config: {0}")]
    Config(String),
    #[error("client: {0}")]
    Client(String),
    #[error("metadata exporter {name:?} is not a registered sink")]
    MissingSink { name: String },
    #[error("metadata exporter {name:?} has type {actual}, which cannot consume metadata")]
    SinkType { name: String, actual: String },
    #[error(transparent)]
    Watcher(#[from] WatcherError),
    #[error("cannot start receiver in state {0:?}")]
    InvalidState(ReceiverState),
}

pub type ReceiverResult<T> = Result<T, ReceiverError>;

//! kubetally receiver: watches cluster resources and routes metric records and metadata deltas.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
mod receiver;
mod registry;
pub mod watcher;

pub use config::ReceiverConfig;
pub use error::{ReceiverError, ReceiverResult, WatcherError};
pub use receiver::{resolve_bindings, Receiver, ReceiverState};
pub use registry::SinkRegistry;
pub use watcher::ResourceWatcher;

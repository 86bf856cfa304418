#![forbid(unsafe_code)]

use std::sync::Arc;

use kubetally_core::{Host, Sink};
use rustc_hash::FxHashMap;

/// Name → sink map handed to [`crate::Receiver::start`].
#[derive(Default, Clone)]
pub struct SinkRegistry {
    sinks: FxHashMap<String, Arc<dyn Sink>>,
}

impl SinkRegistry {
    pub fn new() -> Self { Self::default() }

    /// Register `sink` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, sink: Arc<dyn Sink>) -> &mut Self {
        self.sinks.insert(name.into(), sink);
        self
    }

    pub fn names(&self) -> Vec<&str> {
        let mut v: Vec<_> = self.sinks.keys().map(String::as_str).collect();
        v.sort_unstable();
        v
    }
}

impl Host for SinkRegistry {
    fn lookup_sink(&self, name: &str) -> Option<Arc<dyn Sink>> { self.sinks.get(name).cloned() }
}

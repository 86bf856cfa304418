//! Receiver configuration: serde defaults, YAML loading, environment overrides.

#![forbid(unsafe_code)]

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use kubetally_core::{ResourceKind, WatchedKind, DEFAULT_NODE_CONDITIONS};
use kubetally_kubehub::ApiAuth;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::error::{ReceiverError, ReceiverResult};

pub const ENV_PREFIX: &str = "KUBETALLY_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReceiverConfig {
    /// Live-inventory period in seconds; `0` disables it.
    #[serde(with = "secs")]
    pub collection_interval: Duration,
    pub node_conditions_to_report: Vec<String>,
    pub auth_type: ApiAuth,
    /// Sink names that receive metadata deltas.
    pub metadata_exporters: Vec<String>,
    pub watched_kinds: Vec<String>,
    #[serde(with = "secs")]
    pub initial_sync_timeout: Duration,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            collection_interval: Duration::from_secs(10),
            node_conditions_to_report: DEFAULT_NODE_CONDITIONS.iter().map(|s| s.to_string()).collect(),
            auth_type: ApiAuth::ServiceAccount,
            metadata_exporters: Vec::new(),
            watched_kinds: ResourceKind::ALL.iter().map(|k| k.as_str().to_string()).collect(),
            initial_sync_timeout: Duration::from_secs(10),
        }
    }
}

impl ReceiverConfig {
    /// Read a YAML file; missing fields take their defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Apply `KUBETALLY_*` overrides from the process environment.
    pub fn with_env(self) -> ReceiverResult<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `KUBETALLY_*` overrides from `lookup`. Lists are comma separated.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> ReceiverResult<Self> {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.trim().is_empty());
        if let Some(v) = get("COLLECTION_INTERVAL") {
            self.collection_interval = parse_secs("COLLECTION_INTERVAL", &v)?;
        }
        if let Some(v) = get("INITIAL_SYNC_TIMEOUT") {
            self.initial_sync_timeout = parse_secs("INITIAL_SYNC_TIMEOUT", &v)?;
        }
        if let Some(v) = get("NODE_CONDITIONS_TO_REPORT") {
            self.node_conditions_to_report = split_list(&v);
        }
        if let Some(v) = get("METADATA_EXPORTERS") {
            self.metadata_exporters = split_list(&v);
        }
        if let Some(v) = get("WATCHED_KINDS") {
            self.watched_kinds = split_list(&v);
        }
        if let Some(v) = get("AUTH_TYPE") {
            self.auth_type = parse_auth(&v)?;
        }
        Ok(self)
    }

    /// Check the configuration and resolve the watched kinds.
    pub fn validate(&self) -> ReceiverResult<Vec<WatchedKind>> {
        if self.watched_kinds.is_empty() {
            return Err(ReceiverError::Config("watched_kinds is empty".into()));
        }
        if self.initial_sync_timeout.is_zero() {
            return Err(ReceiverError::Config("initial_sync_timeout must be greater than zero".into()));
        }
        if let Some(c) = self.node_conditions_to_report.iter().find(|c| c.trim().is_empty()) {
            return Err(ReceiverError::Config(format!("invalid node condition {:?}", c)));
        }
        let mut names = FxHashSet::default();
        for name in &self.metadata_exporters {
            if name.trim().is_empty() {
                return Err(ReceiverError::Config("metadata_exporters contains an empty name".into()));
            }
            if !names.insert(name.as_str()) {
                return Err(ReceiverError::Config(format!("metadata exporter {:?} listed twice", name)));
            }
        }

        let mut seen = FxHashSet::default();
        let mut kinds = Vec::with_capacity(self.watched_kinds.len());
        for raw in &self.watched_kinds {
            let kind = ResourceKind::from_str(raw).map_err(|e| ReceiverError::Config(e.to_string()))?;
            if !seen.insert(kind) {
                return Err(ReceiverError::Config(format!("kind {} listed twice in watched_kinds", kind)));
            }
            kinds.push(match kind {
                ResourceKind::Node => WatchedKind::nodes(&self.node_conditions_to_report),
                other => WatchedKind::new(other),
            });
        }
        Ok(kinds)
    }
}

fn split_list(v: &str) -> Vec<String> {
    v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

fn parse_secs(name: &str, v: &str) -> ReceiverResult<Duration> {
    v.trim()
        .parse::<f64>()
        .ok()
        .and_then(|s| Duration::try_from_secs_f64(s).ok())
        .ok_or_else(|| ReceiverError::Config(format!("{}{}: expected seconds, got {:?}", ENV_PREFIX, name, v)))
}

fn parse_auth(v: &str) -> ReceiverResult<ApiAuth> {
    match v.trim().to_ascii_lowercase().as_str() {
        "none" => Ok(ApiAuth::None),
        "serviceaccount" => Ok(ApiAuth::ServiceAccount),
        "kubeconfig" => Ok(ApiAuth::KubeConfig),
        other => Err(ReceiverError::Config(format!("unknown auth_type {:?}", other))),
    }
}

/// Durations as (fractional) seconds.
mod secs {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(|e| D::Error::custom(format!("invalid duration {}: {}", secs, e)))
    }
}

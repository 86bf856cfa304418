//! Resource kinds the receiver knows how to observe.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Default node conditions turned into metrics.
pub const DEFAULT_NODE_CONDITIONS: &[&str] = &["Ready"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Pod,
    Node,
    Namespace,
    Deployment,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [Self::Pod, Self::Node, Self::Namespace, Self::Deployment];

    /// Lowercase plural name, also used as a metrics label value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pod => "pods",
            Self::Node => "nodes",
            Self::Namespace => "namespaces",
            Self::Deployment => "deployments",
        }
    }

    pub fn namespaced(&self) -> bool {
        matches!(self, Self::Pod | Self::Deployment)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown resource kind: {0:?} (expected one of pods, nodes, namespaces, deployments)")]
pub struct UnknownKind(pub String);

impl FromStr for ResourceKind {
    type Err = UnknownKind;

    /// Accepts singular or plural names, case-insensitive (`pods`, `Pod`, `deployment`, ...).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pod" | "pods" => Ok(Self::Pod),
            "node" | "nodes" => Ok(Self::Node),
            "namespace" | "namespaces" | "ns" => Ok(Self::Namespace),
            "deployment" | "deployments" | "deploy" => Ok(Self::Deployment),
            _ => Err(UnknownKind(s.to_string())),
        }
    }
}

/// One configured resource type plus its kind-specific options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchedKind {
    Pods,
    Nodes { conditions_to_report: Vec<String> },
    Namespaces,
    Deployments,
}

impl WatchedKind {
    /// Build with default options for `kind`; nodes get [`DEFAULT_NODE_CONDITIONS`].
    pub fn new(kind: ResourceKind) -> Self {
        match kind {
            ResourceKind::Pod => Self::Pods,
            ResourceKind::Node => Self::Nodes {
                conditions_to_report: DEFAULT_NODE_CONDITIONS.iter().map(|s| s.to_string()).collect(),
            },
            ResourceKind::Namespace => Self::Namespaces,
            ResourceKind::Deployment => Self::Deployments,
        }
    }

    pub fn nodes<I, S>(conditions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Nodes { conditions_to_report: conditions.into_iter().map(Into::into).collect() }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Pods => ResourceKind::Pod,
            Self::Nodes { .. } => ResourceKind::Node,
            Self::Namespaces => ResourceKind::Namespace,
            Self::Deployments => ResourceKind::Deployment,
        }
    }
}

//! Kind-specific metric derivation.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use kubetally_core::{
    format_uid, Attributes, ConditionStatus, MetricRecord, NamespacePhase, PodPhase, ResourceStatus, Snapshot, Uid,
};
use smallvec::smallvec;

pub const POD_PHASE: &str = "k8s.pod.phase";
pub const POD_RESTARTS: &str = "k8s.pod.restarts";
pub const NODE_CONDITION_PREFIX: &str = "k8s.node.condition_";
pub const NAMESPACE_PHASE: &str = "k8s.namespace.phase";
pub const DEPLOYMENT_DESIRED: &str = "k8s.deployment.desired";
pub const DEPLOYMENT_AVAILABLE: &str = "k8s.deployment.available";

/// Cross-kind lookups available while deriving one snapshot's records.
#[derive(Default)]
pub(crate) struct Correlation {
    pub node_uid: Option<Uid>,
}

pub(crate) fn records(
    snap: &Snapshot,
    node_conditions: &[String],
    corr: &Correlation,
    ts: DateTime<Utc>,
) -> Vec<MetricRecord> {
    let attrs = base_attributes(snap, corr);
    let rec = |name: String, value: f64| MetricRecord {
        resource: snap.id.clone(),
        kind: snap.kind,
        name,
        value,
        timestamp: ts,
        attributes: attrs.clone(),
    };
    match &snap.status {
        ResourceStatus::Pod { phase, restarts, .. } => vec![
            rec(POD_PHASE.to_string(), pod_phase_value(*phase)),
            rec(POD_RESTARTS.to_string(), f64::from(*restarts)),
        ],
        ResourceStatus::Node { conditions } => conditions
            .iter()
            .filter(|c| node_conditions.iter().any(|allowed| *allowed == c.kind))
            .map(|c| rec(node_condition_metric(&c.kind), condition_value(c.status)))
            .collect(),
        ResourceStatus::Namespace { phase } => vec![rec(NAMESPACE_PHASE.to_string(), namespace_phase_value(*phase))],
        ResourceStatus::Deployment { desired, available } => vec![
            rec(DEPLOYMENT_DESIRED.to_string(), f64::from(*desired)),
            rec(DEPLOYMENT_AVAILABLE.to_string(), f64::from(*available)),
        ],
    }
}

fn base_attributes(snap: &Snapshot, corr: &Correlation) -> Attributes {
    let uid = format_uid(&snap.id.uid);
    let ns = snap.id.namespace.clone().unwrap_or_default();
    let name = snap.id.name.clone();
    match &snap.status {
        ResourceStatus::Pod { node_name, .. } => {
            let mut a: Attributes = smallvec![
                ("k8s.namespace.name", ns),
                ("k8s.pod.name", name),
                ("k8s.pod.uid", uid),
            ];
            if let Some(node) = node_name {
                a.push(("k8s.node.name", node.clone()));
            }
            if let Some(node_uid) = &corr.node_uid {
                a.push(("k8s.node.uid", format_uid(node_uid)));
            }
            a
        }
        ResourceStatus::Node { .. } => smallvec![("k8s.node.name", name), ("k8s.node.uid", uid)],
        ResourceStatus::Namespace { .. } => smallvec![("k8s.namespace.name", name), ("k8s.namespace.uid", uid)],
        ResourceStatus::Deployment { .. } => smallvec![
            ("k8s.namespace.name", ns),
            ("k8s.deployment.name", name),
            ("k8s.deployment.uid", uid),
        ],
    }
}

pub fn pod_phase_value(phase: PodPhase) -> f64 {
    match phase {
        PodPhase::Pending => 1.0,
        PodPhase::Running => 2.0,
        PodPhase::Succeeded => 3.0,
        PodPhase::Failed => 4.0,
        PodPhase::Unknown => 5.0,
    }
}

pub fn condition_value(status: ConditionStatus) -> f64 {
    match status {
        ConditionStatus::True => 1.0,
        ConditionStatus::False => 0.0,
        ConditionStatus::Unknown => -1.0,
    }
}

fn namespace_phase_value(phase: NamespacePhase) -> f64 {
    match phase {
        NamespacePhase::Active => 1.0,
        NamespacePhase::Terminating => 0.0,
    }
}

/// `MemoryPressure` -> `k8s.node.condition_memory_pressure`.
pub fn node_condition_metric(condition: &str) -> String {
    format!("{}{}", NODE_CONDITION_PREFIX, snake_case(condition))
}

fn snake_case(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len() + 4);
    for (i, c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_ascii_lowercase());
            if prev.is_ascii_lowercase() || prev.is_ascii_digit() || (prev.is_ascii_uppercase() && next_lower) {
                out.push('_');
            }
        }
        out.push(c.to_ascii_lowercase());
    }
    out
}

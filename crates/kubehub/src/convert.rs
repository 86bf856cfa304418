//! Typed kube objects to [`Snapshot`]s.

#![forbid(unsafe_code)]

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kubetally_core::{
    parse_uid, ConditionStatus, Metadata, NamespacePhase, NodeCondition, PodPhase, ResourceId, ResourceKind,
    ResourceStatus, Snapshot, WatchError,
};

pub trait ToSnapshot {
    const KIND: ResourceKind;

    fn to_snapshot(&self) -> Result<Snapshot, WatchError>;
}

fn snapshot(kind: ResourceKind, meta: &ObjectMeta, status: ResourceStatus) -> Result<Snapshot, WatchError> {
    let name = meta
        .name
        .as_deref()
        .ok_or_else(|| WatchError::InvalidObject(format!("{} object missing metadata.name", kind)))?;
    let uid_str = meta
        .uid
        .as_deref()
        .ok_or_else(|| WatchError::InvalidObject(format!("{} {} missing metadata.uid", kind, name)))?;
    let uid = parse_uid(uid_str)
        .map_err(|e| WatchError::InvalidObject(format!("{} {}: parsing metadata.uid: {}", kind, name, e)))?;
    Ok(Snapshot {
        kind,
        id: ResourceId::new(meta.namespace.as_deref(), name, uid),
        resource_version: meta.resource_version.clone(),
        metadata: Metadata {
            labels: meta.labels.clone().unwrap_or_default(),
            annotations: meta.annotations.clone().unwrap_or_default(),
        },
        status,
    })
}

impl ToSnapshot for Pod {
    const KIND: ResourceKind = ResourceKind::Pod;

    fn to_snapshot(&self) -> Result<Snapshot, WatchError> {
        let phase = self.status.as_ref().and_then(|s| s.phase.as_deref()).map(PodPhase::parse).unwrap_or_default();
        let node_name = self.spec.as_ref().and_then(|s| s.node_name.clone());
        let restarts = self
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref())
            .map(|cs| cs.iter().map(|c| c.restart_count.max(0) as u32).sum())
            .unwrap_or(0);
        snapshot(Self::KIND, &self.metadata, ResourceStatus::Pod { phase, node_name, restarts })
    }
}

impl ToSnapshot for Node {
    const KIND: ResourceKind = ResourceKind::Node;

    fn to_snapshot(&self) -> Result<Snapshot, WatchError> {
        let conditions = self
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .map(|cs| {
                cs.iter()
                    .map(|c| NodeCondition { kind: c.type_.clone(), status: ConditionStatus::parse(&c.status) })
                    .collect()
            })
            .unwrap_or_default();
        snapshot(Self::KIND, &self.metadata, ResourceStatus::Node { conditions })
    }
}

impl ToSnapshot for Namespace {
    const KIND: ResourceKind = ResourceKind::Namespace;

    fn to_snapshot(&self) -> Result<Snapshot, WatchError> {
        let phase = match self.status.as_ref().and_then(|s| s.phase.as_deref()) {
            Some("Terminating") => NamespacePhase::Terminating,
            _ => NamespacePhase::Active,
        };
        snapshot(Self::KIND, &self.metadata, ResourceStatus::Namespace { phase })
    }
}

impl ToSnapshot for Deployment {
    const KIND: ResourceKind = ResourceKind::Deployment;

    fn to_snapshot(&self) -> Result<Snapshot, WatchError> {
        // the API server defaults spec.replicas to 1
        let desired = self.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        let available = self.status.as_ref().and_then(|s| s.available_replicas).unwrap_or(0);
        snapshot(Self::KIND, &self.metadata, ResourceStatus::Deployment { desired, available })
    }
}

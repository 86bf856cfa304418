//! kubetally kubehub: cluster client construction and per-kind watch streams.

#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use kube::{
    api::Api,
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use kubetally_core::{ClusterClient, ResourceKind, Snapshot, WatchError, WatchEvent, WatchStream};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub mod convert;
mod fake;

pub use convert::ToSnapshot;
pub use fake::FakeCluster;

/// How the cluster client authenticates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ApiAuth {
    /// In-cluster endpoint without credentials.
    None,
    #[default]
    ServiceAccount,
    /// Local kubeconfig (current context).
    KubeConfig,
}

/// Builds the cluster client at receiver start.
#[async_trait::async_trait]
pub trait ClientFactory: Send + Sync {
    async fn make_client(&self, auth: ApiAuth) -> Result<Arc<dyn ClusterClient>>;
}

/// Factory producing [`KubeClusterClient`]s from the environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct KubeClientFactory;

#[async_trait::async_trait]
impl ClientFactory for KubeClientFactory {
    async fn make_client(&self, auth: ApiAuth) -> Result<Arc<dyn ClusterClient>> {
        let config = match auth {
            ApiAuth::ServiceAccount => kube::Config::incluster().context("loading in-cluster config")?,
            ApiAuth::KubeConfig => kube::Config::infer().await.context("inferring kube config")?,
            ApiAuth::None => {
                let mut c = kube::Config::incluster().context("loading in-cluster config")?;
                c.auth_info = Default::default();
                c
            }
        };
        info!(cluster_url = %config.cluster_url, auth = ?auth, "kube client configured");
        let client = Client::try_from(config).context("building kube client")?;
        Ok(Arc::new(KubeClusterClient::new(client)))
    }
}

/// [`ClusterClient`] over kube-runtime watchers (list+watch with backoff).
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self { Self { client } }
}

impl ClusterClient for KubeClusterClient {
    fn watch(&self, kind: ResourceKind) -> Result<WatchStream, WatchError> {
        let client = self.client.clone();
        Ok(match kind {
            ResourceKind::Pod => watch_typed::<Pod>(client),
            ResourceKind::Node => watch_typed::<Node>(client),
            ResourceKind::Namespace => watch_typed::<Namespace>(client),
            ResourceKind::Deployment => watch_typed::<Deployment>(client),
        })
    }
}

fn watch_typed<K>(client: Client) -> WatchStream
where
    K: kube::Resource + ToSnapshot + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    let api: Api<K> = Api::all(client);
    watcher::watcher(api, watcher::Config::default())
        .default_backoff()
        .map(|res| match res {
            Ok(Event::Applied(o)) => o.to_snapshot().map(WatchEvent::Applied),
            Ok(Event::Deleted(o)) => o.to_snapshot().map(WatchEvent::Deleted),
            Ok(Event::Restarted(list)) => Ok(WatchEvent::Restarted(snapshots(&list))),
            Err(e) => Err(WatchError::Stream(e.to_string())),
        })
        .boxed()
}

/// Convert a relist, skipping (and logging) objects that cannot be identified.
fn snapshots<K: ToSnapshot>(list: &[K]) -> Vec<Snapshot> {
    list.iter()
        .filter_map(|o| match o.to_snapshot() {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(kind = %K::KIND, error = %e, "skipping object in relist");
                None
            }
        })
        .collect()
}

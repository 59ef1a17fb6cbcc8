//! Kubernetes integration – client wiring, cluster identity, the peer-job
//! guard and the objects/types collectors.

#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::{Context, Result};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::{Api, ListParams},
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use tracing::{debug, info};

mod objects;
mod types;

pub use objects::ObjectsCollector;
pub use types::{DiscoveredResource, TypesCollector};

/// Default namespace the agent assumes it is deployed into.
pub const DEFAULT_NAMESPACE: &str = "kollect";

const SERVICE_ACCOUNT_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Build a client from the in-cluster environment, or from an explicit
/// kubeconfig when running outside the cluster.
pub async fn client(kubeconfig: Option<&Path>) -> Result<Client> {
    match kubeconfig {
        Some(path) => {
            let raw = Kubeconfig::read_from(path)
                .with_context(|| format!("reading kubeconfig {}", path.display()))?;
            let config = Config::from_custom_kubeconfig(raw, &KubeConfigOptions::default())
                .await
                .context("building client config from kubeconfig")?;
            info!(kubeconfig = %path.display(), "using external cluster access");
            Ok(Client::try_from(config)?)
        }
        None => Client::try_default().await.context("loading in-cluster configuration"),
    }
}

/// The namespace this process runs in: the downward-API env var first, then
/// the mounted service-account file, then the default.
pub fn current_namespace() -> String {
    if let Ok(ns) = std::env::var("POD_NAMESPACE") {
        let ns = ns.trim().to_string();
        if !ns.is_empty() {
            return ns;
        }
    }
    if let Ok(raw) = std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE_FILE) {
        let ns = raw.trim().to_string();
        if !ns.is_empty() {
            return ns;
        }
    }
    DEFAULT_NAMESPACE.to_string()
}

/// Stable unique id for the cluster: the immutable UID of the `kube-system`
/// namespace.
pub async fn unique_cluster_id(client: &Client) -> Result<String> {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let kube_system = namespaces
        .get("kube-system")
        .await
        .context("finding the kube-system namespace")?;
    kube_system
        .metadata
        .uid
        .filter(|uid| !uid.is_empty())
        .context("kube-system namespace has no uid")
}

/// [`kollect_core::ClusterIdentity`] backed by the live cluster.
pub struct KubeIdentity {
    client: Client,
}

impl KubeIdentity {
    pub fn new(client: Client) -> KubeIdentity {
        KubeIdentity { client }
    }
}

#[async_trait::async_trait]
impl kollect_core::ClusterIdentity for KubeIdentity {
    async fn unique_cluster_id(&self) -> Result<String> {
        unique_cluster_id(&self.client).await
    }
}

/// Count active collector jobs in `namespace` whose name starts with
/// `prefix`. The caller's own job is included in the count, so anything
/// above one means a sibling run is still in flight.
pub async fn active_collector_jobs(client: &Client, namespace: &str, prefix: &str) -> Result<usize> {
    let jobs: Api<Job> = Api::namespaced(client.clone(), namespace);
    let listed = jobs
        .list(&ListParams::default())
        .await
        .with_context(|| format!("listing jobs in namespace {namespace:?}"))?;
    let active = listed
        .items
        .iter()
        .filter(|job| {
            let running = job.status.as_ref().and_then(|s| s.active).unwrap_or(0) > 0;
            let named = job.metadata.name.as_deref().is_some_and(|name| name.starts_with(prefix));
            running && named
        })
        .count();
    debug!(namespace, prefix, active, "peer collector jobs counted");
    Ok(active)
}

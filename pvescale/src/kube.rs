//! Kubernetes node lookup and deletion.
//!
//! Joined nodes carry two labels written by the seed's k3s agent flags;
//! [`NodeDirectory`] resolves between node names and `(group, vmid)` pairs
//! through them, and deletes node objects on the teardown path. The
//! [`KubeNodes`] implementation caches resolutions for a short TTL so a
//! flapping autoscaler cannot hammer the API server.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use kube::api::{Api, DeleteParams, ListParams};
use tracing::{debug, info};

use crate::{Error, Result};

/// Label carrying the owning group id.
pub const GROUP_LABEL: &str = "autoscaler.proxmox/group";
/// Label carrying the Proxmox vmid.
pub const VMID_LABEL: &str = "autoscaler.proxmox/vmid";

/// Maximum age of a cached resolution.
const CACHE_TTL: Duration = Duration::from_secs(30);

/// The provider identity of a managed node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRef {
    /// Owning group id.
    pub group_id: String,
    /// Proxmox vmid.
    pub vmid: u32,
}

/// Read-mostly directory of cluster nodes keyed by the join labels.
pub trait NodeDirectory: Send + Sync {
    /// Resolves a node name to its provider identity. `None` for nodes
    /// without (or with malformed) managed labels.
    fn resolve(&self, node_name: &str)
    -> impl Future<Output = Result<Option<NodeRef>>> + Send;

    /// Finds the node name registered for a `(group, vmid)` pair, if the
    /// node has joined.
    fn node_for_vmid(
        &self,
        group_id: &str,
        vmid: u32,
    ) -> impl Future<Output = Result<Option<String>>> + Send;

    /// Deletes a node object. Succeeds if the node is already absent.
    fn delete_node(&self, node_name: &str) -> impl Future<Output = Result<()>> + Send;
}

/// One cached resolution.
#[derive(Debug)]
struct CacheEntry {
    /// When the entry was stored.
    at: Instant,
    /// The resolution (including negative results).
    value: Option<NodeRef>,
}

/// [`NodeDirectory`] over the Kubernetes API.
pub struct KubeNodes {
    /// Cluster-scoped Node API.
    api: Api<Node>,
    /// TTL cache of name → resolution.
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl std::fmt::Debug for KubeNodes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeNodes").finish_non_exhaustive()
    }
}

impl KubeNodes {
    /// Connects using the ambient kubeconfig or in-cluster environment.
    pub async fn connect() -> Result<Self> {
        let client = kube::Client::try_default()
            .await
            .map_err(|e| Error::Config(format!("kubernetes client: {e}")))?;
        Ok(Self::new(client))
    }

    /// Wraps a connected client.
    pub fn new(client: kube::Client) -> Self {
        Self {
            api: Api::all(client),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a fresh cached resolution, if any.
    fn cached(&self, node_name: &str) -> Option<Option<NodeRef>> {
        let cache = self.cache.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        cache
            .get(node_name)
            .filter(|e| e.at.elapsed() < CACHE_TTL)
            .map(|e| e.value.clone())
    }

    /// Stores a resolution.
    fn remember(&self, node_name: &str, value: Option<NodeRef>) {
        let mut cache = self.cache.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        cache.insert(
            node_name.to_owned(),
            CacheEntry {
                at: Instant::now(),
                value,
            },
        );
    }

    /// Drops a cached resolution (after node deletion).
    fn forget(&self, node_name: &str) {
        let mut cache = self.cache.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        cache.remove(node_name);
    }
}

/// Extracts the provider identity from a node's labels.
fn node_ref(node: &Node) -> Option<NodeRef> {
    let labels = node.metadata.labels.as_ref()?;
    let group_id = labels.get(GROUP_LABEL)?.clone();
    let vmid = labels.get(VMID_LABEL)?.parse().ok()?;
    Some(NodeRef { group_id, vmid })
}

impl NodeDirectory for KubeNodes {
    async fn resolve(&self, node_name: &str) -> Result<Option<NodeRef>> {
        if let Some(hit) = self.cached(node_name) {
            return Ok(hit);
        }
        let node = self
            .api
            .get_opt(node_name)
            .await
            .map_err(|e| Error::TransientKube(format!("get node {node_name}: {e}")))?;
        let resolved = node.as_ref().and_then(node_ref);
        self.remember(node_name, resolved.clone());
        Ok(resolved)
    }

    async fn node_for_vmid(&self, group_id: &str, vmid: u32) -> Result<Option<String>> {
        let selector = format!("{GROUP_LABEL}={group_id},{VMID_LABEL}={vmid}");
        let nodes = self
            .api
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| Error::TransientKube(format!("list nodes {selector}: {e}")))?;
        Ok(nodes.items.first().map(ResourceExt::name_any))
    }

    async fn delete_node(&self, node_name: &str) -> Result<()> {
        match self.api.delete(node_name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(node = node_name, "deleted cluster node");
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(node = node_name, "delete node: already absent");
            }
            Err(e) => {
                return Err(Error::TransientKube(format!(
                    "delete node {node_name}: {e}"
                )));
            }
        }
        self.forget(node_name);
        Ok(())
    }
}

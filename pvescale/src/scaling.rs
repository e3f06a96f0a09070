//! Request-side scaling controller.
//!
//! Serves the autoscaler's nine operations. Handlers only read and mutate
//! the state store — never Proxmox — so replies stay fast regardless of
//! backend health; the reconciler picks the changes up on its next tick.
//!
//! Desired-size mutations are serialised per group by an in-process lock;
//! the store's compare-and-set remains the authoritative barrier, and a
//! lost CAS is retried in place rather than surfaced.

use std::collections::HashMap;
use std::sync::Arc;

use pvescale_proto::{Instance, InstanceStatus, NodeGroupInfo};
use tokio::sync::{Mutex, MutexGuard, watch};
use tracing::{debug, info};

use crate::config::{Config, GroupConfig};
use crate::kube::NodeDirectory;
use crate::lifecycle::VmState;
use crate::store::StateDb;
use crate::{Error, Result};

/// Formats the provider id the autoscaler uses to address an instance.
pub fn provider_id(group_id: &str, vmid: u32) -> String {
    format!("proxmox://{group_id}/{vmid}")
}

/// The autoscaler-facing request handlers.
#[derive(Debug)]
pub struct ScalingController<K> {
    /// Immutable configuration.
    config: Arc<Config>,
    /// Durable group/VM state.
    store: Arc<StateDb>,
    /// Cluster node directory for name → vmid resolution.
    nodes: Arc<K>,
    /// Per-group mutation locks, built once from configuration.
    locks: HashMap<String, Mutex<()>>,
    /// Flipped on `Cleanup` to stop the reconciler.
    shutdown: watch::Sender<bool>,
}

impl<K: NodeDirectory> ScalingController<K> {
    /// Assembles the controller.
    pub fn new(
        config: Arc<Config>,
        store: Arc<StateDb>,
        nodes: Arc<K>,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        let locks = config
            .groups
            .iter()
            .map(|g| (g.id.clone(), Mutex::new(())))
            .collect();
        Self {
            config,
            store,
            nodes,
            locks,
            shutdown,
        }
    }

    /// Looks up a configured group or fails with `NotFound`.
    fn group(&self, group_id: &str) -> Result<&GroupConfig> {
        self.config
            .group(group_id)
            .ok_or_else(|| Error::NotFound(format!("group {group_id}")))
    }

    /// Takes the group's mutation lock.
    async fn guard(&self, group_id: &str) -> Result<MutexGuard<'_, ()>> {
        let lock = self
            .locks
            .get(group_id)
            .ok_or_else(|| Error::NotFound(format!("group {group_id}")))?;
        Ok(lock.lock().await)
    }

    /// Rows currently counted against the group's desired size.
    fn live_count(&self, group_id: &str) -> Result<u32> {
        Ok(self
            .store
            .list_vms(group_id)?
            .iter()
            .filter(|r| r.state.is_live())
            .count() as u32)
    }

    /// `NodeGroups`: every configured group with its bounds.
    pub fn node_groups(&self) -> Vec<NodeGroupInfo> {
        self.config
            .groups
            .iter()
            .map(|g| NodeGroupInfo {
                id: g.id.clone(),
                min_size: g.min_size,
                max_size: g.max_size,
                template: g.template_payload(),
            })
            .collect()
    }

    /// `NodeGroupForNode`: the group owning a node, or `None` for nodes the
    /// provider does not manage.
    pub async fn group_for_node(&self, node_name: &str) -> Result<Option<String>> {
        let Some(node_ref) = self.nodes.resolve(node_name).await? else {
            return Ok(None);
        };
        Ok(self
            .config
            .group(&node_ref.group_id)
            .map(|g| g.id.clone()))
    }

    /// `NodeGroupTargetSize`: current desired size, defaulting to
    /// `min_size` on the group's first observation.
    pub fn target_size(&self, group_id: &str) -> Result<u32> {
        let group = self.group(group_id)?;
        self.store.ensure_group(group_id, group.min_size)
    }

    /// `NodeGroupIncreaseSize`: grows desired by a positive delta, bounded
    /// by `max_size`.
    pub async fn increase_size(&self, group_id: &str, delta: i32) -> Result<()> {
        let group = self.group(group_id)?;
        if delta <= 0 {
            return Err(Error::OutOfRange(format!(
                "increase delta must be positive, got {delta}"
            )));
        }
        let _guard = self.guard(group_id).await?;
        loop {
            let cur = self.store.ensure_group(group_id, group.min_size)?;
            let new = cur + delta as u32;
            if new > group.max_size {
                return Err(Error::OutOfRange(format!(
                    "{cur} + {delta} exceeds max_size {}",
                    group.max_size
                )));
            }
            match self.store.cas_desired(group_id, cur, new) {
                Ok(()) => {
                    info!(group = %group_id, from = cur, to = new, "desired size increased");
                    return Ok(());
                }
                Err(Error::ConcurrentUpdate(_)) => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// `NodeGroupDecreaseTargetSize`: releases headroom with a negative
    /// delta. Never drops below the live instance count or `min_size`, so
    /// it cannot terminate running nodes.
    pub async fn decrease_target_size(&self, group_id: &str, delta: i32) -> Result<()> {
        let group = self.group(group_id)?;
        if delta >= 0 {
            return Err(Error::OutOfRange(format!(
                "decrease delta must be negative, got {delta}"
            )));
        }
        let shrink = delta.unsigned_abs();
        let _guard = self.guard(group_id).await?;
        loop {
            let cur = self.store.ensure_group(group_id, group.min_size)?;
            let new = cur.checked_sub(shrink).ok_or_else(|| {
                Error::OutOfRange(format!("{cur} {delta} drops below zero"))
            })?;
            let live = self.live_count(group_id)?;
            if new < live {
                return Err(Error::OutOfRange(format!(
                    "{cur} {delta} drops below live count {live}"
                )));
            }
            if new < group.min_size {
                return Err(Error::OutOfRange(format!(
                    "{cur} {delta} drops below min_size {}",
                    group.min_size
                )));
            }
            match self.store.cas_desired(group_id, cur, new) {
                Ok(()) => {
                    info!(group = %group_id, from = cur, to = new, "desired size decreased");
                    return Ok(());
                }
                Err(Error::ConcurrentUpdate(_)) => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// `NodeGroupDeleteNodes`: marks each resolvable node's VM for
    /// teardown and shrinks desired by the number actually marked. Unknown
    /// nodes are skipped, not errors.
    pub async fn delete_nodes(&self, group_id: &str, nodes: &[String]) -> Result<()> {
        let group = self.group(group_id)?;
        let _guard = self.guard(group_id).await?;

        let mut marked = 0u32;
        for node_name in nodes {
            let Some(vmid) = self.resolve_node(group_id, node_name).await? else {
                debug!(group = %group_id, node = %node_name, "ignoring unknown node");
                continue;
            };
            let Some(record) = self.store.get_vm(vmid)? else {
                continue;
            };
            if !record.state.is_live() {
                continue;
            }
            match self
                .store
                .transition(vmid, record.state, VmState::DeletingVm, None)
            {
                Ok(()) => {
                    info!(group = %group_id, node = %node_name, vmid, "node marked for deletion");
                    marked += 1;
                }
                Err(Error::StaleState { .. }) => {
                    debug!(vmid, "node already transitioning; skipped");
                }
                Err(e) => return Err(e),
            }
        }

        if marked > 0 {
            loop {
                let cur = self.store.ensure_group(group_id, group.min_size)?;
                let new = cur.saturating_sub(marked).max(group.min_size);
                if new == cur {
                    break;
                }
                match self.store.cas_desired(group_id, cur, new) {
                    Ok(()) => {
                        info!(group = %group_id, from = cur, to = new, "desired size reduced by deletion");
                        break;
                    }
                    Err(Error::ConcurrentUpdate(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Resolves a node name to a vmid: node labels first, store hostname as
    /// the fallback for nodes that never joined or cannot be reached.
    async fn resolve_node(&self, group_id: &str, node_name: &str) -> Result<Option<u32>> {
        match self.nodes.resolve(node_name).await {
            Ok(Some(node_ref)) if node_ref.group_id == group_id => {
                return Ok(Some(node_ref.vmid));
            }
            Ok(Some(node_ref)) => {
                debug!(
                    node = %node_name,
                    actual_group = %node_ref.group_id,
                    "node belongs to a different group"
                );
                return Ok(None);
            }
            Ok(None) => {}
            Err(e) => {
                debug!(node = %node_name, error = %e, "node lookup failed, trying hostname match");
            }
        }
        Ok(self
            .store
            .find_by_hostname(group_id, node_name)?
            .map(|r| r.vmid))
    }

    /// `NodeGroupNodes`: the group's live instances with provider ids.
    pub fn nodes(&self, group_id: &str) -> Result<Vec<Instance>> {
        self.group(group_id)?;
        Ok(self
            .store
            .list_vms(group_id)?
            .into_iter()
            .filter(|r| r.state.is_live())
            .map(|r| Instance {
                provider_id: provider_id(group_id, r.vmid),
                status: match r.state {
                    VmState::Active => InstanceStatus::Running,
                    _ => InstanceStatus::Creating,
                },
            })
            .collect())
    }

    /// `Refresh`: nothing to invalidate; the reconciler is autonomous.
    pub fn refresh(&self) {}

    /// `Cleanup`: stops the reconciler at its next tick boundary.
    pub fn cleanup(&self) {
        info!("cleanup requested; stopping reconciler");
        let _ = self.shutdown.send(true);
    }
}

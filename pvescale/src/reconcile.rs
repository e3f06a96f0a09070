//! Periodic reconciliation between desired state and Proxmox reality.
//!
//! One long-running task wakes on a fixed interval, snapshots the state
//! store and Proxmox per group, and issues the adapter calls that close the
//! gap: advancing in-flight lifecycles, promoting joined VMs, timing out
//! stuck ones, adopting or destroying orphans, and creating or retiring VMs
//! until the live count matches the desired size.
//!
//! The loop never propagates errors outward. Transient failures are logged
//! and retried on the next tick; permanent failures advance the affected VM
//! to `failed`. Ticks do not overlap: a tick that overruns the interval
//! delays the next one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{Config, GroupConfig};
use crate::context::{self, GroupContext};
use crate::kube::NodeDirectory;
use crate::lifecycle::{self, CleanupEffect, CleanupNext, VmState};
use crate::proxmox::{CreateVmParams, ProxmoxApi, VmInfo};
use crate::seed;
use crate::store::{StateDb, VmRecord, unix_now};
use crate::{Error, Result};

/// The reconcile loop and its collaborators.
#[derive(Debug)]
pub struct Reconciler<P, K> {
    /// Immutable configuration.
    config: Arc<Config>,
    /// Durable group/VM state.
    store: Arc<StateDb>,
    /// Proxmox adapter.
    proxmox: Arc<P>,
    /// Cluster node directory.
    nodes: Arc<K>,
    /// Flipped to `true` on shutdown.
    shutdown: watch::Receiver<bool>,
}

impl<P: ProxmoxApi, K: NodeDirectory> Reconciler<P, K> {
    /// Assembles a reconciler. Nothing runs until [`Reconciler::run`].
    pub fn new(
        config: Arc<Config>,
        store: Arc<StateDb>,
        proxmox: Arc<P>,
        nodes: Arc<K>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            store,
            proxmox,
            nodes,
            shutdown,
        }
    }

    /// Runs the loop until shutdown. Stops at a tick boundary; in-flight
    /// adapter calls finish or hit their own deadlines first.
    pub async fn run(self) {
        let mut shutdown = self.shutdown.clone();
        let interval = Duration::from_secs(self.config.reconcile_interval_secs);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "reconciler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("reconciler stopped");
    }

    /// One reconcile pass over every configured group.
    pub async fn tick(&self) {
        let managed = match self.proxmox.list_managed_vms().await {
            Ok(vms) => vms,
            Err(e) => {
                warn!(error = %e, "tick skipped: cannot list managed vms");
                return;
            }
        };

        let mut by_group: HashMap<String, Vec<VmInfo>> = HashMap::new();
        for vm in managed {
            if let Some(group_id) = vm.tags.iter().find_map(|t| context::parse_group_tag(t)) {
                by_group.entry(group_id.to_owned()).or_default().push(vm);
            }
        }

        let mut jobs = Vec::with_capacity(self.config.groups.len());
        for group in &self.config.groups {
            let vms = by_group.remove(&group.id).unwrap_or_default();
            jobs.push(self.reconcile_group(group, vms));
        }
        for (group, result) in self.config.groups.iter().zip(join_all(jobs).await) {
            if let Err(e) = result {
                warn!(group = %group.id, error = %e, "group reconcile failed");
            }
        }

        // Tags of the managed scheme pointing at groups we do not know:
        // leave them alone, but say so.
        for (group_id, vms) in &by_group {
            warn!(
                group = %group_id,
                count = vms.len(),
                "ignoring vms tagged for unconfigured group"
            );
        }
    }

    /// Reconciles a single group against its tag view.
    async fn reconcile_group(&self, group: &GroupConfig, proxmox_vms: Vec<VmInfo>) -> Result<()> {
        let desired = self.store.ensure_group(&group.id, group.min_size)?;
        let records = self.store.list_vms(&group.id)?;
        let ctx = context::build(&group.id, desired, records, proxmox_vms);

        self.drive_entries(group, &ctx).await;
        self.converge_size(group, desired).await?;
        Ok(())
    }

    /// Advances every VM in the snapshot one way or another: orphans,
    /// cleanup chains, pending promotion/timeout, vanished actives.
    async fn drive_entries(&self, group: &GroupConfig, ctx: &GroupContext) {
        for entry in &ctx.vms {
            let Some(record) = &entry.record else {
                if let Some(vm) = &entry.proxmox {
                    self.handle_orphan(group, vm).await;
                }
                continue;
            };

            let outcome = if record.state.is_cleanup() {
                self.drive_cleanup(record).await
            } else {
                match record.state {
                    VmState::Pending => self.advance_pending(group, record, entry).await,
                    VmState::Active if entry.is_tracked_missing() => {
                        debug!(vmid = record.vmid, "active vm vanished from proxmox");
                        self.store.transition(
                            record.vmid,
                            VmState::Active,
                            VmState::Failed,
                            Some("vm disappeared from proxmox"),
                        )
                    }
                    _ => Ok(()),
                }
            };

            match outcome {
                Ok(()) => {}
                Err(Error::StaleState { vmid, .. }) => {
                    debug!(vmid, "lost a transition race; reloading next tick");
                }
                Err(e) if e.is_transient() => {
                    debug!(vmid = record.vmid, error = %e, "transient failure; retrying next tick");
                }
                Err(e) => {
                    warn!(vmid = record.vmid, error = %e, "vm reconcile failed");
                }
            }
        }
    }

    /// Inserts a row for an untracked tagged VM: running VMs are adopted as
    /// `active`, everything else goes straight onto the teardown path.
    async fn handle_orphan(&self, group: &GroupConfig, vm: &VmInfo) {
        let hostname = if vm.name.is_empty() {
            format!("{}-{}", group.id, vm.vmid)
        } else {
            vm.name.clone()
        };

        let (state, last_error) = if vm.running {
            (VmState::Active, None)
        } else {
            (VmState::DeletingVm, Some("orphan vm, not running".to_owned()))
        };

        let mut record = VmRecord::new(vm.vmid, &group.id, &hostname).with_state(state);
        record.last_error = last_error;

        match self.store.insert_vm(&record) {
            Ok(()) => {
                info!(
                    group = %group.id,
                    vmid = vm.vmid,
                    adopted = vm.running,
                    "registered orphan vm"
                );
                if state == VmState::DeletingVm
                    && let Err(e) = self.drive_cleanup(&record).await
                {
                    debug!(vmid = vm.vmid, error = %e, "orphan teardown deferred");
                }
            }
            Err(e) => warn!(vmid = vm.vmid, error = %e, "could not register orphan"),
        }
    }

    /// Runs the cleanup chain from the record's current state to row
    /// removal, one side effect per step. Stops at the first failure and
    /// resumes from the stored state next tick.
    async fn drive_cleanup(&self, record: &VmRecord) -> Result<()> {
        let vmid = record.vmid;
        let mut state = record.state;
        while let Some((effect, next)) = lifecycle::cleanup_step(state) {
            match effect {
                CleanupEffect::None => {}
                CleanupEffect::DestroyVm => {
                    self.proxmox.stop_vm(vmid).await?;
                    self.proxmox.destroy_vm(vmid).await?;
                }
                CleanupEffect::DestroyIso => {
                    self.proxmox.destroy_iso(&seed::iso_volume(vmid)).await?;
                }
                CleanupEffect::DeleteNode => {
                    if let Some(name) = self.nodes.node_for_vmid(&record.group_id, vmid).await? {
                        self.nodes.delete_node(&name).await?;
                    }
                }
            }
            match next {
                CleanupNext::Step(to) => {
                    self.store
                        .transition(vmid, state, to, record.last_error.as_deref())?;
                    state = to;
                }
                CleanupNext::Remove => {
                    self.store.remove_vm(vmid, state)?;
                    info!(vmid, group = %record.group_id, "vm fully reclaimed");
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Moves a `pending` VM forward: re-enters the create pipeline while the
    /// VM is not up, promotes it once it runs and its node has joined, and
    /// fails it once it has been pending too long.
    async fn advance_pending(
        &self,
        group: &GroupConfig,
        record: &VmRecord,
        entry: &context::VmEntry,
    ) -> Result<()> {
        let vmid = record.vmid;

        if entry.is_running() {
            if let Some(node) = self.nodes.node_for_vmid(&group.id, vmid).await? {
                self.store
                    .transition(vmid, VmState::Pending, VmState::Active, None)?;
                info!(group = %group.id, vmid, node = %node, "vm promoted to active");
                return Ok(());
            }
        } else {
            // Not running (or not even created yet): every pipeline step is
            // idempotent, so re-entering from the top is safe. A transient
            // failure leaves the row pending; the timeout below still applies.
            match self.create_pipeline(group, vmid, &record.hostname).await {
                Ok(()) => {}
                Err(e) if e.is_transient() => {
                    debug!(vmid, error = %e, "create pipeline deferred");
                }
                Err(e) => {
                    warn!(vmid, error = %e, "create pipeline failed permanently");
                    self.store.transition(
                        vmid,
                        VmState::Pending,
                        VmState::Failed,
                        Some(&e.to_string()),
                    )?;
                    return Ok(());
                }
            }
        }

        let age = unix_now().saturating_sub(record.created_at);
        if age > self.config.pending_vm_timeout_secs {
            warn!(vmid, age_secs = age, "pending vm timed out");
            self.store.transition(
                vmid,
                VmState::Pending,
                VmState::Failed,
                Some("pending timeout"),
            )?;
        }
        Ok(())
    }

    /// Creates or retires VMs until the live count matches the desired size.
    /// Re-reads the store first so transitions committed earlier in this
    /// tick are counted.
    async fn converge_size(&self, group: &GroupConfig, desired: u32) -> Result<()> {
        let rows = self.store.list_vms(&group.id)?;
        let live: Vec<&VmRecord> = rows.iter().filter(|r| r.state.is_live()).collect();
        let count = live.len() as u32;

        if count < desired {
            for _ in 0..desired - count {
                self.spawn_vm(group).await?;
            }
        } else if count > desired {
            self.retire_vms(group, &live, count - desired);
        }
        Ok(())
    }

    /// Allocates a vmid, inserts the `pending` row and runs the create
    /// pipeline. A transient pipeline failure leaves the row pending for
    /// the next tick; a permanent one fails it immediately.
    async fn spawn_vm(&self, group: &GroupConfig) -> Result<()> {
        let vmid = self.allocate_vmid().await?;
        let hostname = format!("{}-{}", group.id, vmid);
        self.store.insert_vm(&VmRecord::new(vmid, &group.id, &hostname))?;
        info!(group = %group.id, vmid, hostname = %hostname, "creating vm");

        match self.create_pipeline(group, vmid, &hostname).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() => {
                debug!(vmid, error = %e, "create pipeline deferred");
                Ok(())
            }
            Err(e) => {
                warn!(vmid, error = %e, "create pipeline failed permanently");
                self.store.transition(
                    vmid,
                    VmState::Pending,
                    VmState::Failed,
                    Some(&e.to_string()),
                )?;
                Ok(())
            }
        }
    }

    /// Picks a vmid Proxmox considers free and the store does not track.
    /// Rows inserted earlier in the tick reserve their ids before the shell
    /// exists, so the cluster suggestion can lag behind.
    async fn allocate_vmid(&self) -> Result<u32> {
        let mut vmid = self.proxmox.next_vmid().await?;
        while self.store.get_vm(vmid)?.is_some() {
            vmid += 1;
        }
        Ok(vmid)
    }

    /// The four-step create pipeline for one VM. Each step is idempotent;
    /// re-entering after a partial run duplicates nothing.
    async fn create_pipeline(&self, group: &GroupConfig, vmid: u32, hostname: &str) -> Result<()> {
        let pve = &self.config.proxmox;

        let params = CreateVmParams {
            shape: group.shape,
            hostname: hostname.to_owned(),
            bridge: pve.bridge.clone(),
            tags: vec![context::group_tag(&group.id)],
        };
        self.proxmox.create_vm(vmid, &params).await?;
        self.proxmox
            .import_disk(vmid, &pve.cloud_image_url, &pve.import_storage)
            .await?;

        let files = seed::build(&group.id, vmid, hostname, &self.config.cluster);
        let volume = seed::iso_volume(vmid);
        self.proxmox.upload_iso(&volume, seed::build_iso(&files)).await?;
        self.proxmox.attach_iso(vmid, &volume).await?;

        self.proxmox.start_vm(vmid).await?;
        Ok(())
    }

    /// Transitions `excess` victims to `deleting_vm`, preferring `pending`
    /// rows over `active` ones, oldest first.
    fn retire_vms(&self, group: &GroupConfig, live: &[&VmRecord], excess: u32) {
        let mut victims: Vec<&&VmRecord> = live.iter().collect();
        victims.sort_by_key(|r| (r.state == VmState::Active, r.created_at, r.vmid));

        for victim in victims.into_iter().take(excess as usize) {
            match self
                .store
                .transition(victim.vmid, victim.state, VmState::DeletingVm, None)
            {
                Ok(()) => {
                    info!(group = %group.id, vmid = victim.vmid, "vm selected for scale-down");
                }
                Err(e) => debug!(vmid = victim.vmid, error = %e, "victim already moved"),
            }
        }
    }
}

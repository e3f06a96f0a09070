//! Per-group inventory snapshot.
//!
//! Joins the state store's view of a group with Proxmox's tag view into one
//! list the reconciler classifies. The snapshot is stateless and rebuilt
//! every tick; staleness between the two listings is tolerated because every
//! action taken from it is idempotent or conditionally committed.

use std::collections::BTreeMap;

use crate::proxmox::VmInfo;
use crate::store::VmRecord;

/// Prefix of the managed tag scheme. The full tag is `ca-group-<group_id>`.
pub const TAG_PREFIX: &str = "ca-group-";

/// The managed tag for a group.
pub fn group_tag(group_id: &str) -> String {
    format!("{TAG_PREFIX}{group_id}")
}

/// Extracts the group id from a managed tag, if the tag is one.
pub fn parse_group_tag(tag: &str) -> Option<&str> {
    tag.strip_prefix(TAG_PREFIX).filter(|g| !g.is_empty())
}

/// One VM in the joined view. At least one of the two sides is present.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct VmEntry {
    /// Cluster-wide VM identifier.
    pub vmid: u32,
    /// The state store's row, if tracked.
    pub record: Option<VmRecord>,
    /// Proxmox's listing, if the VM exists.
    pub proxmox: Option<VmInfo>,
}

impl VmEntry {
    /// Untracked but present: a VM carrying the group tag with no row.
    pub const fn is_orphan(&self) -> bool {
        self.record.is_none() && self.proxmox.is_some()
    }

    /// Tracked but missing: a row whose VM is gone from Proxmox.
    pub const fn is_tracked_missing(&self) -> bool {
        self.record.is_some() && self.proxmox.is_none()
    }

    /// `true` if Proxmox reports the VM running.
    pub fn is_running(&self) -> bool {
        self.proxmox.as_ref().is_some_and(|vm| vm.running)
    }
}

/// Joined snapshot of one group.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct GroupContext {
    /// Group id.
    pub group_id: String,
    /// Desired size at snapshot time.
    pub desired: u32,
    /// All VMs known to either side, ordered by vmid.
    pub vms: Vec<VmEntry>,
}

impl GroupContext {
    /// Count of rows in a live lifecycle state.
    pub fn live_count(&self) -> u32 {
        self.vms
            .iter()
            .filter_map(|e| e.record.as_ref())
            .filter(|r| r.state.is_live())
            .count() as u32
    }
}

/// Builds the joined snapshot from pre-fetched listings. Pure; the caller
/// supplies the store rows for the group and the Proxmox VMs carrying the
/// group's tag.
pub fn build(
    group_id: &str,
    desired: u32,
    records: Vec<VmRecord>,
    proxmox_vms: Vec<VmInfo>,
) -> GroupContext {
    let mut joined: BTreeMap<u32, VmEntry> = BTreeMap::new();
    for record in records {
        joined.insert(
            record.vmid,
            VmEntry {
                vmid: record.vmid,
                record: Some(record),
                proxmox: None,
            },
        );
    }
    for vm in proxmox_vms {
        joined
            .entry(vm.vmid)
            .and_modify(|e| e.proxmox = Some(vm.clone()))
            .or_insert_with(|| VmEntry {
                vmid: vm.vmid,
                record: None,
                proxmox: Some(vm),
            });
    }
    GroupContext {
        group_id: group_id.to_owned(),
        desired,
        vms: joined.into_values().collect(),
    }
}

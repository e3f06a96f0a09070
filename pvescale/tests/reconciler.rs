//! Reconcile-loop scenarios against the in-memory fakes.

#![allow(missing_docs, clippy::unwrap_used, clippy::missing_docs_in_private_items)]

mod common;

use std::sync::atomic::Ordering;

use common::harness;
use pvescale::context::group_tag;
use pvescale::lifecycle::VmState;
use pvescale::proxmox::ProxmoxApi;
use pvescale::seed;
use pvescale::store::{VmRecord, unix_now};

/// S1: cold start, one group, scale 0 → 2. One tick creates two pending
/// VMs, each tagged and carrying an attached seed ISO.
#[tokio::test]
async fn cold_start_creates_pending_vms() {
    let h = harness();

    h.controller.increase_size("web", 2).await.unwrap();
    assert_eq!(h.store.get_desired("web").unwrap(), Some(2));

    h.reconciler.tick().await;

    let rows = h.store.list_vms("web").unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.state == VmState::Pending));

    let tagged = h.proxmox.list_vms_with_tag(&group_tag("web")).await.unwrap();
    assert_eq!(tagged.len(), 2);

    for row in &rows {
        let vm = h.proxmox.vm(row.vmid).unwrap();
        assert_eq!(vm.iso.as_deref(), Some(seed::iso_volume(row.vmid).as_str()));
        assert!(vm.disk_attached);
        assert!(h.proxmox.iso_names().contains(&seed::iso_volume(row.vmid)));
    }
}

/// S2: once both VMs run and their nodes joined with matching labels, the
/// next tick promotes the rows and `NodeGroupNodes` reports provider ids.
#[tokio::test]
async fn joined_nodes_are_promoted() {
    let h = harness();
    h.controller.increase_size("web", 2).await.unwrap();
    h.reconciler.tick().await;

    for row in h.store.list_vms("web").unwrap() {
        h.nodes.join(&row.hostname, "web", row.vmid);
    }
    h.reconciler.tick().await;

    let rows = h.store.list_vms("web").unwrap();
    assert!(rows.iter().all(|r| r.state == VmState::Active));

    let instances = h.controller.nodes("web").unwrap();
    assert_eq!(instances.len(), 2);
    for (row, instance) in rows.iter().zip(&instances) {
        assert_eq!(
            instance.provider_id,
            format!("proxmox://web/{}", row.vmid)
        );
        assert_eq!(instance.status, pvescale_proto::InstanceStatus::Running);
    }
}

/// S3: targeted deletion marks the row, decrements desired, and one tick
/// later the VM, ISO, node object and row are all gone.
#[tokio::test]
async fn delete_nodes_tears_the_vm_down() {
    let h = harness();
    h.controller.increase_size("web", 2).await.unwrap();
    h.reconciler.tick().await;
    for row in h.store.list_vms("web").unwrap() {
        h.nodes.join(&row.hostname, "web", row.vmid);
    }
    h.reconciler.tick().await;

    let victim = h.store.list_vms("web").unwrap()[0].clone();
    h.nodes.join("node-a", "web", victim.vmid);

    h.controller
        .delete_nodes("web", &["node-a".to_owned()])
        .await
        .unwrap();
    assert_eq!(
        h.store.get_vm(victim.vmid).unwrap().unwrap().state,
        VmState::DeletingVm
    );
    assert_eq!(h.store.get_desired("web").unwrap(), Some(1));

    h.reconciler.tick().await;

    assert!(h.proxmox.vm(victim.vmid).is_none());
    assert!(!h.proxmox.iso_names().contains(&seed::iso_volume(victim.vmid)));
    assert!(h.nodes.deleted_names().contains(&"node-a".to_owned()));
    assert!(h.store.get_vm(victim.vmid).unwrap().is_none());

    // The survivor stays live and matches the reduced desired size.
    let rows = h.store.list_vms("web").unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].state.is_live());
}

/// S4: a VM stuck in pending past the timeout fails on one tick and is
/// reclaimed on the next.
#[tokio::test]
async fn stuck_pending_vm_times_out() {
    let h = harness();
    h.proxmox.fail_start_transient.store(true, Ordering::SeqCst);

    let mut record = VmRecord::new(101, "web", "web-101");
    record.created_at = unix_now() - 2 * h.config.pending_vm_timeout_secs;
    record.last_transition_at = record.created_at;
    h.store.insert_vm(&record).unwrap();

    h.reconciler.tick().await;
    let row = h.store.get_vm(101).unwrap().unwrap();
    assert_eq!(row.state, VmState::Failed);
    assert_eq!(row.last_error.as_deref(), Some("pending timeout"));

    h.reconciler.tick().await;
    assert!(h.store.get_vm(101).unwrap().is_none());
    assert!(h.proxmox.vm(101).is_none());
}

/// S5a: a running tagged VM without a row is adopted as `active`.
#[tokio::test]
async fn healthy_orphan_is_adopted() {
    let h = harness();
    h.controller.increase_size("web", 1).await.unwrap();
    h.proxmox.add_vm(150, "web-150", true, &[group_tag("web")]);

    h.reconciler.tick().await;

    let row = h.store.get_vm(150).unwrap().unwrap();
    assert_eq!(row.state, VmState::Active);
    assert_eq!(row.hostname, "web-150");
    // The adopted VM covers the desired size; nothing new is created.
    assert_eq!(h.store.list_vms("web").unwrap().len(), 1);
    assert_eq!(h.proxmox.vm_count(), 1);
}

/// S5b: a stopped tagged VM without a row goes straight onto the teardown
/// path and is destroyed.
#[tokio::test]
async fn unhealthy_orphan_is_destroyed() {
    let h = harness();
    h.proxmox.add_vm(151, "web-151", false, &[group_tag("web")]);

    h.reconciler.tick().await;

    assert!(h.proxmox.vm(151).is_none());
    assert!(h.store.get_vm(151).unwrap().is_none());
}

/// Tags for groups absent from configuration are left untouched.
#[tokio::test]
async fn unknown_group_tags_are_ignored() {
    let h = harness();
    h.proxmox.add_vm(160, "db-160", true, &["ca-group-db".to_owned()]);

    h.reconciler.tick().await;

    assert!(h.proxmox.vm(160).is_some());
    assert!(h.store.list_all_vms().unwrap().is_empty());
}

/// Re-entering the create pipeline never duplicates the disk volume or the
/// seed ISO, and the retried upload is byte-identical.
#[tokio::test]
async fn pipeline_reentry_duplicates_nothing() {
    let h = harness();
    h.proxmox.fail_start_transient.store(true, Ordering::SeqCst);
    h.controller.increase_size("web", 1).await.unwrap();

    h.reconciler.tick().await;
    let first_isos: Vec<_> = h.proxmox.iso_names();
    h.reconciler.tick().await;
    h.reconciler.tick().await;

    let rows = h.store.list_vms("web").unwrap();
    assert_eq!(rows.len(), 1);
    let vmid = rows[0].vmid;
    assert_eq!(rows[0].state, VmState::Pending);

    assert_eq!(h.proxmox.iso_names(), first_isos);
    assert_eq!(h.proxmox.iso_names().len(), 1);
    assert_eq!(
        h.proxmox.import_creates.lock().unwrap().get(&vmid),
        Some(&1)
    );
    assert!(h.proxmox.iso_uploads.lock().unwrap()[&seed::iso_volume(vmid)] >= 3);

    // Backend heals; the same row converges to running without new objects.
    h.proxmox.fail_start_transient.store(false, Ordering::SeqCst);
    h.reconciler.tick().await;
    assert!(h.proxmox.vm(vmid).unwrap().running);
    assert_eq!(h.proxmox.vm_count(), 1);
}

/// A permanent pipeline failure fails the VM, and the replacement converges
/// once the backend recovers.
#[tokio::test]
async fn permanent_failure_fails_then_replaces() {
    let h = harness();
    h.proxmox.fail_import_permanent.store(true, Ordering::SeqCst);
    h.controller.increase_size("web", 1).await.unwrap();

    h.reconciler.tick().await;
    let rows = h.store.list_all_vms().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].state, VmState::Failed);
    assert!(rows[0].last_error.as_deref().unwrap().contains("import"));

    h.proxmox.fail_import_permanent.store(false, Ordering::SeqCst);
    // Failed VM is reclaimed and a replacement created.
    h.reconciler.tick().await;
    let rows = h.store.list_all_vms().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].state, VmState::Pending);
    assert_ne!(rows[0].vmid, 0);
}

/// An `active` row whose VM vanished from Proxmox is failed, reclaimed and
/// replaced until live count matches desired again.
#[tokio::test]
async fn vanished_vm_is_replaced() {
    let h = harness();
    h.controller.increase_size("web", 1).await.unwrap();
    h.reconciler.tick().await;
    let row = h.store.list_vms("web").unwrap()[0].clone();
    h.nodes.join(&row.hostname, "web", row.vmid);
    h.reconciler.tick().await;

    // Pull the VM out from underneath the provider.
    h.proxmox.destroy_vm(row.vmid).await.unwrap();

    h.reconciler.tick().await;
    assert_eq!(
        h.store.get_vm(row.vmid).unwrap().unwrap().state,
        VmState::Failed
    );

    // Two more ticks: reclaim, then replace.
    h.reconciler.tick().await;
    h.reconciler.tick().await;
    let rows = h.store.list_vms("web").unwrap();
    assert_eq!(rows.len(), 1);
    assert_ne!(rows[0].vmid, row.vmid);
    assert!(rows[0].state.is_live());
}

/// When live count overshoots desired (here via adoption), the reconciler
/// retires the surplus, preferring pending victims over active ones.
#[tokio::test]
async fn overshoot_retires_pending_victims_first() {
    let h = harness();
    h.controller.increase_size("web", 1).await.unwrap();
    h.proxmox.fail_start_transient.store(true, Ordering::SeqCst);
    h.reconciler.tick().await;
    let pending = h.store.list_vms("web").unwrap()[0].clone();
    assert_eq!(pending.state, VmState::Pending);

    // Two healthy orphans appear; adoption pushes live to 3 with desired 1.
    h.proxmox.add_vm(150, "web-150", true, &[group_tag("web")]);
    h.proxmox.add_vm(151, "web-151", true, &[group_tag("web")]);
    h.reconciler.tick().await;

    let rows = h.store.list_vms("web").unwrap();
    let live: Vec<_> = rows.iter().filter(|r| r.state.is_live()).collect();
    assert_eq!(live.len(), 1);
    // The pending row went first; the survivor is an adopted active VM.
    assert_eq!(live[0].state, VmState::Active);
    assert_ne!(live[0].vmid, pending.vmid);
}

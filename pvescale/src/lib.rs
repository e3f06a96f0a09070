//! Proxmox-backed external provider for the Kubernetes cluster autoscaler.
//!
//! The autoscaler, running elsewhere, asks this service to grow node groups
//! and delete specific nodes; the service translates those calls into
//! Proxmox VM lifecycle operations and k3s join automation, while a
//! SQLite-backed store keeps a durable, self-healing view of which VMs
//! belong to which group.
//!
//! Two long-lived halves share that store and nothing else:
//!
//! - the [`scaling::ScalingController`] answers autoscaler requests by
//!   mutating desired sizes and marking VMs for deletion — it never waits
//!   on Proxmox;
//! - the [`reconcile::Reconciler`] wakes on a fixed interval and drives
//!   reality toward the store: creating VMs (cloud image import + seed ISO
//!   + start), promoting joined nodes, tearing down retired or failed VMs,
//!   and repairing drift such as orphaned or vanished machines.

pub mod config;
pub mod context;
mod error;
pub mod kube;
pub mod lifecycle;
pub mod proxmox;
pub mod reconcile;
pub mod scaling;
pub mod seed;
pub mod server;
pub mod store;

pub use error::{Error, Result};

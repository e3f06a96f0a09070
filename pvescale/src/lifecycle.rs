//! VM lifecycle state machine.
//!
//! A managed VM moves through six states:
//!
//! ```text
//! pending ──► active ──► deleting_vm ──► deleting_iso ──► deleting_node ──► (row removed)
//!    │  │                    ▲
//!    │  └──► failed ─────────┘
//!    └───────────────────────┘
//! ```
//!
//! The table here is pure: it validates transitions and names the side
//! effect owed by each cleanup state. Executing effects and committing
//! transitions is the reconciler's job; the commit itself is a conditional
//! write in the state store, which serialises racing writers per vmid.

use std::fmt;

use crate::{Error, Result};

/// Lifecycle state of a managed VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum VmState {
    /// Row exists; the VM is being created or has not joined the cluster yet.
    Pending,
    /// The VM runs and its node is registered in Kubernetes.
    Active,
    /// Creation failed permanently or the VM timed out in `pending`.
    /// Always torn down on the next tick.
    Failed,
    /// Scheduled for teardown; the Proxmox VM is destroyed next.
    DeletingVm,
    /// The VM is gone; the seed ISO is destroyed next.
    DeletingIso,
    /// The ISO is gone; the Kubernetes node object is deleted next, then
    /// the row is removed.
    DeletingNode,
}

impl VmState {
    /// All states, in lifecycle order.
    pub const ALL: [Self; 6] = [
        Self::Pending,
        Self::Active,
        Self::Failed,
        Self::DeletingVm,
        Self::DeletingIso,
        Self::DeletingNode,
    ];

    /// Stable identifier used in the state store and in logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Failed => "failed",
            Self::DeletingVm => "deleting_vm",
            Self::DeletingIso => "deleting_iso",
            Self::DeletingNode => "deleting_node",
        }
    }

    /// Parses the stable identifier produced by [`VmState::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.as_str() == s)
    }

    /// `true` for states counted against a group's desired size.
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Pending | Self::Active)
    }

    /// `true` for states on the teardown path.
    pub const fn is_cleanup(self) -> bool {
        matches!(
            self,
            Self::Failed | Self::DeletingVm | Self::DeletingIso | Self::DeletingNode
        )
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side effect owed by a cleanup state before the VM may advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum CleanupEffect {
    /// No external work; advance immediately.
    None,
    /// Stop and destroy the Proxmox VM.
    DestroyVm,
    /// Destroy the seed ISO volume.
    DestroyIso,
    /// Delete the Kubernetes node object, if present.
    DeleteNode,
}

/// Where a cleanup state leads once its effect has succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum CleanupNext {
    /// Advance to the given state.
    Step(VmState),
    /// Remove the row; the VM is fully reclaimed.
    Remove,
}

/// Returns the `(effect, next)` pair for a cleanup state, or `None` for
/// states with no owed side effect (`pending`, `active`).
pub const fn cleanup_step(state: VmState) -> Option<(CleanupEffect, CleanupNext)> {
    match state {
        VmState::Failed => Some((CleanupEffect::None, CleanupNext::Step(VmState::DeletingVm))),
        VmState::DeletingVm => Some((
            CleanupEffect::DestroyVm,
            CleanupNext::Step(VmState::DeletingIso),
        )),
        VmState::DeletingIso => Some((
            CleanupEffect::DestroyIso,
            CleanupNext::Step(VmState::DeletingNode),
        )),
        VmState::DeletingNode => Some((CleanupEffect::DeleteNode, CleanupNext::Remove)),
        VmState::Pending | VmState::Active => None,
    }
}

/// Returns `true` if `from -> to` appears in the transition table.
pub const fn permitted(from: VmState, to: VmState) -> bool {
    matches!(
        (from, to),
        (VmState::Pending, VmState::Active)
            | (VmState::Pending, VmState::Failed)
            | (VmState::Pending, VmState::DeletingVm)
            | (VmState::Active, VmState::DeletingVm)
            | (VmState::Active, VmState::Failed)
            | (VmState::Failed, VmState::DeletingVm)
            | (VmState::DeletingVm, VmState::DeletingIso)
            | (VmState::DeletingIso, VmState::DeletingNode)
    )
}

/// Validates a transition, returning [`Error::IllegalTransition`] for any
/// pair outside the table.
pub fn validate(from: VmState, to: VmState) -> Result<()> {
    if permitted(from, to) {
        Ok(())
    } else {
        Err(Error::IllegalTransition { from, to })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_round_trip() {
        for state in VmState::ALL {
            assert_eq!(VmState::parse(state.as_str()), Some(state));
        }
        assert_eq!(VmState::parse("nonsense"), None);
    }

    #[test]
    fn permitted_matches_table() {
        assert!(permitted(VmState::Pending, VmState::Active));
        assert!(permitted(VmState::Pending, VmState::Failed));
        assert!(permitted(VmState::Pending, VmState::DeletingVm));
        assert!(permitted(VmState::Active, VmState::DeletingVm));
        assert!(permitted(VmState::Active, VmState::Failed));
        assert!(permitted(VmState::Failed, VmState::DeletingVm));
        assert!(permitted(VmState::DeletingVm, VmState::DeletingIso));
        assert!(permitted(VmState::DeletingIso, VmState::DeletingNode));

        assert!(!permitted(VmState::Active, VmState::Pending));
        assert!(!permitted(VmState::DeletingVm, VmState::Active));
        assert!(!permitted(VmState::DeletingNode, VmState::Pending));
        assert!(validate(VmState::Failed, VmState::Active).is_err());
    }

    /// No sequence of valid transitions returns a VM to `pending`: the
    /// machine is a DAG rooted there.
    #[test]
    fn pending_is_unreachable_once_left() {
        for from in VmState::ALL {
            assert!(
                !permitted(from, VmState::Pending),
                "{from} must not lead back to pending"
            );
        }
    }

    /// Every state eventually reaches row removal through cleanup steps.
    #[test]
    fn cleanup_chain_terminates() {
        for start in [
            VmState::Failed,
            VmState::DeletingVm,
            VmState::DeletingIso,
            VmState::DeletingNode,
        ] {
            let mut state = start;
            let mut hops = 0;
            loop {
                match cleanup_step(state).unwrap() {
                    (_, CleanupNext::Step(next)) => {
                        validate(state, next).unwrap();
                        state = next;
                    }
                    (_, CleanupNext::Remove) => break,
                }
                hops += 1;
                assert!(hops < 8, "cleanup chain from {start} does not terminate");
            }
        }
    }
}

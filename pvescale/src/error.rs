//! Error types for pvescale operations.

use crate::lifecycle::VmState;

/// Alias for `Result<T, pvescale::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by provider operations.
///
/// Only [`Error::Config`] and a store that cannot be opened are fatal; the
/// reconciler logs every other kind and retries on its next tick, and the
/// request surface translates them into protocol error records.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid or missing configuration. Fatal at startup.
    #[error("config: {0}")]
    Config(String),

    /// Proxmox failed in a way that is expected to heal (network error,
    /// 5xx, lock contention, per-call deadline exceeded).
    #[error("proxmox (transient): {0}")]
    TransientProxmox(String),

    /// Proxmox rejected the request outright. The affected VM is advanced
    /// to `failed` rather than retried.
    #[error("proxmox (permanent): {0}")]
    PermanentProxmox(String),

    /// The Kubernetes API could not be reached; retried next tick.
    #[error("kubernetes (transient): {0}")]
    TransientKube(String),

    /// A conditional VM-state write lost the race: the stored state no
    /// longer matches the transition's expected `from` state.
    #[error("vm {vmid}: stored state is no longer {expected}")]
    StaleState {
        /// The VM whose row changed underneath the writer.
        vmid: u32,
        /// The state the writer expected to find.
        expected: VmState,
    },

    /// A compare-and-set on a group's desired size lost the race.
    #[error("group {0}: desired size changed concurrently")]
    ConcurrentUpdate(String),

    /// A state transition not present in the lifecycle table was attempted.
    /// Programmer error; logged, never persisted.
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        /// State the VM is currently in.
        from: VmState,
        /// State the caller tried to move to.
        to: VmState,
    },

    /// A requested size change would leave `[min_size, max_size]` or drop
    /// below the live instance floor.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// Unknown group or node.
    #[error("not found: {0}")]
    NotFound(String),

    /// An error from the underlying SQLite engine.
    #[error(transparent)]
    Store(#[from] rusqlite::Error),

    /// An I/O error from file or socket operations.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns `true` for failures the reconciler should retry next tick
    /// rather than act on.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientProxmox(_) | Self::TransientKube(_)
        )
    }
}

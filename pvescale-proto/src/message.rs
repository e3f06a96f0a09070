//! Protocol message types for the provider's remote-call surface.
//!
//! One [`Request`] variant per autoscaler operation; every request is
//! answered by exactly one [`Response`]. Errors travel as data
//! ([`Response::Error`]) rather than tearing down the connection, so a
//! single connection can serve many calls.

use serde::{Deserialize, Serialize};

/// Wire protocol version. Bumped on every incompatible change.
pub const PROTOCOL_VERSION: u32 = 1;

/// Static description of a configured node group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGroupInfo {
    /// Group identifier, unique within the provider.
    pub id: String,
    /// Lower bound on the group's desired size.
    pub min_size: u32,
    /// Upper bound on the group's desired size.
    pub max_size: u32,
    /// Opaque per-group template payload describing the hypothetical node
    /// the autoscaler should assume when simulating a scale-up.
    pub template: String,
}

/// Lifecycle status of a live instance, as reported to the autoscaler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum InstanceStatus {
    /// The VM exists but has not yet registered as a cluster node.
    Creating,
    /// The VM is running and its node has joined the cluster.
    Running,
}

/// One live instance of a node group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Provider identifier in the form `proxmox://<group_id>/<vmid>`.
    pub provider_id: String,
    /// Current instance status.
    pub status: InstanceStatus,
}

/// Machine-readable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A size change would leave `[min_size, max_size]`, or a shrink would
    /// drop below the live instance count.
    OutOfRange,
    /// Unknown group or node.
    NotFound,
    /// Temporary backend failure; the caller may retry.
    Transient,
    /// Unexpected internal failure.
    Internal,
}

/// Structured error with machine-readable kind and human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ErrorInfo {
    /// Machine-readable error classification.
    pub kind: ErrorKind,
    /// Human-readable error description.
    pub message: String,
}

impl ErrorInfo {
    /// Creates a new error with the given kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

/// Autoscaler → provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Request {
    /// List all configured node groups.
    NodeGroups,
    /// Resolve the group owning a cluster node (empty if unmanaged).
    NodeGroupForNode {
        /// Kubernetes node name.
        node_name: String,
    },
    /// Read the current desired size of a group.
    NodeGroupTargetSize {
        /// Group identifier.
        group_id: String,
    },
    /// Grow a group's desired size by `delta` (must be positive).
    NodeGroupIncreaseSize {
        /// Group identifier.
        group_id: String,
        /// Size increment; rejected unless `0 < delta` and the result stays
        /// within `max_size`.
        delta: i32,
    },
    /// Shrink a group's desired size by `delta` (must be negative). Only
    /// removes headroom; never terminates live nodes.
    NodeGroupDecreaseTargetSize {
        /// Group identifier.
        group_id: String,
        /// Size decrement; rejected unless `delta < 0` and the result stays
        /// at or above the live instance count.
        delta: i32,
    },
    /// Delete specific nodes from a group and shrink its desired size by the
    /// number of nodes actually resolved. Unknown nodes are ignored.
    NodeGroupDeleteNodes {
        /// Group identifier.
        group_id: String,
        /// Kubernetes node names to delete.
        nodes: Vec<String>,
    },
    /// List the group's live instances.
    NodeGroupNodes {
        /// Group identifier.
        group_id: String,
    },
    /// Invalidate caches before a scaling decision. The provider's
    /// reconciler is autonomous, so this is a no-op.
    Refresh,
    /// Final call before autoscaler shutdown; stops the reconcile loop.
    Cleanup,
}

/// Provider → autoscaler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Response {
    /// Reply to [`Request::NodeGroups`].
    NodeGroups(Vec<NodeGroupInfo>),
    /// Reply to [`Request::NodeGroupForNode`]. `None` means unmanaged.
    NodeGroupForNode(Option<String>),
    /// Reply to [`Request::NodeGroupTargetSize`].
    TargetSize(u32),
    /// Reply to [`Request::NodeGroupNodes`].
    Nodes(Vec<Instance>),
    /// Success reply for requests with no payload.
    Ok,
    /// The request failed; the connection stays usable.
    Error(ErrorInfo),
}

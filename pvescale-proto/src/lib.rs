//! Wire protocol for the pvescale cluster-autoscaler provider.
//!
//! Requests and responses are serialized with [`postcard`] and framed with a
//! 4-byte big-endian length prefix, suitable for any reliable byte stream
//! (TCP, Unix socket). The externalgrpc sidecar that fronts the autoscaler
//! speaks this protocol to the provider; each connection carries a sequence
//! of request/response pairs.

mod codec;
mod message;

pub use codec::{recv, send};
pub use message::{
    ErrorInfo, ErrorKind, Instance, InstanceStatus, NodeGroupInfo, PROTOCOL_VERSION, Request,
    Response,
};

//! Framed request/response server for the provider protocol.
//!
//! Accepts connections on a TCP listener and serves one task per
//! connection; each connection carries a sequence of postcard-framed
//! [`Request`]/[`Response`] pairs. Internal errors are translated into the
//! protocol's error records here — nothing below this layer speaks
//! [`pvescale_proto`] errors.

use std::sync::Arc;

use pvescale_proto::{self as proto, ErrorInfo, ErrorKind, Request, Response};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::Error;
use crate::kube::NodeDirectory;
use crate::scaling::ScalingController;

/// Serves the provider protocol until shutdown flips.
pub async fn serve<K>(
    listener: TcpListener,
    controller: Arc<ScalingController<K>>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()>
where
    K: NodeDirectory + 'static,
{
    info!(addr = %listener.local_addr()?, "provider protocol listening");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "connection accepted");
                        tokio::spawn(handle_connection(stream, Arc::clone(&controller)));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("provider protocol stopped");
    Ok(())
}

/// Serves one connection until the peer hangs up.
async fn handle_connection<K: NodeDirectory>(
    mut stream: TcpStream,
    controller: Arc<ScalingController<K>>,
) {
    loop {
        let request: Request = match proto::recv(&mut stream).await {
            Ok(r) => r,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::UnexpectedEof {
                    debug!(error = %e, "connection closed");
                }
                return;
            }
        };
        let response = dispatch(&controller, request).await;
        if let Err(e) = proto::send(&mut stream, &response).await {
            debug!(error = %e, "reply failed");
            return;
        }
    }
}

/// Routes one request to its handler and maps the outcome onto the wire.
pub async fn dispatch<K: NodeDirectory>(
    controller: &ScalingController<K>,
    request: Request,
) -> Response {
    match request {
        Request::NodeGroups => Response::NodeGroups(controller.node_groups()),
        Request::NodeGroupForNode { node_name } => {
            match controller.group_for_node(&node_name).await {
                Ok(group) => Response::NodeGroupForNode(group),
                Err(e) => error_response(&e),
            }
        }
        Request::NodeGroupTargetSize { group_id } => match controller.target_size(&group_id) {
            Ok(size) => Response::TargetSize(size),
            Err(e) => error_response(&e),
        },
        Request::NodeGroupIncreaseSize { group_id, delta } => {
            match controller.increase_size(&group_id, delta).await {
                Ok(()) => Response::Ok,
                Err(e) => error_response(&e),
            }
        }
        Request::NodeGroupDecreaseTargetSize { group_id, delta } => {
            match controller.decrease_target_size(&group_id, delta).await {
                Ok(()) => Response::Ok,
                Err(e) => error_response(&e),
            }
        }
        Request::NodeGroupDeleteNodes { group_id, nodes } => {
            match controller.delete_nodes(&group_id, &nodes).await {
                Ok(()) => Response::Ok,
                Err(e) => error_response(&e),
            }
        }
        Request::NodeGroupNodes { group_id } => match controller.nodes(&group_id) {
            Ok(instances) => Response::Nodes(instances),
            Err(e) => error_response(&e),
        },
        Request::Refresh => {
            controller.refresh();
            Response::Ok
        }
        Request::Cleanup => {
            controller.cleanup();
            Response::Ok
        }
        _ => Response::Error(ErrorInfo::internal("unsupported request")),
    }
}

/// Maps the internal error taxonomy onto protocol error records.
fn error_response(error: &Error) -> Response {
    let kind = match error {
        Error::OutOfRange(_) => ErrorKind::OutOfRange,
        Error::NotFound(_) => ErrorKind::NotFound,
        Error::TransientProxmox(_) | Error::TransientKube(_) => ErrorKind::Transient,
        _ => ErrorKind::Internal,
    };
    Response::Error(ErrorInfo::new(kind, error.to_string()))
}

//! Local TCP plumbing for tunnel sessions.
//!
//! A tunnel binds a listener on `127.0.0.1` and accepts connections until
//! its cancellation token fires. Every accepted connection gets its own
//! upstream port-forward stream to the target pod, so connections are
//! independent: one failing or closing does not disturb the others.
//!
//! Data moves through `tokio::io::copy_bidirectional` between the local
//! socket and the pod stream until either side closes.

use std::net::SocketAddr;

use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::error::TunnelError;

/// Bind the local listener for a tunnel.
///
/// Port `0` asks the OS for an ephemeral port; the returned address carries
/// the port actually bound.
pub(crate) async fn bind_local(port: u16) -> Result<(TcpListener, SocketAddr), TunnelError> {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .map_err(|source| TunnelError::Bind { port, source })?;
    let addr = listener
        .local_addr()
        .map_err(|source| TunnelError::Bind { port, source })?;
    Ok((listener, addr))
}

/// Accept connections until cancellation, bridging each one to the pod.
///
/// Returns when the token is cancelled or the listener fails; the caller is
/// responsible for deregistering the session afterwards.
pub(crate) async fn run_accept_loop(
    listener: TcpListener,
    pods: Api<Pod>,
    pod_name: String,
    remote_port: u16,
    cancel: CancellationToken,
) {
    debug!("Tunnel accepting connections on {:?}", listener.local_addr());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Tunnel to pod {} cancelled", pod_name);
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!("New connection from {} to forwarded port", peer);
                        let pods = pods.clone();
                        let pod_name = pod_name.clone();
                        tokio::spawn(async move {
                            if let Err(e) =
                                bridge_connection(pods, &pod_name, remote_port, stream).await
                            {
                                debug!("Tunnel connection ended: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Error accepting tunnel connection: {}", e);
                        break;
                    }
                }
            }
        }
    }
}

/// Bridge one local connection to a fresh port-forward stream on the pod.
async fn bridge_connection(
    pods: Api<Pod>,
    pod_name: &str,
    remote_port: u16,
    mut local_stream: TcpStream,
) -> Result<(), String> {
    let mut forwarder = pods
        .portforward(pod_name, &[remote_port])
        .await
        .map_err(|e| format!("Failed to open port-forward to pod {}: {}", pod_name, e))?;

    let mut upstream = forwarder
        .take_stream(remote_port)
        .ok_or_else(|| format!("No stream for remote port {}", remote_port))?;

    match tokio::io::copy_bidirectional(&mut local_stream, &mut upstream).await {
        Ok((sent, received)) => {
            debug!(
                "Tunnel connection closed ({} bytes sent, {} received)",
                sent, received
            );
        }
        Err(e) => {
            debug!("Tunnel connection copy ended: {}", e);
        }
    }

    Ok(())
}

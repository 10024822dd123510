//! TCP listener task: accept, balance, dial, splice.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::balancer::LoadBalancer;

use super::config::ProxyConfig;
use super::proxier::ProxierStatsInner;
use super::splice::splice;

/// Accept loop for one TCP service.
///
/// Runs until the stop signal fires; dropping the listener on exit closes
/// the listening socket. Relays in flight at that point are independent
/// tasks and complete naturally; the relay never injects a reset.
pub(crate) async fn run(
    listener: TcpListener,
    service_id: String,
    balancer: Arc<dyn LoadBalancer>,
    config: ProxyConfig,
    stats: Arc<ProxierStatsInner>,
    mut stop: watch::Receiver<bool>,
) {
    let local_addr = listener
        .local_addr()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
    info!(service = %service_id, addr = %local_addr, "TCP listener started");

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((inbound, peer)) => {
                    stats.tcp_accepted.fetch_add(1, Ordering::Relaxed);

                    let service_id = service_id.clone();
                    let balancer = Arc::clone(&balancer);
                    let config = config.clone();
                    let stats = Arc::clone(&stats);

                    tokio::spawn(async move {
                        relay(inbound, peer, &service_id, balancer, &config, &stats).await;
                    });
                }
                Err(e) => {
                    warn!(service = %service_id, error = %e, "Accept failed");
                }
            }
        }
    }

    info!(service = %service_id, addr = %local_addr, "TCP listener stopped");
}

/// Relay one accepted connection to a freshly selected backend.
async fn relay(
    inbound: TcpStream,
    peer: SocketAddr,
    service_id: &str,
    balancer: Arc<dyn LoadBalancer>,
    config: &ProxyConfig,
    stats: &ProxierStatsInner,
) {
    let endpoint = match balancer.next_endpoint(service_id) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            // Dropping the inbound stream closes it.
            debug!(service = %service_id, peer = %peer, error = %e, "No endpoint, closing connection");
            return;
        }
    };

    let backend = match timeout(config.connect_timeout(), TcpStream::connect(endpoint.as_str())).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            stats.tcp_dial_failures.fetch_add(1, Ordering::Relaxed);
            warn!(service = %service_id, endpoint = %endpoint, error = %e, "Backend dial failed");
            return;
        }
        Err(_) => {
            stats.tcp_dial_failures.fetch_add(1, Ordering::Relaxed);
            warn!(service = %service_id, endpoint = %endpoint, "Backend dial timed out");
            return;
        }
    };

    debug!(service = %service_id, peer = %peer, endpoint = %endpoint, "Relaying connection");
    let (bytes_out, bytes_in) = splice(inbound, backend, config.tcp_buffer_size).await;
    debug!(
        service = %service_id,
        peer = %peer,
        bytes_out,
        bytes_in,
        "Connection finished"
    );
}

//! UDP listener task with per-client session handling.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::balancer::LoadBalancer;

use super::config::ProxyConfig;
use super::proxier::ProxierStatsInner;
use super::session::{ActivityStamp, SessionTable};

/// Ingress loop for one UDP service.
///
/// A single listening socket receives all client datagrams. Each distinct
/// client address gets a session: a connected socket to the backend chosen
/// when the first datagram arrived, plus a reader task draining responses
/// back through the listening socket. A sweeper expires idle sessions.
///
/// The backend chosen at session creation sticks for the session's
/// lifetime; endpoint updates only affect clients that show up later.
pub(crate) async fn run(
    socket: UdpSocket,
    service_id: String,
    balancer: Arc<dyn LoadBalancer>,
    udp_timeout: Duration,
    config: ProxyConfig,
    stats: Arc<ProxierStatsInner>,
    mut stop: watch::Receiver<bool>,
) {
    let socket = Arc::new(socket);
    let local_addr = socket
        .local_addr()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
    info!(service = %service_id, addr = %local_addr, "UDP listener started");

    let table = Arc::new(SessionTable::new(udp_timeout, config.max_udp_sessions));

    // Sweep several times per timeout period.
    let sweep_period =
        (udp_timeout / config.sweep_divisor.max(1)).max(Duration::from_millis(1));
    let sweeper = spawn_sweeper(Arc::clone(&table), sweep_period, stop.clone());

    let mut buf = vec![0u8; config.max_datagram_size];
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, client)) => {
                    stats.udp_datagrams.fetch_add(1, Ordering::Relaxed);
                    forward(
                        &socket,
                        &buf[..len],
                        client,
                        &service_id,
                        &balancer,
                        &table,
                        &config,
                        stats.as_ref(),
                    )
                    .await;
                }
                Err(e) => {
                    warn!(service = %service_id, error = %e, "Receive failed");
                }
            }
        }
    }

    sweeper.abort();
    let session_stats = table.stats();
    let torn_down = table.clear();
    info!(
        service = %service_id,
        addr = %local_addr,
        sessions = torn_down,
        created = session_stats.created,
        expired = session_stats.expired,
        evicted = session_stats.evicted,
        "UDP listener stopped"
    );
}

/// Forward one datagram, creating a session for unknown clients.
async fn forward(
    listener: &Arc<UdpSocket>,
    datagram: &[u8],
    client: SocketAddr,
    service_id: &str,
    balancer: &Arc<dyn LoadBalancer>,
    table: &Arc<SessionTable>,
    config: &ProxyConfig,
    stats: &ProxierStatsInner,
) {
    if let Some(backend) = table.touch(&client) {
        if let Err(e) = backend.send(datagram).await {
            debug!(service = %service_id, client = %client, error = %e, "Forward failed");
        }
        return;
    }

    let endpoint = match balancer.next_endpoint(service_id) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            debug!(service = %service_id, client = %client, error = %e, "No endpoint, dropping datagram");
            return;
        }
    };

    let backend = match dial(&endpoint).await {
        Ok(socket) => Arc::new(socket),
        Err(e) => {
            warn!(service = %service_id, endpoint = %endpoint, error = %e, "Backend dial failed");
            return;
        }
    };

    stats.udp_sessions.fetch_add(1, Ordering::Relaxed);
    debug!(service = %service_id, client = %client, endpoint = %endpoint, "Session created");

    let activity = table.new_stamp();
    let reader = tokio::spawn(drain_backend(
        Arc::clone(&backend),
        Arc::clone(listener),
        client,
        activity.clone(),
        config.max_datagram_size,
    ));
    table.insert(client, Arc::clone(&backend), reader, activity);

    if let Err(e) = backend.send(datagram).await {
        debug!(service = %service_id, client = %client, error = %e, "Forward failed");
    }
}

/// Bind an ephemeral socket in the endpoint's address family and connect it.
///
/// A connected socket only delivers datagrams from the chosen backend, so
/// nothing else can be relayed into the session.
async fn dial(endpoint: &str) -> std::io::Result<UdpSocket> {
    let addr = tokio::net::lookup_host(endpoint).await?.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "endpoint did not resolve")
    })?;

    let bind_addr: SocketAddr = if addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(addr).await?;
    Ok(socket)
}

/// Forward backend datagrams to the client through the listening socket,
/// stamping session activity per delivery. Torn down by the sweeper or the
/// listener shutdown; exits on its own if either socket errors.
async fn drain_backend(
    backend: Arc<UdpSocket>,
    listener: Arc<UdpSocket>,
    client: SocketAddr,
    activity: ActivityStamp,
    max_datagram_size: usize,
) {
    let mut buf = vec![0u8; max_datagram_size];
    loop {
        let len = match backend.recv(&mut buf).await {
            Ok(len) => len,
            Err(_) => break,
        };
        if listener.send_to(&buf[..len], client).await.is_err() {
            break;
        }
        activity.touch();
    }
}

fn spawn_sweeper(
    table: Arc<SessionTable>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let removed = table.sweep();
                    if removed > 0 {
                        debug!(removed, "Swept idle sessions");
                    }
                }
                _ = stop.changed() => break,
            }
        }
    })
}

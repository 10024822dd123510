//! Service registry and listener lifecycle.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::balancer::LoadBalancer;

use super::config::ProxyConfig;
use super::error::{ProxyError, ProxyResult};
use super::service::{Protocol, ServiceSpec};
use super::{tcp, udp};

/// Control- and data-plane counters for a proxier.
#[derive(Debug, Clone, Default)]
pub struct ProxierStats {
    /// Listener tasks started.
    pub listeners_started: u64,

    /// Listener tasks signalled to stop.
    pub listeners_stopped: u64,

    /// TCP connections accepted across all services.
    pub tcp_accepted: u64,

    /// Backend dials that failed or timed out.
    pub tcp_dial_failures: u64,

    /// UDP datagrams received across all services.
    pub udp_datagrams: u64,

    /// UDP sessions created across all services.
    pub udp_sessions: u64,
}

/// Inner counters (atomics), shared with every listener task.
#[derive(Debug, Default)]
pub(crate) struct ProxierStatsInner {
    pub(crate) listeners_started: AtomicU64,
    pub(crate) listeners_stopped: AtomicU64,
    pub(crate) tcp_accepted: AtomicU64,
    pub(crate) tcp_dial_failures: AtomicU64,
    pub(crate) udp_datagrams: AtomicU64,
    pub(crate) udp_sessions: AtomicU64,
}

/// Book-keeping for one running service.
///
/// An entry exists in the table exactly while its listener task runs; the
/// entry and the task's stop signal are created and destroyed together.
struct ServiceInfo {
    port: u16,
    protocol: Protocol,
    stop: watch::Sender<bool>,
    #[allow(dead_code)]
    task: JoinHandle<()>,
    udp_timeout: Duration,
}

impl ServiceInfo {
    /// Signal the listener task to terminate.
    ///
    /// The task closes its listening socket on exit. In-flight TCP relays
    /// are left to complete naturally; UDP sessions are torn down with the
    /// listener since the listening socket is their only ingress.
    fn shutdown(&self) {
        let _ = self.stop.send(true);
    }
}

/// Owner of the per-service listener tasks.
///
/// The proxier is the sole writer of the service table. Reconciliation and
/// [`Proxier::stop_proxy`] run on the caller's task; the table mutex is
/// held for map mutation and the bind preceding an insert, never for a
/// listener's teardown.
///
/// Concurrent reconciliation calls are not part of the contract: updates
/// come from a single writer and are applied in call order.
pub struct Proxier {
    listen_ip: IpAddr,
    balancer: Arc<dyn LoadBalancer>,
    config: ProxyConfig,
    stats: Arc<ProxierStatsInner>,
    services: Mutex<HashMap<String, ServiceInfo>>,
}

impl Proxier {
    /// Create a proxier that binds listeners on `listen_ip`.
    #[must_use]
    pub fn new(balancer: Arc<dyn LoadBalancer>, listen_ip: IpAddr) -> Self {
        Self::with_config(balancer, listen_ip, ProxyConfig::default())
    }

    /// Create a proxier with explicit configuration.
    #[must_use]
    pub fn with_config(
        balancer: Arc<dyn LoadBalancer>,
        listen_ip: IpAddr,
        config: ProxyConfig,
    ) -> Self {
        Self {
            listen_ip,
            balancer,
            config,
            stats: Arc::new(ProxierStatsInner::default()),
            services: Mutex::new(HashMap::new()),
        }
    }

    /// Reconcile the service table against `desired`.
    ///
    /// Services absent from the table are started; services present with an
    /// unchanged `(port, protocol)` are left running untouched; services
    /// whose binding changed are stopped and restarted on the new address.
    /// Table entries not in `desired` are stopped. When this returns the
    /// table matches `desired` exactly, except for entries whose bind
    /// failed (logged, not added). A stopped service's port may still be
    /// draining at the OS level; callers that need a provably free port
    /// must poll it.
    pub async fn on_update(&self, desired: &[ServiceSpec]) {
        let mut services = self.services.lock().await;

        let desired_by_id: HashMap<&str, &ServiceSpec> =
            desired.iter().map(|s| (s.id.as_str(), s)).collect();

        // Stop services that disappeared or whose (port, protocol) changed.
        let stale: Vec<String> = services
            .iter()
            .filter(|(id, info)| match desired_by_id.get(id.as_str()) {
                Some(spec) => spec.port != info.port || spec.protocol != info.protocol,
                None => true,
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut retained_timeouts: HashMap<String, Duration> = HashMap::new();
        for id in stale {
            if let Some(info) = services.remove(&id) {
                if desired_by_id.contains_key(id.as_str()) {
                    // The id comes right back on a new binding; its idle
                    // timeout survives the restart.
                    retained_timeouts.insert(id.clone(), info.udp_timeout);
                }
                info!(service = %id, port = info.port, protocol = %info.protocol, "Stopping service");
                info.shutdown();
                self.stats.listeners_stopped.fetch_add(1, Ordering::Relaxed);
            }
        }

        // Start what is missing. Entries that survived the pass above
        // already match the desired binding.
        for spec in desired_by_id.values() {
            if services.contains_key(&spec.id) {
                continue;
            }

            let udp_timeout = retained_timeouts
                .get(&spec.id)
                .copied()
                .unwrap_or_else(|| self.config.udp_idle_timeout());
            let addr = SocketAddr::new(self.listen_ip, spec.port);

            match self
                .start_listener(&spec.id, addr, spec.protocol, udp_timeout)
                .await
            {
                Ok(info) => {
                    services.insert(spec.id.clone(), info);
                }
                Err(e) => {
                    error!(service = %spec.id, error = %e, "Failed to start service");
                }
            }
        }
    }

    /// Stop the named service and remove it from the table.
    ///
    /// Returns once the stop signal is delivered. The listening socket is
    /// closed by the time the listener task exits; callers that need the
    /// port provably free must poll it.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::UnknownService`] if no such service exists.
    pub async fn stop_proxy(&self, id: &str) -> ProxyResult<()> {
        let info = {
            let mut services = self.services.lock().await;
            services
                .remove(id)
                .ok_or_else(|| ProxyError::UnknownService(id.to_string()))?
        };

        info!(service = %id, port = info.port, protocol = %info.protocol, "Stopping service");
        info.shutdown();
        self.stats.listeners_stopped.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Register a service on an OS-assigned ephemeral port and start its
    /// listener. Returns the chosen port as a decimal string.
    ///
    /// `udp_timeout` is the idle timeout for UDP sessions; it is ignored
    /// for TCP services.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::DuplicateService`] if the id is already
    /// registered, or [`ProxyError::Bind`] if no port could be bound.
    pub async fn add_service_on_unused_port(
        &self,
        id: &str,
        protocol: Protocol,
        udp_timeout: Duration,
    ) -> ProxyResult<String> {
        let mut services = self.services.lock().await;

        if services.contains_key(id) {
            return Err(ProxyError::DuplicateService(id.to_string()));
        }

        let addr = SocketAddr::new(self.listen_ip, 0);
        let info = self.start_listener(id, addr, protocol, udp_timeout).await?;
        let port = info.port;
        services.insert(id.to_string(), info);

        Ok(port.to_string())
    }

    /// Number of services currently in the table.
    pub async fn service_count(&self) -> usize {
        self.services.lock().await.len()
    }

    /// The bound port of a registered service.
    pub async fn service_port(&self, id: &str) -> Option<u16> {
        self.services.lock().await.get(id).map(|info| info.port)
    }

    /// Snapshot of the proxier's counters.
    #[must_use]
    pub fn stats(&self) -> ProxierStats {
        ProxierStats {
            listeners_started: self.stats.listeners_started.load(Ordering::Relaxed),
            listeners_stopped: self.stats.listeners_stopped.load(Ordering::Relaxed),
            tcp_accepted: self.stats.tcp_accepted.load(Ordering::Relaxed),
            tcp_dial_failures: self.stats.tcp_dial_failures.load(Ordering::Relaxed),
            udp_datagrams: self.stats.udp_datagrams.load(Ordering::Relaxed),
            udp_sessions: self.stats.udp_sessions.load(Ordering::Relaxed),
        }
    }

    /// Bind the listening socket and spawn the listener task.
    ///
    /// Binding happens before the table insert, so a failure leaves no
    /// partially constructed state behind.
    async fn start_listener(
        &self,
        id: &str,
        addr: SocketAddr,
        protocol: Protocol,
        udp_timeout: Duration,
    ) -> ProxyResult<ServiceInfo> {
        let (stop_tx, stop_rx) = watch::channel(false);

        let (port, task) = match protocol {
            Protocol::Tcp => {
                let listener = TcpListener::bind(addr).await.map_err(|e| ProxyError::Bind {
                    addr,
                    protocol,
                    source: e,
                })?;
                let port = listener.local_addr()?.port();
                let task = tokio::spawn(tcp::run(
                    listener,
                    id.to_string(),
                    Arc::clone(&self.balancer),
                    self.config.clone(),
                    Arc::clone(&self.stats),
                    stop_rx,
                ));
                (port, task)
            }
            Protocol::Udp => {
                let socket = UdpSocket::bind(addr).await.map_err(|e| ProxyError::Bind {
                    addr,
                    protocol,
                    source: e,
                })?;
                let port = socket.local_addr()?.port();
                let task = tokio::spawn(udp::run(
                    socket,
                    id.to_string(),
                    Arc::clone(&self.balancer),
                    udp_timeout,
                    self.config.clone(),
                    Arc::clone(&self.stats),
                    stop_rx,
                ));
                (port, task)
            }
        };

        self.stats.listeners_started.fetch_add(1, Ordering::Relaxed);
        info!(service = %id, port, protocol = %protocol, "Service started");

        Ok(ServiceInfo {
            port,
            protocol,
            stop: stop_tx,
            task,
            udp_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::RoundRobinBalancer;

    fn make_proxier() -> Proxier {
        Proxier::new(
            Arc::new(RoundRobinBalancer::new()),
            IpAddr::from([127, 0, 0, 1]),
        )
    }

    async fn free_port(protocol: Protocol) -> u16 {
        match protocol {
            Protocol::Tcp => {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                listener.local_addr().unwrap().port()
            }
            Protocol::Udp => {
                let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
                socket.local_addr().unwrap().port()
            }
        }
    }

    #[tokio::test]
    async fn test_add_service_on_unused_port() {
        let proxier = make_proxier();

        let port = proxier
            .add_service_on_unused_port("echo", Protocol::Tcp, Duration::ZERO)
            .await
            .unwrap();

        assert!(port.parse::<u16>().unwrap() > 0);
        assert_eq!(proxier.service_count().await, 1);
        assert_eq!(
            proxier.service_port("echo").await,
            Some(port.parse().unwrap())
        );
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let proxier = make_proxier();

        proxier
            .add_service_on_unused_port("echo", Protocol::Tcp, Duration::ZERO)
            .await
            .unwrap();

        let result = proxier
            .add_service_on_unused_port("echo", Protocol::Udp, Duration::ZERO)
            .await;
        assert!(matches!(result, Err(ProxyError::DuplicateService(_))));
        assert_eq!(proxier.service_count().await, 1);
    }

    #[tokio::test]
    async fn test_stop_unknown_service() {
        let proxier = make_proxier();
        let result = proxier.stop_proxy("ghost").await;
        assert!(matches!(result, Err(ProxyError::UnknownService(_))));
    }

    #[tokio::test]
    async fn test_on_update_is_idempotent() {
        let proxier = make_proxier();
        let port = free_port(Protocol::Tcp).await;

        let desired = vec![ServiceSpec::new("echo", port, Protocol::Tcp)];
        proxier.on_update(&desired).await;
        assert_eq!(proxier.stats().listeners_started, 1);

        // Same desired set: nothing restarts.
        proxier.on_update(&desired).await;
        assert_eq!(proxier.stats().listeners_started, 1);
        assert_eq!(proxier.stats().listeners_stopped, 0);
        assert_eq!(proxier.service_count().await, 1);
    }

    #[tokio::test]
    async fn test_on_update_removes_undesired_services() {
        let proxier = make_proxier();

        proxier
            .add_service_on_unused_port("echo", Protocol::Tcp, Duration::ZERO)
            .await
            .unwrap();

        proxier.on_update(&[]).await;
        assert_eq!(proxier.service_count().await, 0);
        assert_eq!(proxier.stats().listeners_stopped, 1);
    }

    #[tokio::test]
    async fn test_on_update_bind_failure_does_not_block_others() {
        let proxier = make_proxier();

        // Occupy a port so one of the desired services cannot bind.
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken_port = occupied.local_addr().unwrap().port();
        let free = free_port(Protocol::Tcp).await;

        proxier
            .on_update(&[
                ServiceSpec::new("blocked", taken_port, Protocol::Tcp),
                ServiceSpec::new("echo", free, Protocol::Tcp),
            ])
            .await;

        // The failed service is absent, the rest of the set still started.
        assert_eq!(proxier.service_count().await, 1);
        assert_eq!(proxier.service_port("echo").await, Some(free));
        assert_eq!(proxier.service_port("blocked").await, None);
        assert_eq!(proxier.stats().listeners_started, 1);

        drop(occupied);
    }

    #[tokio::test]
    async fn test_on_update_restarts_on_port_change() {
        let proxier = make_proxier();

        let first = free_port(Protocol::Tcp).await;
        proxier
            .on_update(&[ServiceSpec::new("echo", first, Protocol::Tcp)])
            .await;

        let second = free_port(Protocol::Tcp).await;
        assert_ne!(first, second);
        proxier
            .on_update(&[ServiceSpec::new("echo", second, Protocol::Tcp)])
            .await;

        assert_eq!(proxier.service_port("echo").await, Some(second));
        assert_eq!(proxier.stats().listeners_started, 2);
        assert_eq!(proxier.stats().listeners_stopped, 1);
    }
}

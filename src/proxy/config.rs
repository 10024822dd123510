//! Proxy configuration types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration shared by all listener tasks a proxier starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Buffer size for each TCP copy direction, in bytes.
    pub tcp_buffer_size: usize,

    /// Backend dial timeout for TCP connections, in seconds.
    pub connect_timeout_secs: u64,

    /// Largest UDP datagram accepted or forwarded.
    pub max_datagram_size: usize,

    /// Cap on concurrent UDP sessions per service. The least recently
    /// active session is evicted when a new client arrives at the cap.
    pub max_udp_sessions: usize,

    /// Idle timeout, in seconds, applied to UDP services created through
    /// reconciliation. Services added directly carry their own timeout.
    pub udp_idle_timeout_secs: u64,

    /// Divisor applied to a UDP service's idle timeout to derive its
    /// session sweep period, so idle sessions expire with bounded lag.
    pub sweep_divisor: u32,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            tcp_buffer_size: 32 * 1024,
            connect_timeout_secs: 10,
            max_datagram_size: 65535,
            max_udp_sessions: 65536,
            udp_idle_timeout_secs: 60,
            sweep_divisor: 4,
        }
    }
}

impl ProxyConfig {
    /// Create a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the TCP copy buffer size.
    #[must_use]
    pub fn with_tcp_buffer_size(mut self, bytes: usize) -> Self {
        self.tcp_buffer_size = bytes;
        self
    }

    /// Set the UDP session cap.
    #[must_use]
    pub fn with_max_udp_sessions(mut self, cap: usize) -> Self {
        self.max_udp_sessions = cap;
        self
    }

    /// Set the default UDP idle timeout.
    #[must_use]
    pub fn with_udp_idle_timeout(mut self, timeout: Duration) -> Self {
        self.udp_idle_timeout_secs = timeout.as_secs();
        self
    }

    /// Set the sweep divisor.
    #[must_use]
    pub fn with_sweep_divisor(mut self, divisor: u32) -> Self {
        self.sweep_divisor = divisor;
        self
    }

    /// Backend dial timeout as a `Duration`.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Default UDP idle timeout as a `Duration`.
    #[must_use]
    pub fn udp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_idle_timeout_secs)
    }
}

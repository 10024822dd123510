//! Service identity and desired-state types.

use serde::{Deserialize, Serialize};

/// Transport protocol a service listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    /// Stream service: one backend connection per accepted connection.
    Tcp,

    /// Datagram service: one backend socket per client session.
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

/// Desired state for one proxied service, as delivered by the service
/// update stream.
///
/// Identity is `id`. No two services may bind the same `(port, protocol)`
/// pair; the second bind fails and that service is not started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Service identifier.
    pub id: String,

    /// Local port the relay listens on for this service.
    pub port: u16,

    /// Transport protocol.
    pub protocol: Protocol,
}

impl ServiceSpec {
    /// Create a new service spec.
    #[must_use]
    pub fn new(id: &str, port: u16, protocol: Protocol) -> Self {
        Self {
            id: id.to_string(),
            port,
            protocol,
        }
    }
}

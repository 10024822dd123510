//! Proxy error types.

use std::net::SocketAddr;

use thiserror::Error;

use super::service::Protocol;

/// Errors that can occur on the proxier's control surface.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Failed to bind a listening socket.
    #[error("failed to bind {protocol} listener on {addr}: {source}")]
    Bind {
        /// The address that failed to bind.
        addr: SocketAddr,
        /// The requested protocol.
        protocol: Protocol,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A service with this id is already registered.
    #[error("service '{0}' is already registered")]
    DuplicateService(String),

    /// No service is registered under this id.
    #[error("no service registered under '{0}'")]
    UnknownService(String),

    /// IO error outside of bind.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for proxier operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

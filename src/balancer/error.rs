//! Balancer error types.

use thiserror::Error;

/// Errors that can occur while selecting a backend endpoint.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BalancerError {
    /// The service is not present in the endpoint table.
    #[error("no endpoint table entry for service '{0}'")]
    MissingService(String),

    /// The service is present but its endpoint list is empty.
    #[error("service '{0}' has no endpoints")]
    NoEndpoints(String),
}

/// Result type for balancer operations.
pub type BalancerResult<T> = Result<T, BalancerError>;

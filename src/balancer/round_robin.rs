//! Round-robin endpoint selection.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::{BalancerError, BalancerResult};

/// A replacement endpoint list for one service, as delivered by the
/// endpoint update stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSet {
    /// Service identifier.
    pub id: String,

    /// Ordered backend addresses in `host:port` form.
    pub endpoints: Vec<String>,
}

impl EndpointSet {
    /// Create a new endpoint set.
    #[must_use]
    pub fn new(id: &str, endpoints: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            endpoints,
        }
    }
}

/// Picks backend endpoints for services.
///
/// Listener tasks hold an implementation behind an `Arc` and consult it on
/// every inbound connection or fresh datagram; the update stream replaces
/// the backing table through [`LoadBalancer::on_update`].
pub trait LoadBalancer: Send + Sync {
    /// Return the next endpoint for `service` and advance the selection.
    ///
    /// # Errors
    ///
    /// Returns [`BalancerError::MissingService`] if the service is unknown,
    /// or [`BalancerError::NoEndpoints`] if its endpoint list is empty.
    fn next_endpoint(&self, service: &str) -> BalancerResult<String>;

    /// Atomically replace the entire endpoint table.
    ///
    /// Services absent from `sets` are removed; subsequent queries against
    /// them fail. Selection cursors are reset for every service, including
    /// ones whose endpoint list is unchanged.
    fn on_update(&self, sets: Vec<EndpointSet>);
}

/// Endpoint list and selection cursor for one service.
struct ServiceEndpoints {
    endpoints: Vec<String>,
    // Invariant: cursor < endpoints.len() whenever the list is non-empty.
    cursor: usize,
}

/// Round-robin [`LoadBalancer`].
///
/// One mutex guards the whole table, so a selection and its cursor advance
/// are a single atomic step: N consecutive successful selections against a
/// static list of length N always return a cyclic rotation of it, no matter
/// how many tasks are dispatching concurrently.
pub struct RoundRobinBalancer {
    table: Mutex<HashMap<String, ServiceEndpoints>>,
}

impl RoundRobinBalancer {
    /// Create an empty balancer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Number of services currently in the table.
    #[must_use]
    pub fn service_count(&self) -> usize {
        self.table.lock().unwrap().len()
    }
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn next_endpoint(&self, service: &str) -> BalancerResult<String> {
        let mut table = self.table.lock().unwrap();

        let entry = table
            .get_mut(service)
            .ok_or_else(|| BalancerError::MissingService(service.to_string()))?;

        if entry.endpoints.is_empty() {
            return Err(BalancerError::NoEndpoints(service.to_string()));
        }

        let endpoint = entry.endpoints[entry.cursor].clone();
        entry.cursor = (entry.cursor + 1) % entry.endpoints.len();
        Ok(endpoint)
    }

    fn on_update(&self, sets: Vec<EndpointSet>) {
        let mut table = self.table.lock().unwrap();

        table.clear();
        for set in sets {
            debug!(
                service = %set.id,
                endpoints = set.endpoints.len(),
                "Endpoint set replaced"
            );
            table.insert(
                set.id,
                ServiceEndpoints {
                    endpoints: set.endpoints,
                    cursor: 0,
                },
            );
        }
    }
}

//! # SvcRelay
//!
//! A user-space Layer 4 service relay. It fronts a dynamic set of logical
//! services, each backed by a changing set of endpoint addresses: for every
//! declared service it listens on a local port, accepts inbound TCP
//! connections or UDP datagrams, selects a backend endpoint by round-robin,
//! and shuttles bytes bidirectionally.
//!
//! ## Features
//!
//! - Per-service TCP and UDP listeners with online reconciliation
//! - Round-robin backend selection, safe under concurrent dispatch
//! - Per-client UDP sessions with idle expiry and bounded table growth
//! - Graceful listener shutdown that never severs in-flight TCP transfers
//!
//! ## Architecture
//!
//! Two update streams drive the relay. Service updates go to the
//! [`proxy::Proxier`], which opens and closes listeners to match the desired
//! set. Endpoint updates go to the [`balancer::RoundRobinBalancer`], which
//! every listener consults on each inbound connection or fresh datagram.
//! The two tables are independently owned; listeners reference backends by
//! address only, so either stream can change without disturbing the other.

pub mod balancer;
pub mod proxy;

//! Per-client UDP session tracking.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::debug;

/// Activity clock for one session, shared between the ingress task and the
/// session's backend reader task.
///
/// Stores milliseconds since the owning table's epoch so both tasks can
/// stamp without taking the table lock.
#[derive(Clone)]
pub(crate) struct ActivityStamp {
    epoch: Instant,
    at: Arc<AtomicU64>,
}

impl ActivityStamp {
    fn new(epoch: Instant) -> Self {
        let stamp = Self {
            epoch,
            at: Arc::new(AtomicU64::new(0)),
        };
        stamp.touch();
        stamp
    }

    /// Record activity now.
    pub(crate) fn touch(&self) {
        self.at
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn millis(&self) -> u64 {
        self.at.load(Ordering::Relaxed)
    }
}

/// A live client ↔ backend association.
///
/// Every live session has an open backend socket, connected to the endpoint
/// chosen when the session was created, and a reader task draining that
/// socket back to the client.
pub(crate) struct Session {
    backend: Arc<UdpSocket>,
    reader: JoinHandle<()>,
    activity: ActivityStamp,
}

/// Counters for one service's session table.
#[derive(Debug, Clone, Default)]
pub(crate) struct SessionStats {
    /// Sessions created.
    pub created: u64,

    /// Sessions removed by the idle sweep.
    pub expired: u64,

    /// Sessions evicted to make room at the cap.
    pub evicted: u64,

    /// Sessions currently live.
    pub active: usize,
}

#[derive(Default)]
struct SessionStatsInner {
    created: AtomicU64,
    expired: AtomicU64,
    evicted: AtomicU64,
}

/// Session table for one UDP service.
///
/// The ingress task is the only writer on the datagram path; the sweeper
/// removes idle entries under the same mutex. Lock holds are short and
/// never span an await.
pub(crate) struct SessionTable {
    epoch: Instant,
    timeout: Duration,
    max_sessions: usize,
    sessions: Mutex<HashMap<SocketAddr, Session>>,
    stats: SessionStatsInner,
}

impl SessionTable {
    pub(crate) fn new(timeout: Duration, max_sessions: usize) -> Self {
        Self {
            epoch: Instant::now(),
            timeout,
            max_sessions,
            sessions: Mutex::new(HashMap::new()),
            stats: SessionStatsInner::default(),
        }
    }

    /// Create an activity stamp tied to this table's clock.
    pub(crate) fn new_stamp(&self) -> ActivityStamp {
        ActivityStamp::new(self.epoch)
    }

    /// Look up a live session, stamping its activity.
    ///
    /// Returns the session's backend socket, or `None` if the client is
    /// unknown and a session must be created.
    pub(crate) fn touch(&self, client: &SocketAddr) -> Option<Arc<UdpSocket>> {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(client).map(|session| {
            session.activity.touch();
            Arc::clone(&session.backend)
        })
    }

    /// Insert a session for `client`.
    ///
    /// At the cap, the least recently active session is evicted first and
    /// its reader task torn down.
    pub(crate) fn insert(
        &self,
        client: SocketAddr,
        backend: Arc<UdpSocket>,
        reader: JoinHandle<()>,
        activity: ActivityStamp,
    ) {
        let victim = {
            let mut sessions = self.sessions.lock().unwrap();

            let victim = if sessions.len() >= self.max_sessions {
                let oldest = sessions
                    .iter()
                    .min_by_key(|(_, s)| s.activity.millis())
                    .map(|(addr, _)| *addr);
                oldest.and_then(|addr| sessions.remove(&addr).map(|s| (addr, s)))
            } else {
                None
            };

            sessions.insert(
                client,
                Session {
                    backend,
                    reader,
                    activity,
                },
            );
            victim
        };

        self.stats.created.fetch_add(1, Ordering::Relaxed);

        if let Some((addr, session)) = victim {
            session.reader.abort();
            self.stats.evicted.fetch_add(1, Ordering::Relaxed);
            debug!(client = %addr, "Evicted least recently active session");
        }
    }

    /// Remove sessions idle for longer than the table's timeout and tear
    /// down their reader tasks. Returns how many were removed.
    pub(crate) fn sweep(&self) -> usize {
        let now = self.epoch.elapsed().as_millis() as u64;
        let timeout_millis = self.timeout.as_millis() as u64;

        let victims: Vec<Session> = {
            let mut sessions = self.sessions.lock().unwrap();
            let expired: Vec<SocketAddr> = sessions
                .iter()
                .filter(|(_, s)| now.saturating_sub(s.activity.millis()) > timeout_millis)
                .map(|(addr, _)| *addr)
                .collect();

            expired
                .iter()
                .filter_map(|addr| sessions.remove(addr))
                .collect()
        };

        let removed = victims.len();
        for session in &victims {
            session.reader.abort();
        }
        self.stats
            .expired
            .fetch_add(removed as u64, Ordering::Relaxed);

        removed
    }

    /// Tear down every session. Used when the owning listener stops.
    pub(crate) fn clear(&self) -> usize {
        let victims: Vec<Session> = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.drain().map(|(_, s)| s).collect()
        };

        for session in &victims {
            session.reader.abort();
        }
        victims.len()
    }

    /// Number of live sessions.
    pub(crate) fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Snapshot of the table's counters.
    pub(crate) fn stats(&self) -> SessionStats {
        SessionStats {
            created: self.stats.created.load(Ordering::Relaxed),
            expired: self.stats.expired.load(Ordering::Relaxed),
            evicted: self.stats.evicted.load(Ordering::Relaxed),
            active: self.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    async fn make_backend() -> Arc<UdpSocket> {
        Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap())
    }

    fn idle_reader() -> JoinHandle<()> {
        tokio::spawn(async {
            std::future::pending::<()>().await;
        })
    }

    #[tokio::test]
    async fn test_touch_unknown_client() {
        let table = SessionTable::new(Duration::from_secs(60), 16);
        assert!(table.touch(&make_addr(9999)).is_none());
    }

    #[tokio::test]
    async fn test_insert_and_touch() {
        let table = SessionTable::new(Duration::from_secs(60), 16);
        let backend = make_backend().await;
        let client = make_addr(4000);

        let stamp = table.new_stamp();
        table.insert(client, Arc::clone(&backend), idle_reader(), stamp);

        let found = table.touch(&client).unwrap();
        assert_eq!(
            found.local_addr().unwrap(),
            backend.local_addr().unwrap()
        );
        assert_eq!(table.len(), 1);
        assert_eq!(table.stats().created, 1);
    }

    #[tokio::test]
    async fn test_sweep_removes_idle_sessions() {
        let table = SessionTable::new(Duration::from_millis(20), 16);

        let stamp = table.new_stamp();
        table.insert(make_addr(4000), make_backend().await, idle_reader(), stamp);

        assert_eq!(table.sweep(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(table.sweep(), 1);
        assert_eq!(table.len(), 0);
        assert_eq!(table.stats().expired, 1);
    }

    #[tokio::test]
    async fn test_sweep_keeps_active_sessions() {
        let table = SessionTable::new(Duration::from_millis(40), 16);
        let client = make_addr(4000);

        let stamp = table.new_stamp();
        table.insert(client, make_backend().await, idle_reader(), stamp);

        tokio::time::sleep(Duration::from_millis(25)).await;
        table.touch(&client);
        tokio::time::sleep(Duration::from_millis(25)).await;

        // Last activity was 25ms ago, inside the 40ms timeout.
        assert_eq!(table.sweep(), 0);
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_cap_evicts_least_recently_active() {
        let table = SessionTable::new(Duration::from_secs(60), 2);

        let oldest = make_addr(4000);
        let newer = make_addr(4001);

        let stamp = table.new_stamp();
        table.insert(oldest, make_backend().await, idle_reader(), stamp);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let stamp = table.new_stamp();
        table.insert(newer, make_backend().await, idle_reader(), stamp);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let stamp = table.new_stamp();
        table.insert(make_addr(4002), make_backend().await, idle_reader(), stamp);

        assert_eq!(table.len(), 2);
        assert!(table.touch(&oldest).is_none());
        assert!(table.touch(&newer).is_some());
        assert_eq!(table.stats().evicted, 1);
    }

    #[tokio::test]
    async fn test_clear_tears_down_everything() {
        let table = SessionTable::new(Duration::from_secs(60), 16);

        for port in 4000..4003 {
            let stamp = table.new_stamp();
            table.insert(make_addr(port), make_backend().await, idle_reader(), stamp);
        }

        assert_eq!(table.clear(), 3);
        assert_eq!(table.len(), 0);
    }
}

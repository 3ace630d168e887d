//! Connection lifecycle tracking inside a worker.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Count open connections, in-flight and served requests
//! - Let the drain path wait until every connection has closed

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Default)]
struct Counters {
    active: AtomicU64,
    in_flight: AtomicU64,
    requests: AtomicU64,
    idle: Notify,
}

/// Tracks connections and requests for heartbeats and graceful drain.
///
/// Cheap to clone; every clone observes the same counters.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    counters: Arc<Counters>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new active connection. Returns a guard that decrements on drop.
    pub fn track(&self) -> ConnectionGuard {
        self.counters.active.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            counters: Arc::clone(&self.counters),
            id: ConnectionId::new(),
        }
    }

    /// Record a request entering the handler. The returned guard marks it finished.
    ///
    /// Returns the request's ordinal (1-based) among all requests this worker has taken.
    pub fn begin_request(&self) -> (RequestGuard, u64) {
        self.counters.in_flight.fetch_add(1, Ordering::SeqCst);
        let ordinal = self.counters.requests.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = RequestGuard {
            counters: Arc::clone(&self.counters),
        };
        (guard, ordinal)
    }

    /// Current count of open connections.
    pub fn active_count(&self) -> u64 {
        self.counters.active.load(Ordering::SeqCst)
    }

    /// Requests currently inside the handler.
    pub fn in_flight(&self) -> u64 {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    /// Requests taken since the worker started.
    pub fn requests_total(&self) -> u64 {
        self.counters.requests.load(Ordering::SeqCst)
    }

    /// Wait until all connections are closed.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.counters.idle.notified();
            if self.active_count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Guard that tracks a connection's lifetime.
/// Decrements active count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    counters: Arc<Counters>,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.counters.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.counters.idle.notify_waiters();
        }
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}

/// Marks one request in flight until dropped.
#[derive(Debug)]
pub struct RequestGuard {
    counters: Arc<Counters>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn connection_tracker_counts() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.active_count(), 0);

        let guard1 = tracker.track();
        let guard2 = tracker.track();
        assert_eq!(tracker.active_count(), 2);

        drop(guard1);
        assert_eq!(tracker.active_count(), 1);
        drop(guard2);
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn requests_are_numbered_and_in_flight_released() {
        let tracker = ConnectionTracker::new();
        let (first, n1) = tracker.begin_request();
        let (second, n2) = tracker.begin_request();
        assert_eq!((n1, n2), (1, 2));
        assert_eq!(tracker.in_flight(), 2);

        drop(first);
        drop(second);
        assert_eq!(tracker.in_flight(), 0);
        assert_eq!(tracker.requests_total(), 2);
    }

    #[tokio::test]
    async fn wait_idle_returns_when_last_connection_drops() {
        let tracker = ConnectionTracker::new();
        tracker.wait_idle().await;

        let guard = tracker.track();
        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("idle wait should finish")
            .unwrap();
    }
}

//! Connection identity and accounting.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Count open sockets, split by authenticated/anonymous
//! - Publish the counts as gauges
//! - Let shutdown wait for the last socket to close

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::observability::metrics;

/// Global atomic counter for connection IDs.
/// Relaxed ordering is enough; only uniqueness matters.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
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
struct Counts {
    active: AtomicU64,
    authenticated: AtomicU64,
    anonymous: AtomicU64,
}

impl Counts {
    fn counter(&self, authenticated: bool) -> &AtomicU64 {
        if authenticated {
            &self.authenticated
        } else {
            &self.anonymous
        }
    }
}

/// Tracks open sockets for admission control and graceful shutdown.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    counts: Arc<Counts>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an open socket. The returned guard decrements on drop.
    pub fn track(&self, id: ConnectionId, authenticated: bool) -> ConnectionGuard {
        self.counts.active.fetch_add(1, Ordering::SeqCst);
        self.guard(id, authenticated)
    }

    /// Reserve a slot only while fewer than `limit` sockets are open.
    pub fn try_track(&self, id: ConnectionId, authenticated: bool, limit: u64) -> Option<ConnectionGuard> {
        self.counts
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < limit).then_some(n + 1))
            .ok()?;
        Some(self.guard(id, authenticated))
    }

    fn guard(&self, id: ConnectionId, authenticated: bool) -> ConnectionGuard {
        let count = self.counts.counter(authenticated).fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_open_connections(authenticated, count);
        tracing::trace!(connection_id = %id, authenticated, "Connection tracked");
        ConnectionGuard {
            counts: Arc::clone(&self.counts),
            authenticated,
            id,
        }
    }

    pub fn active_count(&self) -> u64 {
        self.counts.active.load(Ordering::SeqCst)
    }

    pub fn authenticated_count(&self) -> u64 {
        self.counts.authenticated.load(Ordering::SeqCst)
    }

    pub fn anonymous_count(&self) -> u64 {
        self.counts.anonymous.load(Ordering::SeqCst)
    }

    /// Wait until every socket has closed. Returns false on timeout.
    pub async fn wait_for_shutdown(&self, timeout: Duration) -> bool {
        let drained = async {
            while self.active_count() > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}

/// Guard that tracks a connection's lifetime.
#[derive(Debug)]
pub struct ConnectionGuard {
    counts: Arc<Counts>,
    authenticated: bool,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counts.active.fetch_sub(1, Ordering::SeqCst);
        let count = self
            .counts
            .counter(self.authenticated)
            .fetch_sub(1, Ordering::SeqCst)
            .saturating_sub(1);
        metrics::set_open_connections(self.authenticated, count);
        tracing::trace!(connection_id = %self.id, "Connection untracked");
    }
}

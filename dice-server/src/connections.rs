//! # Live Connection Tracking
//!
//! Process-wide count of open client connections.
//!
//! The count is observability only: it never rejects a connection. Each
//! accepted socket registers once and gets a [`ConnectionGuard`]; dropping
//! the guard is the only way to decrement, so a connection is subtracted
//! exactly once no matter how its session ends.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::info;

#[derive(Debug, Default)]
struct TrackerInner {
    live: AtomicUsize,
    accepted: AtomicU64,
    drained: Notify,
}

/// Shared handle to the live connection counter.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    inner: Arc<TrackerInner>,
}

impl ConnectionTracker {
    /// Creates a tracker with no live connections.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a newly accepted connection and logs it.
    pub fn register(&self, peer: SocketAddr) -> ConnectionGuard {
        let live = self.inner.live.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.accepted.fetch_add(1, Ordering::Relaxed);
        info!(%peer, clients = live, "client connected");
        ConnectionGuard {
            tracker: self.clone(),
            peer,
        }
    }

    /// Returns the number of currently open connections.
    pub fn live(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Returns the number of connections accepted since startup.
    pub fn total_accepted(&self) -> u64 {
        self.inner.accepted.load(Ordering::Relaxed)
    }

    /// Resolves once no connection is open.
    pub async fn wait_idle(&self) {
        loop {
            // Registered before the check so a concurrent last drop is not missed.
            let drained = self.inner.drained.notified();
            if self.live() == 0 {
                return;
            }
            drained.await;
        }
    }
}

/// RAII registration of one live connection.
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: ConnectionTracker,
    peer: SocketAddr,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let inner = &self.tracker.inner;
        let live = inner.live.fetch_sub(1, Ordering::AcqRel) - 1;
        info!(peer = %self.peer, clients = live, "client disconnected");
        if live == 0 {
            inner.drained.notify_waiters();
        }
    }
}

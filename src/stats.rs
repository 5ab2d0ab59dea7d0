//! Liveness and traffic statistics for a managed connection.
//!
//! One [`StatsRecorder`] is owned by each manager instance and is cumulative
//! across reconnect cycles. All counters are monotonically non-decreasing
//! except via an explicit [`StatsRecorder::reset`], which is intended only
//! between independent manager lifetimes, never mid-session.

use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Snapshot of connection statistics.
///
/// Timestamps are `None` until the corresponding event first occurs.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WsStats {
    /// Successful connection establishments
    pub connects: u64,
    /// Connection losses of any kind
    pub disconnects: u64,
    /// Disconnects initiated by this side
    pub proactive_disconnects: u64,
    /// Disconnects imposed externally
    pub reactive_disconnects: u64,
    /// Messages delivered to the inbound queue
    pub messages_received: u64,
    /// Messages written to the socket
    pub messages_sent: u64,
    /// Payload bytes read from the socket, including frames the queue rejected
    pub bytes_received: u64,
    /// Payload bytes written to the socket
    pub bytes_sent: u64,
    /// Wall-clock time of the most recent connect
    pub last_connect_time: Option<DateTime<Utc>>,
    /// Wall-clock time of the most recent disconnect
    pub last_disconnect_time: Option<DateTime<Utc>>,
    /// Wall-clock time of the most recent inbound message
    pub last_message_time: Option<DateTime<Utc>>,
}

impl WsStats {
    /// Duration since the last connect, or zero if never connected.
    #[must_use]
    pub fn connection_time(&self) -> Duration {
        self.last_connect_time
            .and_then(|t| (Utc::now() - t).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }
}

struct Inner {
    stats: WsStats,
    created_at: Instant,
}

/// Mutation point for [`WsStats`].
///
/// Every `record_*` call updates its related fields under one lock
/// acquisition, so readers observe either the pre- or post-update record but
/// never a torn one.
pub struct StatsRecorder {
    inner: RwLock<Inner>,
}

impl StatsRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                stats: WsStats::default(),
                created_at: Instant::now(),
            }),
        }
    }

    /// Record a successful connection establishment.
    pub fn record_connect(&self) {
        let mut inner = self.write();
        inner.stats.connects += 1;
        inner.stats.last_connect_time = Some(Utc::now());
    }

    /// Record a connection loss, classified proactive or reactive.
    pub fn record_disconnect(&self, proactive: bool) {
        let mut inner = self.write();
        inner.stats.disconnects += 1;
        if proactive {
            inner.stats.proactive_disconnects += 1;
        } else {
            inner.stats.reactive_disconnects += 1;
        }
        inner.stats.last_disconnect_time = Some(Utc::now());
    }

    /// Record an inbound message that was delivered to the queue.
    pub fn record_received(&self, bytes: u64) {
        let mut inner = self.write();
        inner.stats.messages_received += 1;
        inner.stats.bytes_received += bytes;
        inner.stats.last_message_time = Some(Utc::now());
    }

    /// Record the bytes of an inbound frame whose message was rejected by
    /// the queue. The socket read still happened, so the bytes count; the
    /// message does not.
    pub fn record_rejected_frame(&self, bytes: u64) {
        let mut inner = self.write();
        inner.stats.bytes_received += bytes;
    }

    /// Record an outbound message written to the socket.
    pub fn record_sent(&self, bytes: u64) {
        let mut inner = self.write();
        inner.stats.messages_sent += 1;
        inner.stats.bytes_sent += bytes;
    }

    /// Duration since this recorder (and its manager) was created.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.read().created_at.elapsed()
    }

    /// Duration since the last connect, or zero if never connected.
    #[must_use]
    pub fn connection_time(&self) -> Duration {
        self.read().stats.connection_time()
    }

    /// Immutable snapshot of the current statistics.
    #[must_use]
    pub fn snapshot(&self) -> WsStats {
        self.read().stats.clone()
    }

    /// Zero all counters and timestamps and restart the uptime clock.
    pub fn reset(&self) {
        let mut inner = self.write();
        inner.stats = WsStats::default();
        inner.created_at = Instant::now();
    }

    // Counter updates have no inconsistent intermediate state, so a poisoned
    // lock is safe to recover.
    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for StatsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StatsRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsRecorder")
            .field("stats", &self.read().stats)
            .finish_non_exhaustive()
    }
}

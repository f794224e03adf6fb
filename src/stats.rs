//! Gateway counters for the observability sink.
//!
//! Every lifecycle transition logged by the gateway also bumps one of these
//! counters; [`GatewayStats::snapshot`] gives a serializable view.

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

// ============================================================================
// GatewayStats
// ============================================================================

/// Lock-free counters shared by every component.
#[derive(Debug, Default)]
pub struct GatewayStats {
    opened: AtomicU64,
    rejected: AtomicU64,
    resolved: AtomicU64,
    resolution_failed: AtomicU64,
    duplicates_closed: AtomicU64,
    ping_failures: AtomicU64,
    evicted: AtomicU64,
    timed_out: AtomicU64,
    closed: AtomicU64,
    protocol_errors: AtomicU64,
    unknown_responses: AtomicU64,
    lock_exhausted: AtomicU64,
    active_connections: AtomicI64,
}

/// Point-in-time copy of [`GatewayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Sockets accepted after the handshake.
    pub opened: u64,
    /// Upgrade requests refused by the handshake validator.
    pub rejected: u64,
    /// Connections whose identity resolved.
    pub resolved: u64,
    /// Connections closed because resolution failed.
    pub resolution_failed: u64,
    /// Live duplicates force-closed by reconciliation.
    pub duplicates_closed: u64,
    /// Failed liveness probes.
    pub ping_failures: u64,
    /// Connections evicted by the sweeper.
    pub evicted: u64,
    /// Outgoing CALLs that timed out.
    pub timed_out: u64,
    /// Connections whose close was handled.
    pub closed: u64,
    /// Frames dropped as protocol violations.
    pub protocol_errors: u64,
    /// Responses for unknown or expired message IDs.
    pub unknown_responses: u64,
    /// Request-Lock waits that ran out of retries.
    pub lock_exhausted: u64,
    /// Currently open sockets.
    pub active_connections: i64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            #[doc = concat!("Increments `", stringify!($field), "`.")]
            #[inline]
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl GatewayStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    counter! {
        record_rejected => rejected,
        record_resolved => resolved,
        record_resolution_failed => resolution_failed,
        record_duplicate_closed => duplicates_closed,
        record_ping_failure => ping_failures,
        record_evicted => evicted,
        record_timed_out => timed_out,
        record_protocol_error => protocol_errors,
        record_unknown_response => unknown_responses,
        record_lock_exhausted => lock_exhausted,
    }

    /// Counts an accepted socket.
    #[inline]
    pub fn record_opened(&self) {
        self.opened.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a handled close. Callers guarantee one call per socket.
    #[inline]
    pub fn record_closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Returns a copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            opened: self.opened.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            resolved: self.resolved.load(Ordering::Relaxed),
            resolution_failed: self.resolution_failed.load(Ordering::Relaxed),
            duplicates_closed: self.duplicates_closed.load(Ordering::Relaxed),
            ping_failures: self.ping_failures.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            unknown_responses: self.unknown_responses.load(Ordering::Relaxed),
            lock_exhausted: self.lock_exhausted.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_close_gauge() {
        let stats = GatewayStats::new();
        stats.record_opened();
        stats.record_opened();
        stats.record_closed();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.opened, 2);
        assert_eq!(snapshot.closed, 1);
        assert_eq!(snapshot.active_connections, 1);
    }

    #[test]
    fn test_counters() {
        let stats = GatewayStats::new();
        stats.record_timed_out();
        stats.record_duplicate_closed();
        stats.record_duplicate_closed();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.timed_out, 1);
        assert_eq!(snapshot.duplicates_closed, 2);
        assert_eq!(snapshot.evicted, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(GatewayStats::new().snapshot()).unwrap();
        assert_eq!(json["active_connections"], 0);
    }
}

//! Duplicate reconciliation and the active liveness sweep.
//!
//! Both decide whether a connection is alive the same way: by probing it
//! with a ping and waiting for a pong. Arrival order alone never proves a
//! socket alive.
//!
//! # Reconciliation
//!
//! | Existing entry | Action | Result |
//! |----------------|--------|--------|
//! | none | register | [`Reconciliation::Registered`] |
//! | same wrapper | keep | [`Reconciliation::AlreadyCurrent`] |
//! | wrapper closed or gone | replace | [`Reconciliation::ReplacedClosed`] |
//! | probe answered | close old (1011), replace | [`Reconciliation::ClosedDuplicate`] |
//! | probe unanswered | replace, old left to its own close | [`Reconciliation::AdoptedOverDead`] |
//!
//! The newest session always ends up in the slot.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{debug, info, warn};

use crate::registry::SessionTable;
use crate::session::Session;
use crate::stats::GatewayStats;
use crate::transport::CloseReason;

// ============================================================================
// Reconciliation
// ============================================================================

/// What reconciliation found in the registry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Slot was empty.
    Registered,
    /// Slot already held this session's wrapper.
    AlreadyCurrent,
    /// Previous wrapper was closed or dropped.
    ReplacedClosed,
    /// Previous wrapper answered the probe and was force-closed.
    ClosedDuplicate,
    /// Previous wrapper did not answer and was abandoned in place.
    AdoptedOverDead,
}

/// Converges the slot for `session`'s key on `session`.
pub async fn reconcile(
    table: &SessionTable<Session>,
    session: &Arc<Session>,
    probe_timeout: Duration,
    stats: &GatewayStats,
) -> Reconciliation {
    let key = session.key();

    let Some(existing) = table.get(key) else {
        table.insert(key.clone(), Arc::clone(session));
        return Reconciliation::Registered;
    };

    if existing.connection_guid() == session.connection_guid() {
        return Reconciliation::AlreadyCurrent;
    }

    let outcome = match existing.connection().filter(|wrapper| !wrapper.is_closed()) {
        None => Reconciliation::ReplacedClosed,
        Some(old) => {
            if old.probe(probe_timeout).await {
                old.close(CloseReason::Duplicate);
                stats.record_duplicate_closed();
                info!(
                    tenant = %key.tenant,
                    device_id = %key.device_id,
                    old_guid = %old.guid(),
                    new_guid = %session.connection_guid(),
                    "Live duplicate connection closed"
                );
                Reconciliation::ClosedDuplicate
            } else {
                warn!(
                    tenant = %key.tenant,
                    device_id = %key.device_id,
                    old_guid = %old.guid(),
                    new_guid = %session.connection_guid(),
                    "Previous connection did not answer probe, adopting newer connection"
                );
                Reconciliation::AdoptedOverDead
            }
        }
    };

    table.insert(key.clone(), Arc::clone(session));
    debug!(key = %key, guid = %session.connection_guid(), ?outcome, "Registry slot reconciled");
    outcome
}

// ============================================================================
// Sweep
// ============================================================================

/// Result of one active sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions probed.
    pub probed: usize,
    /// Probes answered.
    pub alive: usize,
    /// Probes unanswered.
    pub failed: usize,
    /// Connections closed and removed after reaching the threshold.
    pub evicted: usize,
}

/// Probes every session in `table` concurrently.
///
/// An answered probe resets the wrapper's failure counter; an unanswered one
/// increments it. At `failure_threshold` the wrapper is force-closed and its
/// slot removed (if still bound to it).
pub async fn sweep(
    table: &SessionTable<Session>,
    probe_timeout: Duration,
    failure_threshold: u32,
    stats: &GatewayStats,
) -> SweepReport {
    let sessions = table.snapshot();

    let probes = sessions.into_iter().map(|(key, session)| async move {
        let Some(wrapper) = session.connection() else {
            // Wrapper gone without a close event reaching us.
            let removed = table.remove_if_bound(&key, session.connection_guid());
            return (false, removed);
        };

        if wrapper.probe(probe_timeout).await {
            wrapper.reset_ping_failures();
            return (true, false);
        }

        stats.record_ping_failure();
        let failures = wrapper.record_ping_failure();
        warn!(
            guid = %wrapper.guid(),
            tenant = %key.tenant,
            device_id = %key.device_id,
            failures,
            "Liveness probe failed"
        );

        if failures < failure_threshold {
            return (false, false);
        }

        wrapper.close(CloseReason::Unresponsive);
        let removed = table.remove_if_bound(&key, wrapper.guid());
        info!(
            guid = %wrapper.guid(),
            tenant = %key.tenant,
            device_id = %key.device_id,
            "Unresponsive connection evicted"
        );
        (false, removed)
    });

    let results = join_all(probes).await;

    let mut report = SweepReport {
        probed: results.len(),
        ..SweepReport::default()
    };
    for (alive, evicted) in results {
        if alive {
            report.alive += 1;
        } else {
            report.failed += 1;
        }
        if evicted {
            report.evicted += 1;
            stats.record_evicted();
        }
    }

    report
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    use crate::identifiers::{IdentityKey, ProtocolVariant};
    use crate::services::{DeviceRecord, ResolvedIdentity, TenantRecord};
    use crate::transport::ConnectionWrapper;

    const PROBE: Duration = Duration::from_millis(50);

    fn identity(device: &str) -> ResolvedIdentity {
        ResolvedIdentity {
            tenant: TenantRecord {
                id: "T1".to_string(),
                name: "Tenant One".to_string(),
            },
            device: DeviceRecord::new(device),
        }
    }

    fn connect(
        device: &str,
        stats: &Arc<GatewayStats>,
    ) -> (Arc<Session>, Arc<ConnectionWrapper>, mpsc::Receiver<Message>) {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40002);
        let (wrapper, rx) = ConnectionWrapper::new(ProtocolVariant::Device, addr, 16, 2);
        let session = Session::new(
            identity(device),
            &wrapper,
            Duration::from_secs(5),
            8,
            Arc::clone(stats),
        );
        (Arc::new(session), wrapper, rx)
    }

    /// Simulates a peer that answers every ping.
    fn answer_pings(wrapper: &Arc<ConnectionWrapper>, mut rx: mpsc::Receiver<Message>) {
        let peer = Arc::clone(wrapper);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if matches!(message, Message::Ping(_)) {
                    peer.record_pong();
                }
            }
        });
    }

    #[tokio::test]
    async fn test_reconcile_empty_slot() {
        let stats = Arc::new(GatewayStats::new());
        let table = SessionTable::new();
        let (session, _wrapper, _rx) = connect("D1", &stats);

        let outcome = reconcile(&table, &session, PROBE, &stats).await;
        assert_eq!(outcome, Reconciliation::Registered);
        assert_eq!(
            table.bound_guid(&IdentityKey::new("T1", "D1")),
            Some(session.connection_guid())
        );

        let again = reconcile(&table, &session, PROBE, &stats).await;
        assert_eq!(again, Reconciliation::AlreadyCurrent);
    }

    #[tokio::test]
    async fn test_reconcile_closes_live_duplicate() {
        let stats = Arc::new(GatewayStats::new());
        let table = SessionTable::new();

        let (first, first_wrapper, first_rx) = connect("D1", &stats);
        answer_pings(&first_wrapper, first_rx);
        reconcile(&table, &first, PROBE, &stats).await;

        let (second, _second_wrapper, _rx) = connect("D1", &stats);
        let outcome = reconcile(&table, &second, Duration::from_secs(1), &stats).await;

        assert_eq!(outcome, Reconciliation::ClosedDuplicate);
        assert!(first_wrapper.is_closed());
        assert_eq!(first_wrapper.close_reason(), Some(CloseReason::Duplicate));
        assert_eq!(
            table.bound_guid(second.key()),
            Some(second.connection_guid())
        );
        assert_eq!(stats.snapshot().duplicates_closed, 1);
    }

    #[tokio::test]
    async fn test_reconcile_adopts_over_silent_peer() {
        let stats = Arc::new(GatewayStats::new());
        let table = SessionTable::new();

        let (first, first_wrapper, _first_rx) = connect("D1", &stats);
        reconcile(&table, &first, PROBE, &stats).await;

        let (second, _second_wrapper, _rx) = connect("D1", &stats);
        let outcome = reconcile(&table, &second, PROBE, &stats).await;

        assert_eq!(outcome, Reconciliation::AdoptedOverDead);
        assert!(!first_wrapper.is_closed());
        assert_eq!(
            table.bound_guid(second.key()),
            Some(second.connection_guid())
        );
        assert_eq!(stats.snapshot().duplicates_closed, 0);
    }

    #[tokio::test]
    async fn test_reconcile_replaces_closed() {
        let stats = Arc::new(GatewayStats::new());
        let table = SessionTable::new();

        let (first, first_wrapper, _first_rx) = connect("D1", &stats);
        reconcile(&table, &first, PROBE, &stats).await;
        first_wrapper.close(CloseReason::Normal);

        let (second, _second_wrapper, _rx) = connect("D1", &stats);
        let outcome = reconcile(&table, &second, PROBE, &stats).await;
        assert_eq!(outcome, Reconciliation::ReplacedClosed);
    }

    #[tokio::test]
    async fn test_sweep_evicts_after_threshold() {
        let stats = Arc::new(GatewayStats::new());
        let table = SessionTable::new();

        let (session, wrapper, _rx) = connect("D1", &stats);
        reconcile(&table, &session, PROBE, &stats).await;

        for _ in 0..2 {
            let report = sweep(&table, Duration::from_millis(10), 3, &stats).await;
            assert_eq!(report.failed, 1);
            assert_eq!(report.evicted, 0);
            assert!(!wrapper.is_closed());
        }

        let report = sweep(&table, Duration::from_millis(10), 3, &stats).await;
        assert_eq!(report.evicted, 1);
        assert!(wrapper.is_closed());
        assert_eq!(wrapper.close_reason(), Some(CloseReason::Unresponsive));
        assert!(table.is_empty());

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.ping_failures, 3);
        assert_eq!(snapshot.evicted, 1);
    }

    #[tokio::test]
    async fn test_sweep_resets_on_pong() {
        let stats = Arc::new(GatewayStats::new());
        let table = SessionTable::new();

        let (session, wrapper, rx) = connect("D1", &stats);
        reconcile(&table, &session, PROBE, &stats).await;
        wrapper.record_ping_failure();
        wrapper.record_ping_failure();
        answer_pings(&wrapper, rx);

        let report = sweep(&table, Duration::from_secs(1), 3, &stats).await;
        assert_eq!(report.alive, 1);
        assert_eq!(wrapper.ping_failures(), 0);
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_drops_orphaned_entry() {
        let stats = Arc::new(GatewayStats::new());
        let table = SessionTable::new();

        let (session, wrapper, rx) = connect("D1", &stats);
        reconcile(&table, &session, PROBE, &stats).await;
        drop(rx);
        drop(wrapper);

        let report = sweep(&table, PROBE, 3, &stats).await;
        assert_eq!(report.evicted, 1);
        assert!(table.is_empty());
    }
}

//! Connection Registry.
//!
//! Two identity-keyed tables, one per [`ProtocolVariant`], each mapping an
//! [`IdentityKey`] to the session currently considered authoritative.
//!
//! Tables are individually locked; there is no lock spanning both. Only
//! reconciliation (see [`crate::liveness`]) and close handling mutate them.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::identifiers::{ConnectionGuid, IdentityKey, ProtocolVariant};
use crate::session::Session;
use crate::transport::ConnectionWrapper;

// ============================================================================
// BoundSession
// ============================================================================

/// A registry value bound to one physical connection.
pub trait BoundSession: Send + Sync {
    /// Guid of the wrapper this session is bound to.
    fn connection_guid(&self) -> ConnectionGuid;

    /// The wrapper, if still alive.
    fn connection(&self) -> Option<Arc<ConnectionWrapper>>;
}

// ============================================================================
// SessionTable
// ============================================================================

/// Identity-keyed table of authoritative sessions.
#[derive(Debug)]
pub struct SessionTable<S> {
    entries: RwLock<FxHashMap<IdentityKey, Arc<S>>>,
}

impl<S> Default for SessionTable<S> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
        }
    }
}

impl<S: BoundSession> SessionTable<S> {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Authoritative session for `key`.
    #[must_use]
    pub fn get(&self, key: &IdentityKey) -> Option<Arc<S>> {
        self.entries.read().get(key).cloned()
    }

    /// Sets the entry for `key`, returning the previous one.
    pub fn insert(&self, key: IdentityKey, session: Arc<S>) -> Option<Arc<S>> {
        self.entries.write().insert(key, session)
    }

    /// Removes the entry only if it is still bound to `guid`.
    ///
    /// A slot already handed to a newer connection is left alone.
    pub fn remove_if_bound(&self, key: &IdentityKey, guid: ConnectionGuid) -> bool {
        let mut entries = self.entries.write();
        match entries.get(key) {
            Some(current) if current.connection_guid() == guid => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Guid of the wrapper bound to `key`, if any.
    #[must_use]
    pub fn bound_guid(&self, key: &IdentityKey) -> Option<ConnectionGuid> {
        self.entries.read().get(key).map(|s| s.connection_guid())
    }

    /// Copies every entry out, for sweeps and shutdown.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(IdentityKey, Arc<S>)> {
        self.entries
            .read()
            .iter()
            .map(|(key, session)| (key.clone(), Arc::clone(session)))
            .collect()
    }

    /// Removes and returns every entry.
    pub fn drain(&self) -> Vec<(IdentityKey, Arc<S>)> {
        self.entries.write().drain().collect()
    }

    /// Number of registered sessions.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the table is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

// ============================================================================
// ConnectionRegistry
// ============================================================================

/// Device and management tables.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    devices: SessionTable<Session>,
    management: SessionTable<Session>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Table for `variant`.
    #[inline]
    #[must_use]
    pub fn table(&self, variant: ProtocolVariant) -> &SessionTable<Session> {
        match variant {
            ProtocolVariant::Device => &self.devices,
            ProtocolVariant::Management => &self.management,
        }
    }

    /// Device table.
    #[inline]
    #[must_use]
    pub fn devices(&self) -> &SessionTable<Session> {
        &self.devices
    }

    /// Management table.
    #[inline]
    #[must_use]
    pub fn management(&self) -> &SessionTable<Session> {
        &self.management
    }

    /// Sessions across both tables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len() + self.management.len()
    }

    /// Whether both tables are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty() && self.management.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct Bound(ConnectionGuid);

    impl BoundSession for Bound {
        fn connection_guid(&self) -> ConnectionGuid {
            self.0
        }

        fn connection(&self) -> Option<Arc<ConnectionWrapper>> {
            None
        }
    }

    #[test]
    fn test_insert_replaces() {
        let table = SessionTable::new();
        let key = IdentityKey::new("T1", "D1");
        let first = ConnectionGuid::generate();
        let second = ConnectionGuid::generate();

        assert!(table.insert(key.clone(), Arc::new(Bound(first))).is_none());
        let previous = table.insert(key.clone(), Arc::new(Bound(second))).unwrap();

        assert_eq!(previous.0, first);
        assert_eq!(table.bound_guid(&key), Some(second));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_remove_if_bound_checks_guid() {
        let table = SessionTable::new();
        let key = IdentityKey::new("T1", "D1");
        let stale = ConnectionGuid::generate();
        let current = ConnectionGuid::generate();
        table.insert(key.clone(), Arc::new(Bound(current)));

        assert!(!table.remove_if_bound(&key, stale));
        assert_eq!(table.bound_guid(&key), Some(current));

        assert!(table.remove_if_bound(&key, current));
        assert!(table.is_empty());
        assert!(!table.remove_if_bound(&key, current));
    }

    #[test]
    fn test_snapshot_and_drain() {
        let table = SessionTable::new();
        table.insert(IdentityKey::new("T1", "D1"), Arc::new(Bound(ConnectionGuid::generate())));
        table.insert(IdentityKey::new("T1", "D2"), Arc::new(Bound(ConnectionGuid::generate())));

        assert_eq!(table.snapshot().len(), 2);
        assert_eq!(table.len(), 2);
        assert_eq!(table.drain().len(), 2);
        assert!(table.is_empty());
    }

    #[test]
    fn test_registry_tables_are_separate() {
        let registry = ConnectionRegistry::new();
        assert!(registry.is_empty());
        assert!(std::ptr::eq(
            registry.table(ProtocolVariant::Device),
            registry.devices()
        ));
        assert!(std::ptr::eq(
            registry.table(ProtocolVariant::Management),
            registry.management()
        ));
    }
}

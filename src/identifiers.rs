//! Type-safe identifiers for gateway entities.
//!
//! Newtype wrappers keep socket identity, protocol-level message IDs and
//! device identity apart at compile time.
//!
//! | Type | Scope |
//! |------|-------|
//! | [`ConnectionGuid`] | One physical socket, never reused |
//! | [`MessageId`] | One CALL and its CALL_RESULT/CALL_ERROR |
//! | [`IdentityKey`] | `(tenant, device)`, stable across reconnects |
//! | [`ProtocolVariant`] | Device or management connection |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// ConnectionGuid
// ============================================================================

/// Locally generated identifier of a physical socket.
///
/// Distinct from any protocol-level identity: two sockets opened by the same
/// device get two different guids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionGuid(Uuid);

impl ConnectionGuid {
    /// Generates a new random guid.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[inline]
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ConnectionGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// MessageId
// ============================================================================

/// Protocol message ID used to correlate a CALL with its response.
///
/// Peers choose their own IDs for incoming CALLs, so this is an opaque string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Generates a fresh ID for an outgoing CALL.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the ID as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// IdentityKey
// ============================================================================

/// Registry key: `(tenant, device id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey {
    /// Tenant identifier.
    pub tenant: String,
    /// Device identifier, scoped to the tenant.
    pub device_id: String,
}

impl IdentityKey {
    /// Creates a new identity key.
    #[inline]
    #[must_use]
    pub fn new(tenant: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            device_id: device_id.into(),
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.device_id)
    }
}

// ============================================================================
// ProtocolVariant
// ============================================================================

/// Which kind of peer a connection serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVariant {
    /// A charging station or other field unit.
    Device,
    /// An internal management client.
    Management,
}

impl ProtocolVariant {
    /// Returns the lowercase name used in logs.
    #[inline]
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::Management => "management",
        }
    }
}

impl fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_guid_unique() {
        let a = ConnectionGuid::generate();
        let b = ConnectionGuid::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_message_id_generate_unique() {
        let a = MessageId::generate();
        let b = MessageId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn test_message_id_serializes_as_string() {
        let id = MessageId::from("42");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"42\"");
    }

    #[test]
    fn test_identity_key_display() {
        let key = IdentityKey::new("T1", "D1");
        assert_eq!(key.to_string(), "T1/D1");
    }

    #[test]
    fn test_protocol_variant_display() {
        assert_eq!(ProtocolVariant::Device.to_string(), "device");
        assert_eq!(ProtocolVariant::Management.to_string(), "management");
    }
}

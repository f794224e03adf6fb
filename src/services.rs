//! External collaborators consumed by the gateway.
//!
//! The gateway resolves identities through a [`DirectoryService`] and hands
//! every decoded CALL to a [`CommandExecutor`]. Neither is implemented here
//! beyond [`StaticDirectory`], an in-memory table for embedding and tests.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::{Error, Result};
use crate::identifiers::{IdentityKey, MessageId, ProtocolVariant};
use crate::protocol::ErrorCode;

// ============================================================================
// Records
// ============================================================================

/// Tenant as known to the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRecord {
    /// Tenant identifier (matches the path segment).
    pub id: String,
    /// Display name.
    pub name: String,
}

/// Device as known to the directory.
///
/// Site and organization hints are only used for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Device identifier (matches the path segment).
    pub id: String,
    /// Site the device belongs to.
    #[serde(default)]
    pub site_id: Option<String>,
    /// Site area the device belongs to.
    #[serde(default)]
    pub site_area_id: Option<String>,
    /// Owning organization.
    #[serde(default)]
    pub company_id: Option<String>,
}

impl DeviceRecord {
    /// Creates a record without site hints.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            site_id: None,
            site_area_id: None,
            company_id: None,
        }
    }
}

/// Successful directory lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedIdentity {
    /// Tenant record.
    pub tenant: TenantRecord,
    /// Device record.
    pub device: DeviceRecord,
}

impl ResolvedIdentity {
    /// Returns the registry key for this identity.
    #[inline]
    #[must_use]
    pub fn key(&self) -> IdentityKey {
        IdentityKey::new(&self.tenant.id, &self.device.id)
    }
}

// ============================================================================
// DirectoryService
// ============================================================================

/// Resolves the `(tenant, token, device)` triple from a connection path.
#[async_trait]
pub trait DirectoryService: Send + Sync {
    /// Looks up the tenant and device and checks the token.
    ///
    /// # Errors
    ///
    /// Implementations return one of [`Error::UnknownTenant`],
    /// [`Error::UnknownDevice`], [`Error::InvalidToken`] or
    /// [`Error::Resolution`].
    async fn resolve(&self, tenant: &str, token: &str, device_id: &str)
    -> Result<ResolvedIdentity>;
}

// ============================================================================
// CommandExecutor
// ============================================================================

/// Context passed with every decoded CALL.
#[derive(Debug, Clone)]
pub struct CommandContext {
    /// Which kind of peer sent the CALL.
    pub variant: ProtocolVariant,
    /// Identity of the sending session.
    pub key: IdentityKey,
    /// Message ID the reply will carry.
    pub message_id: MessageId,
    /// Full directory records of the sender.
    pub identity: Arc<ResolvedIdentity>,
}

/// Domain failure reported by a [`CommandExecutor`].
///
/// Sent back to the peer as a CALL_ERROR frame; the connection stays open.
#[derive(Debug, Clone, Error)]
#[error("{code}: {description}")]
pub struct CommandError {
    /// Error code for the CALL_ERROR frame.
    pub code: ErrorCode,
    /// Human readable description.
    pub description: String,
    /// Free-form details.
    pub details: Value,
}

impl CommandError {
    /// Creates a command error with empty details.
    #[must_use]
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            details: Value::Object(Default::default()),
        }
    }

    /// Attaches a details object.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Shortcut for an unsupported command.
    #[must_use]
    pub fn not_implemented(command: &str) -> Self {
        Self::new(
            ErrorCode::NotImplemented,
            format!("Command '{command}' is not implemented"),
        )
    }
}

/// Interprets decoded CALL payloads.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Executes `command` and returns the CALL_RESULT payload.
    ///
    /// # Errors
    ///
    /// A [`CommandError`] is encoded as CALL_ERROR for the peer.
    async fn execute(
        &self,
        ctx: &CommandContext,
        command: &str,
        payload: Value,
    ) -> std::result::Result<Value, CommandError>;
}

// ============================================================================
// StaticDirectory
// ============================================================================

/// Registered device in a [`StaticDirectory`].
#[derive(Debug, Clone)]
struct StaticEntry {
    token: String,
    device: DeviceRecord,
}

/// In-memory [`DirectoryService`] backed by explicit registrations.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    tenants: RwLock<FxHashMap<String, TenantRecord>>,
    devices: RwLock<FxHashMap<IdentityKey, StaticEntry>>,
}

impl StaticDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tenant.
    pub fn add_tenant(&self, tenant: TenantRecord) {
        self.tenants.write().insert(tenant.id.clone(), tenant);
    }

    /// Registers a device under an existing or future tenant.
    pub fn add_device(&self, tenant_id: &str, token: impl Into<String>, device: DeviceRecord) {
        let key = IdentityKey::new(tenant_id, &device.id);
        self.devices.write().insert(
            key,
            StaticEntry {
                token: token.into(),
                device,
            },
        );
    }

    /// Removes a device; later connections for it fail resolution.
    pub fn remove_device(&self, tenant_id: &str, device_id: &str) -> bool {
        self.devices
            .write()
            .remove(&IdentityKey::new(tenant_id, device_id))
            .is_some()
    }
}

#[async_trait]
impl DirectoryService for StaticDirectory {
    async fn resolve(
        &self,
        tenant: &str,
        token: &str,
        device_id: &str,
    ) -> Result<ResolvedIdentity> {
        let tenant_record = self
            .tenants
            .read()
            .get(tenant)
            .cloned()
            .ok_or_else(|| Error::unknown_tenant(tenant))?;

        let entry = self
            .devices
            .read()
            .get(&IdentityKey::new(tenant, device_id))
            .cloned()
            .ok_or_else(|| Error::unknown_device(tenant, device_id))?;

        if entry.token != token {
            return Err(Error::invalid_token(tenant, device_id));
        }

        Ok(ResolvedIdentity {
            tenant: tenant_record,
            device: entry.device,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

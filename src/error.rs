//! Error types for the OCPP gateway.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use ocpp_gateway::{Result, Error};
//!
//! async fn example(session: &Session) -> Result<()> {
//!     let status = session.call("GetStatus", serde_json::json!({})).await?;
//!     println!("{status}");
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Handshake | [`Error::Handshake`] |
//! | Resolution | [`Error::UnknownTenant`], [`Error::UnknownDevice`], [`Error::InvalidToken`], [`Error::Resolution`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionClosed`], [`Error::SendDropped`], [`Error::SessionNotFound`] |
//! | Protocol | [`Error::Protocol`], [`Error::UnknownMessageType`], [`Error::UnknownMessageId`] |
//! | Call | [`Error::CallError`], [`Error::RequestTimeout`], [`Error::TooManyPending`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`], [`Error::Toml`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use serde_json::Value;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::{IdentityKey, MessageId};
use crate::protocol::ErrorCode;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when gateway configuration is invalid or incomplete.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Handshake Errors
    // ========================================================================
    /// Upgrade request rejected before a socket was accepted.
    #[error("Handshake rejected: {message}")]
    Handshake {
        /// Why the upgrade was refused.
        message: String,
    },

    // ========================================================================
    // Resolution Errors
    // ========================================================================
    /// Tenant in the connection path is unknown to the directory.
    #[error("Unknown tenant: {tenant}")]
    UnknownTenant {
        /// Tenant identifier from the path.
        tenant: String,
    },

    /// Device in the connection path is unknown to the directory.
    #[error("Unknown device: tenant={tenant}, device={device_id}")]
    UnknownDevice {
        /// Tenant identifier from the path.
        tenant: String,
        /// Device identifier from the path.
        device_id: String,
    },

    /// Token in the connection path does not authorize the device.
    #[error("Invalid token: tenant={tenant}, device={device_id}")]
    InvalidToken {
        /// Tenant identifier from the path.
        tenant: String,
        /// Device identifier from the path.
        device_id: String,
    },

    /// Directory service failure not covered by the other variants.
    #[error("Resolution failed: {message}")]
    Resolution {
        /// Description of the failure.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Transport-level connection failure.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// The wrapper was closed before or during the operation.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Outbound queue was full, frame not queued.
    #[error("Frame dropped: outbound queue full")]
    SendDropped,

    /// No authoritative session registered for the identity.
    #[error("Session not found: {key}")]
    SessionNotFound {
        /// Identity that was looked up.
        key: IdentityKey,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Malformed frame.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    /// Frame carried a message type other than CALL, CALL_RESULT or CALL_ERROR.
    #[error("Unknown message type: {message_type}")]
    UnknownMessageType {
        /// The raw type discriminator.
        message_type: u64,
    },

    /// Response for a request that is not pending (never sent, resolved, or timed out).
    #[error("Unknown message id: {message_id}")]
    UnknownMessageId {
        /// The unmatched message ID.
        message_id: MessageId,
    },

    // ========================================================================
    // Call Errors
    // ========================================================================
    /// Peer answered an outgoing CALL with CALL_ERROR.
    #[error("Call error {code}: {description}")]
    CallError {
        /// Error code sent by the peer.
        code: ErrorCode,
        /// Human readable description.
        description: String,
        /// Free-form details object.
        details: Value,
    },

    /// No CALL_RESULT or CALL_ERROR within the correlation timeout.
    #[error("Request {message_id} ({command}) timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// The message ID that timed out.
        message_id: MessageId,
        /// Command name of the CALL.
        command: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Too many outgoing CALLs in flight on one session.
    #[error("Too many pending requests: {pending}/{max}")]
    TooManyPending {
        /// Currently pending.
        pending: usize,
        /// Configured cap.
        max: usize,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Configuration file parse error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a handshake rejection error.
    #[inline]
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake {
            message: message.into(),
        }
    }

    /// Creates an unknown tenant error.
    #[inline]
    pub fn unknown_tenant(tenant: impl Into<String>) -> Self {
        Self::UnknownTenant {
            tenant: tenant.into(),
        }
    }

    /// Creates an unknown device error.
    #[inline]
    pub fn unknown_device(tenant: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self::UnknownDevice {
            tenant: tenant.into(),
            device_id: device_id.into(),
        }
    }

    /// Creates an invalid token error.
    #[inline]
    pub fn invalid_token(tenant: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self::InvalidToken {
            tenant: tenant.into(),
            device_id: device_id.into(),
        }
    }

    /// Creates a generic resolution error.
    #[inline]
    pub fn resolution(message: impl Into<String>) -> Self {
        Self::Resolution {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a session not found error.
    #[inline]
    pub fn session_not_found(key: IdentityKey) -> Self {
        Self::SessionNotFound { key }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates an unknown message id error.
    #[inline]
    pub fn unknown_message_id(message_id: MessageId) -> Self {
        Self::UnknownMessageId { message_id }
    }

    /// Creates a call error from a CALL_ERROR frame.
    #[inline]
    pub fn call_error(code: ErrorCode, description: impl Into<String>, details: Value) -> Self {
        Self::CallError {
            code,
            description: description.into(),
            details,
        }
    }

    /// Creates a request timeout error.
    #[inline]
    pub fn request_timeout(
        message_id: MessageId,
        command: impl Into<String>,
        timeout_ms: u64,
    ) -> Self {
        Self::RequestTimeout {
            message_id,
            command: command.into(),
            timeout_ms,
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::RequestTimeout { .. })
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionClosed
                | Self::SendDropped
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if the identity could not be resolved.
    #[inline]
    #[must_use]
    pub fn is_resolution_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownTenant { .. }
                | Self::UnknownDevice { .. }
                | Self::InvalidToken { .. }
                | Self::Resolution { .. }
        )
    }

    /// Returns `true` if this error is a protocol violation by the peer.
    ///
    /// Protocol errors drop the offending frame but keep the connection.
    #[inline]
    #[must_use]
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. }
                | Self::UnknownMessageType { .. }
                | Self::UnknownMessageId { .. }
                | Self::Json(_)
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = Error::connection("socket reset");
        assert_eq!(err.to_string(), "Connection failed: socket reset");
    }

    #[test]
    fn test_resolution_display() {
        let err = Error::unknown_device("T1", "D1");
        assert_eq!(err.to_string(), "Unknown device: tenant=T1, device=D1");
    }

    #[test]
    fn test_request_timeout_display() {
        let err = Error::request_timeout(MessageId::from("42"), "GetStatus", 100);
        assert_eq!(
            err.to_string(),
            "Request 42 (GetStatus) timed out after 100ms"
        );
    }

    #[test]
    fn test_is_timeout() {
        let timeout_err = Error::request_timeout(MessageId::from("1"), "Reset", 10);
        let other_err = Error::ConnectionClosed;

        assert!(timeout_err.is_timeout());
        assert!(!other_err.is_timeout());
    }

    #[test]
    fn test_is_resolution_error() {
        assert!(Error::unknown_tenant("T9").is_resolution_error());
        assert!(Error::invalid_token("T1", "D1").is_resolution_error());
        assert!(Error::resolution("directory offline").is_resolution_error());
        assert!(!Error::config("x").is_resolution_error());
    }

    #[test]
    fn test_is_connection_error() {
        assert!(Error::connection("test").is_connection_error());
        assert!(Error::ConnectionClosed.is_connection_error());
        assert!(Error::SendDropped.is_connection_error());
        assert!(!Error::config("test").is_connection_error());
    }

    #[test]
    fn test_is_protocol_error() {
        assert!(Error::protocol("not an array").is_protocol_error());
        assert!(Error::UnknownMessageType { message_type: 7 }.is_protocol_error());
        assert!(Error::unknown_message_id(MessageId::from("x")).is_protocol_error());
        assert!(!Error::ConnectionClosed.is_protocol_error());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::AddrInUse, "port taken");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}

//! OCPP-J wire protocol.
//!
//! Frames are UTF-8 JSON arrays exchanged over one WebSocket per peer.
//!
//! # Protocol Overview
//!
//! | Message Type | Direction | Purpose |
//! |--------------|-----------|---------|
//! | `CALL` | Either | Request carrying a command and payload |
//! | `CALL_RESULT` | Either | Successful reply to a CALL |
//! | `CALL_ERROR` | Either | Error reply to a CALL |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `error_code` | CALL_ERROR error codes |
//! | `frame` | Frame decoding and encoding |

// ============================================================================
// Submodules
// ============================================================================

/// CALL_ERROR error codes.
pub mod error_code;

/// Frame decoding and encoding.
pub mod frame;

// ============================================================================
// Re-exports
// ============================================================================

pub use error_code::ErrorCode;
pub use frame::{Frame, MessageType};

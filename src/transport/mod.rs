//! WebSocket transport layer.
//!
//! Everything that touches sockets: upgrade validation, the per-socket
//! wrapper with its writer task, and the listening server.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   upgrade    ┌──────────────────────────────────────┐
//! │  Charging    │─────────────►│  GatewayServer                       │
//! │  station     │  /OCPP16/…   │   handshake ─► ConnectionWrapper     │
//! └──────────────┘              │                 │  reader task       │
//! ┌──────────────┐   upgrade    │                 │  writer task       │
//! │  Management  │─────────────►│                 ▼                    │
//! │  client      │  /REST/…     │              Gateway (sessions)      │
//! └──────────────┘              └──────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `handshake` | Path and sub-protocol validation |
//! | `server` | Accept loop and per-connection tasks |
//! | `wrapper` | Per-socket handle and writer task |

// ============================================================================
// Submodules
// ============================================================================

/// Upgrade request validation.
pub mod handshake;

/// Listening server.
pub mod server;

/// Per-socket connection handle.
pub mod wrapper;

// ============================================================================
// Re-exports
// ============================================================================

pub use handshake::{RejectKind, Rejection, UpgradeTarget, validate_upgrade};
pub use server::GatewayServer;
pub use wrapper::{
    CloseReason, ConnectionState, ConnectionWrapper, SendOutcome, WrapperIdentity, run_writer,
};

//! OCPP Gateway - WebSocket front door for charging stations.
//!
//! Terminates persistent WebSocket connections from charging stations and
//! internal management clients, binds each to a tenant and device identity,
//! and speaks OCPP-J (`CALL`, `CALL_RESULT`, `CALL_ERROR`) over them.
//!
//! # Architecture
//!
//! ```text
//! accept ─► handshake ─► ConnectionWrapper ─► [Request-Lock] resolve ─► Session
//!                                                                      │
//!                                          reconcile ◄─────────────────┘
//!                                              │
//!                                              ▼
//!                                     ConnectionRegistry
//! ```
//!
//! Key design principles:
//!
//! - One [`ConnectionWrapper`] per physical socket; never reused
//! - One authoritative [`Session`] per identity key; the newest wins
//! - Liveness is proven by ping/pong, never by arrival order
//! - Nothing here retries: callers own retry policy
//!
//! # Quick Start
//!
//! ```ignore
//! use ocpp_gateway::{Gateway, GatewayServer, StaticDirectory, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let gateway = Gateway::builder()
//!         .directory(StaticDirectory::new())
//!         .executor(MyExecutor)
//!         .build()?;
//!
//!     let server = GatewayServer::bind(gateway).await?;
//!     println!("Listening on {}", server.ws_url());
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`config`] | Operational settings and [`GatewayBuilder`] |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`gateway`] | Connection lifecycle and dispatch |
//! | [`health`] | Liveness HTTP endpoint |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`liveness`] | Duplicate reconciliation and active sweep |
//! | [`lock`] | Path-keyed Request-Lock |
//! | [`protocol`] | OCPP-J frames and error codes |
//! | [`registry`] | Identity-keyed session tables |
//! | [`services`] | Directory and command executor traits |
//! | [`session`] | Per-peer pending request table |
//! | [`stats`] | Observability counters |
//! | [`transport`] | WebSocket server and per-socket handle |

// ============================================================================
// Modules
// ============================================================================

/// Operational settings and builder.
pub mod config;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Connection lifecycle, dispatch and close handling.
pub mod gateway;

/// Liveness HTTP endpoint.
pub mod health;

/// Type-safe identifiers for gateway entities.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// Duplicate reconciliation and active liveness sweep.
pub mod liveness;

/// Path-keyed Request-Lock.
pub mod lock;

/// OCPP-J wire protocol.
pub mod protocol;

/// Identity-keyed session tables.
pub mod registry;

/// External collaborators: directory service and command executor.
pub mod services;

/// Protocol-aware peer with its pending request table.
pub mod session;

/// Observability counters.
pub mod stats;

/// WebSocket transport layer.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Configuration
pub use config::{GatewayBuilder, GatewayConfig, KeepAliveMode};

// Error types
pub use error::{Error, Result};

// Gateway
pub use gateway::Gateway;

// Identifier types
pub use identifiers::{ConnectionGuid, IdentityKey, MessageId, ProtocolVariant};

// Protocol types
pub use protocol::{ErrorCode, Frame, MessageType};

// Services
pub use services::{
    CommandContext, CommandError, CommandExecutor, DeviceRecord, DirectoryService,
    ResolvedIdentity, StaticDirectory, TenantRecord,
};

// Session types
pub use registry::ConnectionRegistry;
pub use session::{PendingCall, Session};
pub use stats::{GatewayStats, StatsSnapshot};

// Transport types
pub use transport::{CloseReason, ConnectionWrapper, GatewayServer, SendOutcome};

//! Top-level gateway object.
//!
//! Owns the registry, the Request-Lock, the stats and the external
//! collaborators, and drives every connection through
//! `ACCEPTED → RESOLVING → BOUND → CLOSING → CLOSED`.
//!
//! The transport layer ([`crate::transport::GatewayServer`]) calls into
//! [`Gateway::open_connection`], [`Gateway::handle_message`] and
//! [`Gateway::connection_closed`]; embedders reach devices through
//! [`Gateway::call`].

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::config::{GatewayBuilder, GatewayConfig};
use crate::error::{Error, Result};
use crate::identifiers::{IdentityKey, MessageId, ProtocolVariant};
use crate::liveness::{self, SweepReport};
use crate::lock::RequestLock;
use crate::protocol::Frame;
use crate::registry::ConnectionRegistry;
use crate::services::{CommandContext, CommandExecutor, DirectoryService};
use crate::session::Session;
use crate::stats::GatewayStats;
use crate::transport::{
    CloseReason, ConnectionState, ConnectionWrapper, SendOutcome, UpgradeTarget, WrapperIdentity,
};

// ============================================================================
// Gateway
// ============================================================================

/// Connection lifecycle, dispatch and registry owner.
///
/// Cheap to share: hold it in an `Arc` and pass it to every socket task.
pub struct Gateway {
    config: GatewayConfig,
    registry: ConnectionRegistry,
    request_lock: RequestLock,
    directory: Arc<dyn DirectoryService>,
    executor: Arc<dyn CommandExecutor>,
    stats: Arc<GatewayStats>,
    started_at: Instant,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("devices", &self.registry.devices().len())
            .field("management", &self.registry.management().len())
            .field("keep_alive", &self.config.keep_alive)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Gateway - Constructor & Accessors
// ============================================================================

impl Gateway {
    /// Creates a gateway builder.
    #[inline]
    #[must_use]
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    /// Creates a gateway from validated parts. Prefer [`Gateway::builder`].
    #[must_use]
    pub fn new(
        config: GatewayConfig,
        directory: Arc<dyn DirectoryService>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Arc<Self> {
        let stats = Arc::new(GatewayStats::new());
        let request_lock = RequestLock::new(
            config.lock_retry_count,
            config.lock_retry_interval(),
            config.lock_alarm_threshold,
            Arc::clone(&stats),
        );

        Arc::new(Self {
            config,
            registry: ConnectionRegistry::new(),
            request_lock,
            directory,
            executor,
            stats,
            started_at: Instant::now(),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Configuration in effect.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Connection registry.
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Shared counters.
    #[inline]
    #[must_use]
    pub fn stats(&self) -> &Arc<GatewayStats> {
        &self.stats
    }

    /// Request-Lock.
    #[inline]
    #[must_use]
    pub fn request_lock(&self) -> &RequestLock {
        &self.request_lock
    }

    /// When the gateway was created.
    #[inline]
    #[must_use]
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Whether [`Gateway::shutdown`] has been called.
    #[inline]
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Authoritative session for `key`.
    #[must_use]
    pub fn session(&self, variant: ProtocolVariant, key: &IdentityKey) -> Option<Arc<Session>> {
        self.registry.table(variant).get(key)
    }
}

// ============================================================================
// Gateway - Connection Initialization
// ============================================================================

impl Gateway {
    /// Resolves, binds and registers a freshly accepted connection.
    ///
    /// Holds the Request-Lock for `target.raw_path` throughout. On success
    /// the wrapper is `Bound` and its session is in the registry.
    ///
    /// # Errors
    ///
    /// - a resolution error, after closing the wrapper with
    ///   [`CloseReason::ResolutionFailed`]
    /// - [`Error::ConnectionClosed`] if the socket closed before binding or
    ///   the gateway is shutting down; nothing is registered
    pub async fn open_connection(
        &self,
        wrapper: &Arc<ConnectionWrapper>,
        target: &UpgradeTarget,
    ) -> Result<Arc<Session>> {
        let guard = self.request_lock.acquire(&target.raw_path).await;

        if wrapper.is_closed() || self.refuse_during_shutdown(wrapper) {
            return Err(Error::ConnectionClosed);
        }
        wrapper.set_state(ConnectionState::Resolving);

        let identity = match self
            .directory
            .resolve(&target.tenant, &target.token, &target.device_id)
            .await
        {
            Ok(identity) => identity,
            Err(e) => {
                self.stats.record_resolution_failed();
                warn!(
                    guid = %wrapper.guid(),
                    tenant = %target.tenant,
                    device_id = %target.device_id,
                    variant = %target.variant,
                    remote_addr = %wrapper.remote_addr(),
                    error = %e,
                    "Identity resolution failed"
                );
                wrapper.close(CloseReason::ResolutionFailed);
                return Err(e);
            }
        };

        if wrapper.is_closed() {
            debug!(
                guid = %wrapper.guid(),
                tenant = %target.tenant,
                device_id = %target.device_id,
                "Connection closed during resolution, abandoning"
            );
            return Err(Error::ConnectionClosed);
        }
        if self.refuse_during_shutdown(wrapper) {
            return Err(Error::ConnectionClosed);
        }

        let session = Arc::new(Session::new(
            identity,
            wrapper,
            self.config.call_timeout(),
            self.config.max_pending_requests,
            Arc::clone(&self.stats),
        ));
        wrapper.bind_identity(WrapperIdentity::from(session.identity().as_ref()));

        let outcome = liveness::reconcile(
            self.registry.table(session.variant()),
            &session,
            self.config.probe_timeout(),
            &self.stats,
        )
        .await;

        // Shutdown may have drained the registry while reconciling.
        if self.refuse_during_shutdown(wrapper) {
            self.registry
                .table(session.variant())
                .remove_if_bound(session.key(), wrapper.guid());
            return Err(Error::ConnectionClosed);
        }

        wrapper.set_state(ConnectionState::Bound);
        self.stats.record_resolved();

        let device = &session.identity().device;
        info!(
            guid = %wrapper.guid(),
            tenant = %session.key().tenant,
            device_id = %session.key().device_id,
            variant = %session.variant(),
            remote_addr = %wrapper.remote_addr(),
            site_id = device.site_id.as_deref().unwrap_or("-"),
            company_id = device.company_id.as_deref().unwrap_or("-"),
            ?outcome,
            locked = guard.is_owned(),
            "Connection resolved"
        );

        Ok(session)
    }

    /// Closes `wrapper` with [`CloseReason::Shutdown`] if shutdown started.
    fn refuse_during_shutdown(&self, wrapper: &ConnectionWrapper) -> bool {
        if !self.is_shutting_down() {
            return false;
        }
        wrapper.close(CloseReason::Shutdown);
        debug!(guid = %wrapper.guid(), "Gateway shutting down, connection not registered");
        true
    }
}

// ============================================================================
// Gateway - Incoming Frames
// ============================================================================

impl Gateway {
    /// Decodes and dispatches one text frame.
    ///
    /// Protocol violations are logged and the frame dropped; the connection
    /// stays open.
    pub async fn handle_message(
        self: &Arc<Self>,
        session: &Arc<Session>,
        raw_path: &str,
        text: &str,
    ) {
        self.dispatch(session, raw_path, Frame::decode(text)).await;
    }

    /// Decodes a binary frame as UTF-8 text and dispatches it.
    pub async fn handle_binary(
        self: &Arc<Self>,
        session: &Arc<Session>,
        raw_path: &str,
        data: &[u8],
    ) {
        self.dispatch(session, raw_path, Frame::decode_binary(data)).await;
    }

    async fn dispatch(self: &Arc<Self>, session: &Arc<Session>, raw_path: &str, frame: Result<Frame>) {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.record_protocol_error();
                warn!(
                    guid = %session.connection_guid(),
                    tenant = %session.key().tenant,
                    device_id = %session.key().device_id,
                    error = %e,
                    "Dropping malformed frame"
                );
                return;
            }
        };

        trace_frame(session, &frame);
        self.ensure_registered(session).await;

        match frame {
            Frame::Call {
                id,
                command,
                payload,
            } => {
                if session.take_first_call() {
                    let _guard = self.request_lock.acquire(raw_path).await;
                    self.execute_call(session, id, command, payload).await;
                } else {
                    let gateway = Arc::clone(self);
                    let session = Arc::clone(session);
                    tokio::spawn(async move {
                        gateway.execute_call(&session, id, command, payload).await;
                    });
                }
            }
            Frame::CallResult { id, payload } => {
                session.resolve(&id, payload);
            }
            Frame::CallError {
                id,
                code,
                description,
                details,
            } => {
                session.reject(&id, code, description, details);
            }
        }
    }

    /// Re-runs reconciliation if the registry slot points at another wrapper.
    async fn ensure_registered(&self, session: &Arc<Session>) {
        if session.is_connection_closed() {
            return;
        }

        let table = self.registry.table(session.variant());
        if table.bound_guid(session.key()) == Some(session.connection_guid()) {
            return;
        }

        debug!(
            guid = %session.connection_guid(),
            key = %session.key(),
            "Frame from connection not in registry, reconciling"
        );
        liveness::reconcile(table, session, self.config.probe_timeout(), &self.stats).await;
    }

    async fn execute_call(&self, session: &Session, id: MessageId, command: String, payload: Value) {
        let Some(wrapper) = session.connection() else {
            return;
        };

        let ctx = CommandContext {
            variant: session.variant(),
            key: session.key().clone(),
            message_id: id.clone(),
            identity: Arc::clone(session.identity()),
        };

        let reply = match self.executor.execute(&ctx, &command, payload).await {
            Ok(result) => Frame::call_result(id, result),
            Err(e) => {
                debug!(
                    guid = %wrapper.guid(),
                    message_id = %id,
                    %command,
                    error = %e,
                    "Command failed, answering CALL_ERROR"
                );
                Frame::call_error(id, e.code, e.description, e.details)
            }
        };

        match wrapper.send_frame(&reply) {
            Ok(SendOutcome::Dropped) => {
                warn!(guid = %wrapper.guid(), message_id = %reply.id(), %command, "Reply dropped");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(guid = %wrapper.guid(), message_id = %reply.id(), error = %e, "Reply encoding failed");
            }
        }
    }
}

fn trace_frame(session: &Session, frame: &Frame) {
    trace!(
        guid = %session.connection_guid(),
        key = %session.key(),
        message_id = %frame.id(),
        message_type = ?frame.message_type(),
        "Frame received"
    );
}

// ============================================================================
// Gateway - Close Handling
// ============================================================================

impl Gateway {
    /// Handles the end of a socket, whatever the cause.
    ///
    /// Idempotent: the registry entry is removed only if still bound to this
    /// wrapper, pending calls are failed, and the close is counted once.
    pub fn connection_closed(&self, wrapper: &Arc<ConnectionWrapper>, session: Option<&Arc<Session>>) {
        wrapper.close(CloseReason::Normal);

        if let Some(session) = session {
            self.registry
                .table(session.variant())
                .remove_if_bound(session.key(), wrapper.guid());
            session.fail_pending();
        }

        if wrapper.finish() {
            self.stats.record_closed();
            let reason = wrapper.close_reason().unwrap_or(CloseReason::Normal);
            info!(
                guid = %wrapper.guid(),
                variant = %wrapper.variant(),
                remote_addr = %wrapper.remote_addr(),
                key = ?wrapper.identity().map(|identity| identity.key.to_string()),
                %reason,
                connected_secs = wrapper.connected_at().elapsed().as_secs(),
                "Connection closed"
            );
        }
    }

    /// Stops binding new connections and closes every registered one with
    /// [`CloseReason::Shutdown`]. Returns how many were closed.
    ///
    /// Connections still resolving are closed when their resolution ends.
    pub fn shutdown(&self) -> usize {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.close_all(CloseReason::Shutdown)
    }

    /// Closes every registered connection with `reason` and empties the
    /// registry. Returns how many were closed.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let mut closed = 0;
        for variant in [ProtocolVariant::Device, ProtocolVariant::Management] {
            for (_, session) in self.registry.table(variant).drain() {
                if let Some(wrapper) = session.connection()
                    && wrapper.close(reason)
                {
                    closed += 1;
                }
            }
        }
        closed
    }
}

// ============================================================================
// Gateway - Outgoing Calls & Liveness
// ============================================================================

impl Gateway {
    /// Sends a CALL to the authoritative session for `key` and awaits it.
    ///
    /// # Errors
    ///
    /// - [`Error::SessionNotFound`] if no session is registered
    /// - otherwise as [`Session::call`]
    pub async fn call(
        &self,
        variant: ProtocolVariant,
        key: &IdentityKey,
        command: &str,
        payload: Value,
    ) -> Result<Value> {
        let session = self
            .session(variant, key)
            .ok_or_else(|| Error::session_not_found(key.clone()))?;
        session.call(command, payload).await
    }

    /// Runs one active liveness sweep over both tables.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for variant in [ProtocolVariant::Device, ProtocolVariant::Management] {
            let partial = liveness::sweep(
                self.registry.table(variant),
                self.config.probe_timeout(),
                self.config.ping_failure_threshold,
                &self.stats,
            )
            .await;
            report.probed += partial.probed;
            report.alive += partial.alive;
            report.failed += partial.failed;
            report.evicted += partial.evicted;
        }

        if report.probed > 0 {
            debug!(
                probed = report.probed,
                alive = report.alive,
                failed = report.failed,
                evicted = report.evicted,
                "Liveness sweep finished"
            );
        }
        report
    }
}

// ============================================================================
// Tests
// ============================================================================

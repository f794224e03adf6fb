//! Protocol-aware peer for one device or management client.
//!
//! A [`Session`] owns the table of outgoing CALLs awaiting a reply and
//! correlates incoming CALL_RESULT / CALL_ERROR frames against it.
//!
//! # Correlation
//!
//! Each pending entry is removed exactly once, by whichever comes first:
//!
//! - a matching CALL_RESULT ([`Session::resolve`])
//! - a matching CALL_ERROR ([`Session::reject`])
//! - its timeout timer
//! - the connection closing ([`Session::fail_pending`])
//!
//! Removal from the table is the only way to reach the entry's sender, so a
//! late response for a timed-out ID finds nothing and is reported as unknown.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{ConnectionGuid, IdentityKey, MessageId, ProtocolVariant};
use crate::protocol::{ErrorCode, Frame};
use crate::registry::BoundSession;
use crate::services::ResolvedIdentity;
use crate::stats::GatewayStats;
use crate::transport::{ConnectionWrapper, SendOutcome};

// ============================================================================
// Types
// ============================================================================

/// Outgoing CALL awaiting its reply.
struct PendingRequest {
    /// Command name, for logs and timeout errors.
    command: String,
    /// When the CALL was queued.
    issued_at: Instant,
    /// Completes the caller's [`PendingCall`].
    response_tx: oneshot::Sender<Result<Value>>,
    /// Timeout timer, aborted on resolution.
    timer: AbortHandle,
}

/// Map of message IDs to pending requests.
type PendingMap = FxHashMap<MessageId, PendingRequest>;

// ============================================================================
// PendingCall
// ============================================================================

/// Handle to an outgoing CALL.
///
/// Completes with the CALL_RESULT payload, or an error for CALL_ERROR,
/// timeout or connection close.
#[derive(Debug)]
pub struct PendingCall {
    message_id: MessageId,
    command: String,
    response_rx: oneshot::Receiver<Result<Value>>,
}

impl PendingCall {
    /// Message ID the CALL was sent with.
    #[inline]
    #[must_use]
    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    /// Command name of the CALL.
    #[inline]
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Waits for the reply.
    ///
    /// # Errors
    ///
    /// - [`Error::CallError`] if the peer answered with CALL_ERROR
    /// - [`Error::RequestTimeout`] if no reply arrived in time
    /// - [`Error::ConnectionClosed`] if the connection closed first
    pub async fn response(self) -> Result<Value> {
        match self.response_rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionClosed),
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Logical peer bound to one wrapper.
///
/// Holds only a weak reference to its wrapper: the socket task owns the
/// wrapper's lifecycle, the session merely sends through it.
pub struct Session {
    /// Registry key.
    key: IdentityKey,
    /// Device or management.
    variant: ProtocolVariant,
    /// Directory records, shared with command contexts.
    identity: Arc<ResolvedIdentity>,
    /// Guid of the bound wrapper.
    connection_guid: ConnectionGuid,
    /// Back-reference used for sending.
    connection: Weak<ConnectionWrapper>,
    /// Outgoing CALLs awaiting a reply.
    pending: Arc<Mutex<PendingMap>>,
    /// Correlation timeout.
    call_timeout: Duration,
    /// Cap on `pending`.
    max_pending: usize,
    /// Set once the first incoming CALL has been taken.
    first_call_taken: AtomicBool,
    /// Shared counters.
    stats: Arc<GatewayStats>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("variant", &self.variant)
            .field("connection_guid", &self.connection_guid)
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Session - Constructor & Accessors
// ============================================================================

impl Session {
    /// Creates a session bound to `connection`.
    #[must_use]
    pub fn new(
        identity: ResolvedIdentity,
        connection: &Arc<ConnectionWrapper>,
        call_timeout: Duration,
        max_pending: usize,
        stats: Arc<GatewayStats>,
    ) -> Self {
        Self {
            key: identity.key(),
            variant: connection.variant(),
            identity: Arc::new(identity),
            connection_guid: connection.guid(),
            connection: Arc::downgrade(connection),
            pending: Arc::new(Mutex::new(PendingMap::default())),
            call_timeout,
            max_pending,
            first_call_taken: AtomicBool::new(false),
            stats,
        }
    }

    /// Registry key.
    #[inline]
    #[must_use]
    pub fn key(&self) -> &IdentityKey {
        &self.key
    }

    /// Protocol variant.
    #[inline]
    #[must_use]
    pub fn variant(&self) -> ProtocolVariant {
        self.variant
    }

    /// Directory records.
    #[inline]
    #[must_use]
    pub fn identity(&self) -> &Arc<ResolvedIdentity> {
        &self.identity
    }

    /// Guid of the bound wrapper.
    #[inline]
    #[must_use]
    pub fn connection_guid(&self) -> ConnectionGuid {
        self.connection_guid
    }

    /// Bound wrapper, if the socket task still holds it.
    #[inline]
    #[must_use]
    pub fn connection(&self) -> Option<Arc<ConnectionWrapper>> {
        self.connection.upgrade()
    }

    /// Returns `true` if the wrapper is gone or closed.
    #[must_use]
    pub fn is_connection_closed(&self) -> bool {
        self.connection().is_none_or(|wrapper| wrapper.is_closed())
    }

    /// Number of outgoing CALLs awaiting a reply.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether `message_id` is awaiting a reply.
    #[must_use]
    pub fn is_pending(&self, message_id: &MessageId) -> bool {
        self.pending.lock().contains_key(message_id)
    }

    /// Returns `true` exactly once, for the first incoming CALL.
    pub(crate) fn take_first_call(&self) -> bool {
        !self.first_call_taken.swap(true, Ordering::AcqRel)
    }
}

impl BoundSession for Session {
    fn connection_guid(&self) -> ConnectionGuid {
        self.connection_guid
    }

    fn connection(&self) -> Option<Arc<ConnectionWrapper>> {
        self.connection.upgrade()
    }
}

// ============================================================================
// Session - Outgoing CALL
// ============================================================================

impl Session {
    /// Sends a CALL and waits for its reply.
    ///
    /// # Errors
    ///
    /// As [`Session::send_call`] and [`PendingCall::response`].
    pub async fn call(&self, command: impl Into<String>, payload: Value) -> Result<Value> {
        self.send_call(command, payload)?.response().await
    }

    /// Sends a CALL and returns a handle to its reply.
    ///
    /// Registers the pending entry and arms its timeout before queueing.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the wrapper is gone or closed
    /// - [`Error::TooManyPending`] if the pending table is full
    /// - [`Error::SendDropped`] if the outbound queue rejected the frame
    pub fn send_call(&self, command: impl Into<String>, payload: Value) -> Result<PendingCall> {
        let wrapper = self
            .connection()
            .filter(|wrapper| !wrapper.is_closed())
            .ok_or(Error::ConnectionClosed)?;

        let command = command.into();
        let message_id = MessageId::generate();
        let text = Frame::call(message_id.clone(), command.clone(), payload).encode()?;
        let (response_tx, response_rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock();
            if pending.len() >= self.max_pending {
                warn!(
                    key = %self.key,
                    pending = pending.len(),
                    max = self.max_pending,
                    "Too many pending requests"
                );
                return Err(Error::TooManyPending {
                    pending: pending.len(),
                    max: self.max_pending,
                });
            }

            let timer = self.arm_timeout(message_id.clone());
            pending.insert(
                message_id.clone(),
                PendingRequest {
                    command: command.clone(),
                    issued_at: Instant::now(),
                    response_tx,
                    timer,
                },
            );
        }

        if wrapper.send_text(text) == SendOutcome::Dropped {
            if let Some(request) = self.pending.lock().remove(&message_id) {
                request.timer.abort();
            }
            return Err(Error::SendDropped);
        }

        trace!(key = %self.key, %message_id, %command, "CALL sent");

        Ok(PendingCall {
            message_id,
            command,
            response_rx,
        })
    }

    /// Spawns the timer that expires `message_id`.
    fn arm_timeout(&self, message_id: MessageId) -> AbortHandle {
        let pending = Arc::clone(&self.pending);
        let stats = Arc::clone(&self.stats);
        let key = self.key.clone();
        let call_timeout = self.call_timeout;
        let timeout_ms = duration_ms(call_timeout);

        tokio::spawn(async move {
            tokio::time::sleep(call_timeout).await;

            let Some(request) = pending.lock().remove(&message_id) else {
                return;
            };

            stats.record_timed_out();
            warn!(
                %key,
                %message_id,
                command = %request.command,
                timeout_ms,
                "CALL timed out"
            );

            let _ = request.response_tx.send(Err(Error::request_timeout(
                message_id,
                request.command,
                timeout_ms,
            )));
        })
        .abort_handle()
    }
}

/// Milliseconds in `duration`, saturating.
fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// Session - Incoming Responses
// ============================================================================

impl Session {
    /// Completes the pending CALL `message_id` with `payload`.
    ///
    /// Returns `false` (and logs) if the ID is not pending.
    pub fn resolve(&self, message_id: &MessageId, payload: Value) -> bool {
        match self.take_pending(message_id) {
            Some(request) => {
                debug!(
                    key = %self.key,
                    %message_id,
                    command = %request.command,
                    elapsed_ms = duration_ms(request.issued_at.elapsed()),
                    "CALL_RESULT received"
                );
                let _ = request.response_tx.send(Ok(payload));
                true
            }
            None => false,
        }
    }

    /// Fails the pending CALL `message_id` with a structured protocol error.
    ///
    /// Returns `false` (and logs) if the ID is not pending.
    pub fn reject(
        &self,
        message_id: &MessageId,
        code: ErrorCode,
        description: String,
        details: Value,
    ) -> bool {
        match self.take_pending(message_id) {
            Some(request) => {
                debug!(
                    key = %self.key,
                    %message_id,
                    command = %request.command,
                    %code,
                    "CALL_ERROR received"
                );
                let _ = request
                    .response_tx
                    .send(Err(Error::call_error(code, description, details)));
                true
            }
            None => false,
        }
    }

    /// Completes every pending CALL with [`Error::ConnectionClosed`].
    pub fn fail_pending(&self) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let count = drained.len();

        for (_, request) in drained {
            request.timer.abort();
            let _ = request.response_tx.send(Err(Error::ConnectionClosed));
        }

        if count > 0 {
            debug!(key = %self.key, count, "Failed pending requests on close");
        }
        count
    }

    fn take_pending(&self, message_id: &MessageId) -> Option<PendingRequest> {
        let request = self.pending.lock().remove(message_id);
        match request {
            Some(request) => {
                request.timer.abort();
                Some(request)
            }
            None => {
                self.stats.record_unknown_response();
                warn!(key = %self.key, %message_id, "Response for unknown message id");
                None
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

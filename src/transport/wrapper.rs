//! Per-socket connection handle.
//!
//! A [`ConnectionWrapper`] is the transport-facing half of a connection:
//! identity fields, timestamps, the ping failure counter, the monotonic
//! closed flag and non-blocking send/ping/close primitives.
//!
//! # Outbound Path
//!
//! Frames are never written from the caller's task. They are pushed into a
//! bounded queue drained by a writer task, so sending is non-blocking and
//! reports a tri-state [`SendOutcome`] instead of awaiting the socket.
//!
//! ```text
//! Session / Gateway ──try_send──► [bounded queue] ──► writer task ──► socket
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures_util::{Sink, SinkExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::identifiers::{ConnectionGuid, IdentityKey, ProtocolVariant};
use crate::protocol::Frame;
use crate::services::ResolvedIdentity;

// ============================================================================
// Constants
// ============================================================================

/// Upper bound for flushing the close frame to a peer that may be gone.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// SendOutcome
// ============================================================================

/// Result of a non-blocking send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Queued with room to spare.
    Sent,
    /// Queued, but the outbound buffer is filling up; slow down.
    Backpressure,
    /// Not queued: buffer full or wrapper closed.
    Dropped,
}

impl SendOutcome {
    /// Returns `true` if the frame will be written.
    #[inline]
    #[must_use]
    pub const fn is_queued(&self) -> bool {
        !matches!(self, Self::Dropped)
    }
}

// ============================================================================
// CloseReason
// ============================================================================

/// Why a wrapper was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed or the socket ended.
    Normal,
    /// A newer socket for the same identity replaced a live one.
    Duplicate,
    /// Too many consecutive failed liveness probes.
    Unresponsive,
    /// Directory lookup failed.
    ResolutionFailed,
    /// No traffic within the idle timeout.
    IdleTimeout,
    /// Read or write failure on the socket.
    TransportError,
    /// Gateway is shutting down.
    Shutdown,
}

impl CloseReason {
    /// WebSocket close code sent to the peer.
    #[must_use]
    pub const fn code(&self) -> CloseCode {
        match self {
            Self::Normal => CloseCode::Normal,
            Self::Duplicate | Self::Unresponsive | Self::TransportError => CloseCode::Error,
            Self::ResolutionFailed => CloseCode::Policy,
            Self::IdleTimeout | Self::Shutdown => CloseCode::Away,
        }
    }

    /// Short reason text sent with the close frame.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Duplicate => "duplicate connection",
            Self::Unresponsive => "unresponsive",
            Self::ResolutionFailed => "identity resolution failed",
            Self::IdleTimeout => "idle timeout",
            Self::TransportError => "transport error",
            Self::Shutdown => "shutdown",
        }
    }

    /// Returns `true` for closes the gateway treats as abnormal.
    #[must_use]
    pub const fn is_abnormal(&self) -> bool {
        !matches!(self, Self::Normal | Self::Shutdown)
    }

    fn frame(self) -> CloseFrame {
        CloseFrame {
            code: self.code(),
            reason: String::from(self.as_str()).into(),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ConnectionState
// ============================================================================

/// Initialization and teardown state of a connection.
///
/// `Accepted → Resolving → Bound → Closing → Closed`; `Resolving → Closed`
/// when the socket drops or resolution fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket upgraded, protocol variant known.
    Accepted,
    /// Waiting on the directory service.
    Resolving,
    /// Session created and registered.
    Bound,
    /// Close requested, transport teardown in progress.
    Closing,
    /// Close handled; terminal.
    Closed,
}

// ============================================================================
// WrapperIdentity
// ============================================================================

/// Identity copied onto the wrapper after resolution, for logs only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapperIdentity {
    /// Registry key.
    pub key: IdentityKey,
    /// Site hint.
    pub site_id: Option<String>,
    /// Site area hint.
    pub site_area_id: Option<String>,
    /// Organization hint.
    pub company_id: Option<String>,
}

impl From<&ResolvedIdentity> for WrapperIdentity {
    fn from(identity: &ResolvedIdentity) -> Self {
        Self {
            key: identity.key(),
            site_id: identity.device.site_id.clone(),
            site_area_id: identity.device.site_area_id.clone(),
            company_id: identity.device.company_id.clone(),
        }
    }
}

// ============================================================================
// ConnectionWrapper
// ============================================================================

/// Handle around one physical WebSocket.
///
/// # Thread Safety
///
/// `ConnectionWrapper` is `Send + Sync`; every field is individually
/// synchronized and no method blocks on the socket.
pub struct ConnectionWrapper {
    /// Unique per physical socket.
    guid: ConnectionGuid,
    /// Device or management.
    variant: ProtocolVariant,
    /// Peer address.
    remote_addr: SocketAddr,
    /// When the socket was accepted.
    connected_at: Instant,
    /// Queue drained by the writer task.
    outbound: mpsc::Sender<Message>,
    /// Remaining capacity below which sends report backpressure.
    backpressure_watermark: usize,
    /// Lifecycle state.
    state: Mutex<ConnectionState>,
    /// Resolved identity, if any.
    identity: RwLock<Option<WrapperIdentity>>,
    /// Last ping sent.
    last_ping: Mutex<Option<Instant>>,
    /// Last pong received.
    last_pong: Mutex<Option<Instant>>,
    /// Consecutive failed probes.
    ping_failures: AtomicU32,
    /// Payload counter for pings.
    ping_seq: AtomicU64,
    /// Bumped on every pong; probes wait for a change.
    pong_tx: watch::Sender<u64>,
    /// Monotonic closed flag.
    closed_tx: watch::Sender<bool>,
    /// First close reason, kept for the close frame.
    close_reason: Mutex<Option<CloseReason>>,
}

impl fmt::Debug for ConnectionWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionWrapper")
            .field("guid", &self.guid)
            .field("variant", &self.variant)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// ConnectionWrapper - Constructor
// ============================================================================

impl ConnectionWrapper {
    /// Creates a wrapper and the receiving end of its outbound queue.
    ///
    /// The receiver belongs to the writer task (see [`run_writer`]).
    #[must_use]
    pub fn new(
        variant: ProtocolVariant,
        remote_addr: SocketAddr,
        queue_capacity: usize,
        backpressure_watermark: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (outbound, outbound_rx) = mpsc::channel(queue_capacity.max(1));
        let (pong_tx, _) = watch::channel(0);
        let (closed_tx, _) = watch::channel(false);

        let wrapper = Arc::new(Self {
            guid: ConnectionGuid::generate(),
            variant,
            remote_addr,
            connected_at: Instant::now(),
            outbound,
            backpressure_watermark,
            state: Mutex::new(ConnectionState::Accepted),
            identity: RwLock::new(None),
            last_ping: Mutex::new(None),
            last_pong: Mutex::new(None),
            ping_failures: AtomicU32::new(0),
            ping_seq: AtomicU64::new(0),
            pong_tx,
            closed_tx,
            close_reason: Mutex::new(None),
        });

        (wrapper, outbound_rx)
    }
}

// ============================================================================
// ConnectionWrapper - Accessors
// ============================================================================

impl ConnectionWrapper {
    /// Socket guid.
    #[inline]
    #[must_use]
    pub fn guid(&self) -> ConnectionGuid {
        self.guid
    }

    /// Protocol variant.
    #[inline]
    #[must_use]
    pub fn variant(&self) -> ProtocolVariant {
        self.variant
    }

    /// Peer address.
    #[inline]
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// When the socket was accepted.
    #[inline]
    #[must_use]
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Current lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Moves to `state` unless already closing or closed.
    pub(crate) fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.lock();
        if !matches!(*current, ConnectionState::Closing | ConnectionState::Closed) {
            *current = state;
        }
    }

    /// Identity copied on after resolution.
    #[must_use]
    pub fn identity(&self) -> Option<WrapperIdentity> {
        self.identity.read().clone()
    }

    /// Copies the resolved identity onto the wrapper.
    pub(crate) fn bind_identity(&self, identity: WrapperIdentity) {
        *self.identity.write() = Some(identity);
    }

    /// Last ping sent.
    #[must_use]
    pub fn last_ping(&self) -> Option<Instant> {
        *self.last_ping.lock()
    }

    /// Last pong received.
    #[must_use]
    pub fn last_pong(&self) -> Option<Instant> {
        *self.last_pong.lock()
    }
}

// ============================================================================
// ConnectionWrapper - Sending
// ============================================================================

impl ConnectionWrapper {
    /// Queues a text frame. Never blocks.
    pub fn send_text(&self, text: String) -> SendOutcome {
        self.enqueue(Message::Text(text.into()))
    }

    /// Encodes and queues a protocol frame.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Json`] if the payload cannot be encoded.
    pub fn send_frame(&self, frame: &Frame) -> Result<SendOutcome> {
        let text = frame.encode()?;
        trace!(guid = %self.guid, message_id = %frame.id(), "Queueing frame");
        Ok(self.send_text(text))
    }

    /// Queues a text frame, returning `true` if it will be written.
    #[inline]
    pub fn send(&self, text: String) -> bool {
        self.send_text(text).is_queued()
    }

    fn enqueue(&self, message: Message) -> SendOutcome {
        if self.is_closed() {
            return SendOutcome::Dropped;
        }

        match self.outbound.try_send(message) {
            Ok(()) if self.outbound.capacity() < self.backpressure_watermark => {
                debug!(guid = %self.guid, "Outbound queue under backpressure");
                SendOutcome::Backpressure
            }
            Ok(()) => SendOutcome::Sent,
            Err(TrySendError::Full(_)) => {
                warn!(guid = %self.guid, "Outbound queue full, frame dropped");
                SendOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => SendOutcome::Dropped,
        }
    }
}

// ============================================================================
// ConnectionWrapper - Liveness
// ============================================================================

impl ConnectionWrapper {
    /// Queues a ping, returning `true` if it will be written.
    pub fn ping(&self) -> bool {
        let seq = self.ping_seq.fetch_add(1, Ordering::Relaxed);
        let queued = self
            .enqueue(Message::Ping(seq.to_be_bytes().to_vec().into()))
            .is_queued();
        if queued {
            *self.last_ping.lock() = Some(Instant::now());
        }
        queued
    }

    /// Pings and waits up to `wait` for any pong.
    ///
    /// Returns `true` only if the peer acknowledged.
    pub async fn probe(&self, wait: Duration) -> bool {
        if self.is_closed() {
            return false;
        }

        let mut pongs = self.pong_tx.subscribe();
        if !self.ping() {
            return false;
        }

        matches!(timeout(wait, pongs.changed()).await, Ok(Ok(())))
    }

    /// Records a pong from the peer.
    pub fn record_pong(&self) {
        *self.last_pong.lock() = Some(Instant::now());
        self.pong_tx.send_modify(|count| *count = count.wrapping_add(1));
    }

    /// Increments and returns the consecutive failure count.
    pub fn record_ping_failure(&self) -> u32 {
        self.ping_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Resets the consecutive failure count.
    pub fn reset_ping_failures(&self) {
        self.ping_failures.store(0, Ordering::Relaxed);
    }

    /// Consecutive failed probes.
    #[must_use]
    pub fn ping_failures(&self) -> u32 {
        self.ping_failures.load(Ordering::Relaxed)
    }
}

// ============================================================================
// ConnectionWrapper - Closing
// ============================================================================

impl ConnectionWrapper {
    /// Marks the wrapper closed and asks the writer to close the socket.
    ///
    /// Returns `false` if it was already closed; the first reason wins.
    pub fn close(&self, reason: CloseReason) -> bool {
        {
            let mut current = self.close_reason.lock();
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
        }

        self.set_state(ConnectionState::Closing);
        self.closed_tx.send_replace(true);

        debug!(guid = %self.guid, %reason, "Connection close requested");
        true
    }

    /// Whether [`ConnectionWrapper::close`] has been called.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Reason passed to the first [`ConnectionWrapper::close`].
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    /// Resolves once the wrapper is closed.
    pub async fn closed(&self) {
        let mut closed = self.closed_tx.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Moves to `Closed`. Returns `true` only for the first call.
    pub(crate) fn finish(&self) -> bool {
        let mut state = self.state.lock();
        if *state == ConnectionState::Closed {
            return false;
        }
        *state = ConnectionState::Closed;
        true
    }
}

// ============================================================================
// Writer Task
// ============================================================================

/// Drains the outbound queue into the socket until the wrapper closes.
///
/// On close, sends a close frame with the recorded reason (best effort).
pub async fn run_writer<S>(
    wrapper: Arc<ConnectionWrapper>,
    mut sink: S,
    mut outbound: mpsc::Receiver<Message>,
) where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    loop {
        tokio::select! {
            biased;

            () = wrapper.closed() => break,

            message = outbound.recv() => match message {
                Some(message) => {
                    if let Err(e) = sink.send(message).await {
                        warn!(guid = %wrapper.guid(), error = %e, "WebSocket write failed");
                        wrapper.close(CloseReason::TransportError);
                        return;
                    }
                }
                None => break,
            }
        }
    }

    let frame = wrapper.close_reason().map(CloseReason::frame);
    let flushed = timeout(CLOSE_FLUSH_TIMEOUT, async {
        let _ = sink.send(Message::Close(frame)).await;
        let _ = sink.close().await;
    })
    .await;

    if flushed.is_err() {
        debug!(guid = %wrapper.guid(), "Close frame flush timed out");
    }

    trace!(guid = %wrapper.guid(), "Writer task terminated");
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000)
    }

    fn wrapper(capacity: usize, watermark: usize) -> (Arc<ConnectionWrapper>, mpsc::Receiver<Message>) {
        ConnectionWrapper::new(ProtocolVariant::Device, addr(), capacity, watermark)
    }

    #[tokio::test]
    async fn test_send_queues_text() {
        let (wrapper, mut rx) = wrapper(8, 2);
        assert_eq!(wrapper.send_text("[3,\"1\",{}]".to_string()), SendOutcome::Sent);

        match rx.recv().await {
            Some(Message::Text(text)) => assert_eq!(text.as_str(), "[3,\"1\",{}]"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_send_outcomes_follow_queue_fill() {
        let (wrapper, _rx) = wrapper(4, 2);

        assert_eq!(wrapper.send_text("a".into()), SendOutcome::Sent);
        assert_eq!(wrapper.send_text("b".into()), SendOutcome::Sent);
        assert_eq!(wrapper.send_text("c".into()), SendOutcome::Backpressure);
        assert_eq!(wrapper.send_text("d".into()), SendOutcome::Backpressure);
        assert_eq!(wrapper.send_text("e".into()), SendOutcome::Dropped);
        assert!(!wrapper.send("f".into()));
    }

    #[test]
    fn test_send_after_close_is_dropped() {
        let (wrapper, _rx) = wrapper(8, 2);
        wrapper.close(CloseReason::Normal);

        assert_eq!(wrapper.send_text("x".into()), SendOutcome::Dropped);
        assert!(!wrapper.ping());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (wrapper, _rx) = wrapper(8, 2);

        assert!(wrapper.close(CloseReason::Duplicate));
        assert!(!wrapper.close(CloseReason::Normal));
        assert!(wrapper.is_closed());
        assert_eq!(wrapper.close_reason(), Some(CloseReason::Duplicate));
        assert_eq!(wrapper.state(), ConnectionState::Closing);
    }

    #[test]
    fn test_finish_once() {
        let (wrapper, _rx) = wrapper(8, 2);
        assert!(wrapper.finish());
        assert!(!wrapper.finish());
        assert_eq!(wrapper.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_set_state_does_not_reopen() {
        let (wrapper, _rx) = wrapper(8, 2);
        wrapper.set_state(ConnectionState::Resolving);
        assert_eq!(wrapper.state(), ConnectionState::Resolving);

        wrapper.close(CloseReason::Normal);
        wrapper.set_state(ConnectionState::Bound);
        assert_eq!(wrapper.state(), ConnectionState::Closing);
    }

    #[tokio::test]
    async fn test_probe_succeeds_on_pong() {
        let (wrapper, mut rx) = wrapper(8, 2);

        let peer = Arc::clone(&wrapper);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if matches!(message, Message::Ping(_)) {
                    peer.record_pong();
                }
            }
        });

        assert!(wrapper.probe(Duration::from_secs(1)).await);
        assert!(wrapper.last_ping().is_some());
        assert!(wrapper.last_pong().is_some());
    }

    #[tokio::test]
    async fn test_probe_times_out_without_pong() {
        let (wrapper, _rx) = wrapper(8, 2);
        assert!(!wrapper.probe(Duration::from_millis(20)).await);
        assert!(wrapper.last_pong().is_none());
    }

    #[tokio::test]
    async fn test_probe_on_closed_wrapper() {
        let (wrapper, _rx) = wrapper(8, 2);
        wrapper.close(CloseReason::Normal);
        assert!(!wrapper.probe(Duration::from_secs(1)).await);
    }

    #[test]
    fn test_ping_failure_counter() {
        let (wrapper, _rx) = wrapper(8, 2);
        assert_eq!(wrapper.record_ping_failure(), 1);
        assert_eq!(wrapper.record_ping_failure(), 2);
        wrapper.reset_ping_failures();
        assert_eq!(wrapper.ping_failures(), 0);
    }

    #[tokio::test]
    async fn test_closed_resolves_after_close() {
        let (wrapper, _rx) = wrapper(8, 2);
        let waiter = Arc::clone(&wrapper);
        let handle = tokio::spawn(async move { waiter.closed().await });

        wrapper.close(CloseReason::IdleTimeout);
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("closed() should resolve")
            .unwrap();
    }

    #[test]
    fn test_close_reason_codes() {
        assert_eq!(CloseReason::Duplicate.code(), CloseCode::Error);
        assert_eq!(CloseReason::ResolutionFailed.code(), CloseCode::Policy);
        assert_eq!(CloseReason::Shutdown.code(), CloseCode::Away);
        assert!(CloseReason::Unresponsive.is_abnormal());
        assert!(!CloseReason::Normal.is_abnormal());
    }
}

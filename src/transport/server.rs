//! WebSocket server for devices and management clients.
//!
//! Owns the listening socket and one task per accepted connection.
//!
//! # Connection Flow
//!
//! 1. TCP accept, then the WebSocket handshake with the upgrade validator
//!    as header callback (rejections answer 404/400, no state allocated)
//! 2. Wrapper created, writer task spawned on the sink half
//! 3. [`Gateway::open_connection`] runs while the reader buffers early frames
//! 4. Read loop, starting with the buffered frames, until close, idle
//!    timeout or transport error; pongs are read even while a frame is
//!    being handled
//! 5. [`Gateway::connection_closed`] in every case

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, sleep, timeout};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

use crate::config::KeepAliveMode;
use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::health::{HealthState, serve_health};
use crate::session::Session;

use super::handshake::{UpgradeTarget, validate_upgrade};
use super::wrapper::{CloseReason, ConnectionWrapper, run_writer};

// ============================================================================
// Constants
// ============================================================================

/// How often the accept loop checks the shutdown flag.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// GatewayServer
// ============================================================================

/// Listening gateway.
///
/// # Example
///
/// ```ignore
/// let gateway = Gateway::builder()
///     .config(GatewayConfig::from_file("gateway.toml")?)
///     .directory(directory)
///     .executor(executor)
///     .build()?;
///
/// let server = GatewayServer::bind(gateway).await?;
/// println!("listening on {}", server.local_addr());
///
/// // ...
/// server.shutdown().await;
/// ```
pub struct GatewayServer {
    /// Shared gateway state.
    gateway: Arc<Gateway>,
    /// Bound WebSocket address.
    local_addr: SocketAddr,
    /// Bound health address, if enabled.
    health_addr: Option<SocketAddr>,
    /// Shutdown flag.
    shutdown: AtomicBool,
    /// Sweeper and health tasks, aborted on shutdown.
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for GatewayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayServer")
            .field("local_addr", &self.local_addr)
            .field("health_addr", &self.health_addr)
            .field("gateway", &self.gateway)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// GatewayServer - Constructor
// ============================================================================

impl GatewayServer {
    /// Binds the configured addresses and starts accepting.
    ///
    /// Also starts the active sweeper (if `keep_alive = "active"`) and the
    /// health endpoint (if `health_addr` is set).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn bind(gateway: Arc<Gateway>) -> Result<Arc<Self>> {
        let config = gateway.config();
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        let mut background = Vec::new();

        let health_addr = match config.health_addr {
            Some(addr) => {
                let health_listener = TcpListener::bind(addr).await?;
                let bound = health_listener.local_addr()?;
                let state = HealthState::new(gateway.started_at(), Arc::clone(gateway.stats()));
                background.push(tokio::spawn(async move {
                    if let Err(e) = serve_health(health_listener, state).await {
                        error!(error = %e, "Health endpoint failed");
                    }
                }));
                Some(bound)
            }
            None => None,
        };

        if config.keep_alive == KeepAliveMode::Active {
            background.push(tokio::spawn(run_sweeper(Arc::clone(&gateway))));
        }

        debug!(%local_addr, "Gateway WebSocket server bound");

        let server = Arc::new(Self {
            gateway,
            local_addr,
            health_addr,
            shutdown: AtomicBool::new(false),
            background: Mutex::new(background),
        });

        let server_clone = Arc::clone(&server);
        tokio::spawn(async move {
            server_clone.accept_loop(listener).await;
        });

        info!(
            %local_addr,
            keep_alive = ?server.gateway.config().keep_alive,
            "Gateway server started"
        );

        Ok(server)
    }
}

// ============================================================================
// GatewayServer - Public API
// ============================================================================

impl GatewayServer {
    /// Shared gateway.
    #[inline]
    #[must_use]
    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Bound WebSocket address.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Bound health address.
    #[inline]
    #[must_use]
    pub fn health_addr(&self) -> Option<SocketAddr> {
        self.health_addr
    }

    /// Bound WebSocket port.
    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Loopback URL of the WebSocket listener.
    ///
    /// Format: `ws://127.0.0.1:{port}`
    #[inline]
    #[must_use]
    pub fn ws_url(&self) -> String {
        let ip = match self.local_addr.ip() {
            ip if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            ip => ip,
        };
        format!("ws://{}", SocketAddr::new(ip, self.local_addr.port()))
    }

    /// Stops accepting, stops background tasks and closes every registered
    /// connection with "going away".
    pub async fn shutdown(&self) {
        info!("Gateway server shutting down");

        self.shutdown.store(true, Ordering::SeqCst);

        let background: Vec<_> = self.background.lock().drain(..).collect();
        for task in background {
            task.abort();
        }

        let closed = self.gateway.shutdown();

        info!(closed, "Gateway server shutdown complete");
    }
}

// ============================================================================
// GatewayServer - Accept Loop
// ============================================================================

impl GatewayServer {
    /// Background task that accepts new connections.
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        debug!("Accept loop started");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                debug!("Accept loop shutting down");
                break;
            }

            // Accept with timeout to allow checking shutdown flag
            match timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await {
                Ok(Ok((stream, addr))) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, addr).await {
                            debug!(error = %e, remote_addr = %addr, "Connection ended with error");
                        }
                    });
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Accept failed");
                }
                Err(_) => continue,
            }
        }

        debug!("Accept loop terminated");
    }

    /// Runs one connection from handshake to close.
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let config = self.gateway.config();
        let stats = self.gateway.stats();
        let accepted: Mutex<Option<UpgradeTarget>> = Mutex::new(None);

        let callback = |request: &Request, mut response: Response| {
            let path = request
                .uri()
                .path_and_query()
                .map_or_else(|| request.uri().path(), |pq| pq.as_str());
            let offered = request
                .headers()
                .get(SEC_WEBSOCKET_PROTOCOL)
                .and_then(|value| value.to_str().ok());

            match validate_upgrade(path, offered, config) {
                Ok(target) => {
                    if let Ok(value) = HeaderValue::from_str(&target.subprotocol) {
                        response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
                    }
                    *accepted.lock() = Some(target);
                    Ok(response)
                }
                Err(rejection) => {
                    stats.record_rejected();
                    let status = StatusCode::from_u16(rejection.kind.status_code())
                        .unwrap_or(StatusCode::BAD_REQUEST);
                    let mut error = ErrorResponse::new(Some(rejection.message));
                    *error.status_mut() = status;
                    Err(error)
                }
            }
        };

        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(config.max_frame_size))
            .max_frame_size(Some(config.max_frame_size));

        let ws_stream =
            tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config))
                .await
                .map_err(|e| match e {
                    WsError::Http(response) => Error::handshake(format!(
                        "upgrade refused with {}",
                        response.status()
                    )),
                    e => Error::connection(format!("WebSocket upgrade failed: {e}")),
                })?;

        let target = accepted
            .lock()
            .take()
            .ok_or_else(|| Error::handshake("upgrade accepted without a validated target"))?;

        let (wrapper, outbound_rx) = ConnectionWrapper::new(
            target.variant,
            addr,
            config.outbound_queue_capacity,
            config.backpressure_watermark,
        );
        stats.record_opened();
        info!(
            guid = %wrapper.guid(),
            variant = %target.variant,
            remote_addr = %addr,
            tenant = %target.tenant,
            device_id = %target.device_id,
            "Connection opened"
        );

        let (sink, mut stream) = ws_stream.split();
        let writer = tokio::spawn(run_writer(Arc::clone(&wrapper), sink, outbound_rx));

        let session = match self.initialize(&wrapper, &target, &mut stream).await {
            Some((session, early)) => {
                self.read_loop(&wrapper, &session, &target, &mut stream, early)
                    .await;
                Some(session)
            }
            None => None,
        };

        self.gateway.connection_closed(&wrapper, session.as_ref());
        let _ = writer.await;

        Ok(())
    }
}

// ============================================================================
// GatewayServer - Per-Connection Tasks
// ============================================================================

impl GatewayServer {
    /// Resolves and binds the connection, buffering frames that arrive
    /// meanwhile.
    ///
    /// Returns the session and the buffered frames, or `None` (frames
    /// discarded) if the connection never reached `Bound`.
    async fn initialize<S>(
        &self,
        wrapper: &Arc<ConnectionWrapper>,
        target: &UpgradeTarget,
        stream: &mut S,
    ) -> Option<(Arc<Session>, VecDeque<Message>)>
    where
        S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
    {
        let open = self.gateway.open_connection(wrapper, target);
        tokio::pin!(open);

        let mut early = VecDeque::new();
        let mut reading = true;

        let result = loop {
            tokio::select! {
                result = &mut open => break result,

                message = stream.next(), if reading => match message {
                    Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => {
                        early.push_back(message);
                    }
                    Some(Ok(Message::Pong(_))) => wrapper.record_pong(),
                    Some(Ok(Message::Ping(_) | Message::Frame(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        reading = false;
                        wrapper.close(CloseReason::Normal);
                    }
                    Some(Err(e)) => {
                        reading = false;
                        warn!(guid = %wrapper.guid(), error = %e, "WebSocket read failed during resolution");
                        wrapper.close(CloseReason::TransportError);
                    }
                }
            }
        };

        match result {
            Ok(session) => Some((session, early)),
            Err(e) => {
                if !early.is_empty() {
                    debug!(
                        guid = %wrapper.guid(),
                        discarded = early.len(),
                        error = %e,
                        "Discarding frames received during failed resolution"
                    );
                }
                None
            }
        }
    }

    /// Reads frames until the connection ends.
    ///
    /// Frames are dispatched one at a time, in arrival order. While one is
    /// in flight the reader keeps consuming the socket, so pongs are
    /// recorded and later frames queue behind it.
    async fn read_loop<S>(
        &self,
        wrapper: &Arc<ConnectionWrapper>,
        session: &Arc<Session>,
        target: &UpgradeTarget,
        stream: &mut S,
        mut queued: VecDeque<Message>,
    ) where
        S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
    {
        let config = self.gateway.config();
        let idle_timeout = config.idle_timeout();
        let ping_interval = config.ping_interval();
        let passive = config.keep_alive == KeepAliveMode::Passive;

        let idle = sleep(idle_timeout);
        tokio::pin!(idle);
        let mut pings = interval_at(Instant::now() + ping_interval, ping_interval);

        let mut in_flight: Option<BoxFuture<'_, ()>> = queued
            .pop_front()
            .map(|message| self.dispatch(session, target, message).boxed());

        loop {
            tokio::select! {
                () = wrapper.closed() => break,

                () = &mut idle => {
                    info!(
                        guid = %wrapper.guid(),
                        tenant = %session.key().tenant,
                        device_id = %session.key().device_id,
                        idle_ms = u64::try_from(idle_timeout.as_millis()).unwrap_or(u64::MAX),
                        "Closing idle connection"
                    );
                    wrapper.close(CloseReason::IdleTimeout);
                    break;
                }

                _ = pings.tick(), if passive => {
                    wrapper.ping();
                }

                () = async { if let Some(dispatch) = in_flight.as_mut() { dispatch.await } },
                    if in_flight.is_some() =>
                {
                    in_flight = queued
                        .pop_front()
                        .map(|message| self.dispatch(session, target, message).boxed());
                }

                message = stream.next() => {
                    idle.as_mut().reset(Instant::now() + idle_timeout);

                    match message {
                        Some(Ok(Message::Pong(_))) => wrapper.record_pong(),
                        Some(Ok(Message::Ping(_) | Message::Frame(_))) => {}
                        Some(Ok(Message::Close(_))) => {
                            debug!(guid = %wrapper.guid(), "WebSocket closed by remote");
                            break;
                        }
                        Some(Ok(message)) => {
                            if in_flight.is_none() {
                                in_flight = Some(self.dispatch(session, target, message).boxed());
                            } else {
                                queued.push_back(message);
                            }
                        }
                        Some(Err(e)) => {
                            warn!(guid = %wrapper.guid(), error = %e, "WebSocket read failed");
                            wrapper.close(CloseReason::TransportError);
                            break;
                        }
                        None => {
                            debug!(guid = %wrapper.guid(), "WebSocket stream ended");
                            break;
                        }
                    }
                }
            }
        }

        if in_flight.is_some() || !queued.is_empty() {
            debug!(
                guid = %wrapper.guid(),
                dropped = queued.len() + usize::from(in_flight.is_some()),
                "Connection ended with frames still being handled"
            );
        }
    }

    async fn dispatch(&self, session: &Arc<Session>, target: &UpgradeTarget, message: Message) {
        match message {
            Message::Text(text) => {
                self.gateway
                    .handle_message(session, &target.raw_path, text.as_str())
                    .await;
            }
            Message::Binary(data) => {
                self.gateway
                    .handle_binary(session, &target.raw_path, &data)
                    .await;
            }
            _ => {}
        }
    }
}

// ============================================================================
// Sweeper
// ============================================================================

/// Runs [`Gateway::sweep`] every `ping_interval` until aborted.
async fn run_sweeper(gateway: Arc<Gateway>) {
    let period = gateway.config().ping_interval();
    let mut ticker = interval_at(Instant::now() + period, period);

    debug!(
        interval_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
        "Liveness sweeper started"
    );

    loop {
        ticker.tick().await;
        gateway.sweep().await;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::GatewayConfig;
    use crate::services::{CommandContext, CommandError, CommandExecutor, StaticDirectory};

    struct NoCommands;

    #[async_trait::async_trait]
    impl CommandExecutor for NoCommands {
        async fn execute(
            &self,
            _ctx: &CommandContext,
            command: &str,
            _payload: serde_json::Value,
        ) -> std::result::Result<serde_json::Value, CommandError> {
            Err(CommandError::not_implemented(command))
        }
    }

    fn gateway(health: bool) -> Arc<Gateway> {
        let localhost = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let config = GatewayConfig {
            listen_addr: localhost,
            health_addr: health.then_some(localhost),
            ..Default::default()
        };
        Gateway::new(config, Arc::new(StaticDirectory::new()), Arc::new(NoCommands))
    }

    #[tokio::test]
    async fn test_server_bind() {
        let server = GatewayServer::bind(gateway(false)).await.expect("server bind");
        assert!(server.port() > 0);
        assert_eq!(server.ws_url(), format!("ws://127.0.0.1:{}", server.port()));
        assert!(server.health_addr().is_none());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_server_binds_health() {
        let server = GatewayServer::bind(gateway(true)).await.expect("server bind");
        let health = server.health_addr().expect("health enabled");
        assert!(health.port() > 0);
        assert_ne!(health.port(), server.port());
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_with_no_connections() {
        let server = GatewayServer::bind(gateway(false)).await.expect("server bind");
        server.shutdown().await;
        assert!(server.gateway().registry().is_empty());
    }
}

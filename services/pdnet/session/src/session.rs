//! Session engine: handshake, resumption and latency monitoring on top of
//! the connection manager.
//!
//! Every connection starts with a handshake request carrying the
//! application identity. The session token issued by the server is kept and
//! offered again after a reconnection to resume the session. Connection
//! manager events are processed on one task with the engine state locked,
//! so handshake interception and event forwarding happen in order.

use crate::datagram::DatagramChannel;
use crate::error::EngineError;
use crate::latency::{
    LatencyMonitor, PingSender, DEFAULT_PING_INTERVAL, DEFAULT_WINDOW_SIZE, MIN_PING_INTERVAL,
};
use crate::manager::{ConnectionEvent, ConnectionManager, MANUAL_DISCONNECT_REASON};
use crate::transport::Transport;
use bytes::Bytes;
use pdnet_wire::{
    HandshakeRequest, HandshakeResponse, Header, Message, MessageRegistry, PingPong, ResponseRef,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Configuration for a session engine
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Application identifier sent in the handshake
    pub app_id: u8,
    /// Opaque authentication token
    pub auth_token: Option<String>,
    /// Protocol version expected by the server
    pub api_version: Option<String>,
    /// How long an unexpected disconnect is retried; zero disables it
    pub reconnection_window: Duration,
    /// Interval between pings
    pub ping_interval: Duration,
    /// Number of round trips averaged
    pub ping_window: usize,
    /// Pause before a manual disconnect so queued writes can flush
    pub disconnect_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app_id: 0,
            auth_token: None,
            api_version: None,
            reconnection_window: Duration::ZERO,
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_window: DEFAULT_WINDOW_SIZE,
            disconnect_grace: Duration::from_millis(100),
        }
    }
}

impl EngineConfig {
    /// Check value ranges
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.ping_window == 0 {
            return Err(EngineError::Config("ping_window must be at least 1".into()));
        }
        if self.ping_interval < MIN_PING_INTERVAL {
            return Err(EngineError::Config(format!(
                "ping_interval must be at least {:?}",
                MIN_PING_INTERVAL
            )));
        }
        Ok(())
    }
}

/// Events emitted by the session engine
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Transport connected; the handshake is being sent
    Connected {
        /// Whether this connection ends an outage
        is_reconnection: bool,
    },
    /// Connecting failed or the transport reported an I/O error
    ConnectError(String),
    /// The server accepted the offered session token
    ConnectionResumed,
    /// Inbound message, handshake responses included
    Response(ResponseRef),
    /// A reconnection attempt was scheduled
    ReconnectionAttempt(u32),
    /// Connection closed for good
    Disconnected {
        /// Reason of the disconnect
        reason: Option<String>,
    },
    /// Inbound data could not be decoded
    DataError(String),
    /// Datagram received on the side channel
    UnreliableData(Bytes),
}

/// Identity presented to the server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    /// Application identifier
    pub app_id: u8,
    /// Authentication token
    pub auth_token: Option<String>,
    /// Protocol version
    pub api_version: Option<String>,
    /// Token issued by the last accepted handshake
    pub session_token: Option<String>,
}

impl Session {
    fn handshake_request(&self, resume: bool) -> HandshakeRequest {
        HandshakeRequest {
            app_id: self.app_id,
            auth_token: self.auth_token.clone(),
            api_version: self.api_version.clone(),
            session_token: if resume { self.session_token.clone() } else { None },
        }
    }
}

struct ManagerPing(ConnectionManager);

impl PingSender for ManagerPing {
    fn send_ping(&self) {
        self.0.send(&PingPong);
    }
}

struct EngineState {
    session: Session,
    connecting: bool,
    resuming: bool,
    target: Option<(String, u16)>,
    reconnection_window: Duration,
    ping_interval: Duration,
    ping_window: usize,
    monitor: LatencyMonitor,
    datagram: Option<DatagramChannel>,
}

struct EngineInner {
    manager: ConnectionManager,
    disconnect_grace: Duration,
    state: Mutex<EngineState>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl EngineInner {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("Session event dropped, receiver is gone");
        }
    }

    fn new_monitor(&self, interval: Duration, window: usize) -> LatencyMonitor {
        LatencyMonitor::new(Arc::new(ManagerPing(self.manager.clone())), interval, window)
    }

    fn handle_connection_event(&self, event: ConnectionEvent) {
        let mut state = self.lock();
        match event {
            ConnectionEvent::Connected { is_reconnection } => {
                state.resuming = is_reconnection && state.session.session_token.is_some();
                self.emit(SessionEvent::Connected { is_reconnection });
                state.monitor.start();

                let request = state.session.handshake_request(state.resuming);
                info!(app_id = request.app_id, resume = state.resuming, "Sending handshake");
                self.manager.send(&request);
            }
            ConnectionEvent::Response(response) => {
                if let Some(handshake) = response.downcast_ref::<HandshakeResponse>() {
                    self.on_handshake(&mut state, handshake);
                } else if response.is::<PingPong>() {
                    state.monitor.record_pong();
                }
                self.emit(SessionEvent::Response(response));
            }
            ConnectionEvent::ReconnectionAttempt(attempt) => {
                self.emit(SessionEvent::ReconnectionAttempt(attempt));
            }
            ConnectionEvent::Disconnected { reason } => {
                state.monitor.stop();
                state.connecting = false;
                state.resuming = false;
                self.emit(SessionEvent::Disconnected { reason });
            }
            ConnectionEvent::IoError(message) => {
                state.connecting = false;
                self.emit(SessionEvent::ConnectError(message));
            }
            ConnectionEvent::DataError(message) => {
                self.emit(SessionEvent::DataError(message));
            }
        }
    }

    fn on_handshake(&self, state: &mut EngineState, handshake: &HandshakeResponse) {
        match handshake {
            HandshakeResponse::Accepted { session_token } => {
                if state.resuming {
                    state.resuming = false;
                    info!("Session resumed");
                    self.emit(SessionEvent::ConnectionResumed);
                } else {
                    state.connecting = false;
                    state.session.session_token = Some(session_token.clone());
                    info!("Handshake accepted");
                }
            }
            HandshakeResponse::Rejected { error, code } => {
                state.connecting = false;
                state.resuming = false;
                warn!(code = ?code, "Handshake rejected: {}", error);
            }
        }
    }
}

/// Client session over a connection manager
#[derive(Clone)]
pub struct SessionEngine {
    inner: Arc<EngineInner>,
}

impl SessionEngine {
    /// Configure an engine with the protocol messages only
    ///
    /// Must be called from within a tokio runtime.
    pub fn configure<T: Transport>(
        config: EngineConfig,
        transport: T,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), EngineError> {
        Self::configure_with_registry(config, transport, MessageRegistry::with_protocol_messages())
    }

    /// Configure an engine decoding inbound messages with `registry`
    ///
    /// The registry must handle the handshake and ping headers.
    pub fn configure_with_registry<T: Transport>(
        config: EngineConfig,
        transport: T,
        registry: MessageRegistry,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), EngineError> {
        config.validate()?;
        for header in [Header::Handshake, Header::PingPong] {
            if !registry.contains(header as u8) {
                return Err(EngineError::Config(format!(
                    "registry has no handler for {:?}",
                    header
                )));
            }
        }

        let (manager, connection_events) =
            ConnectionManager::start(transport, Arc::new(registry), config.reconnection_window);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let monitor = LatencyMonitor::new(
            Arc::new(ManagerPing(manager.clone())),
            config.ping_interval,
            config.ping_window,
        );
        let inner = Arc::new(EngineInner {
            manager,
            disconnect_grace: config.disconnect_grace,
            state: Mutex::new(EngineState {
                session: Session {
                    app_id: config.app_id,
                    auth_token: config.auth_token,
                    api_version: config.api_version,
                    session_token: None,
                },
                connecting: false,
                resuming: false,
                target: None,
                reconnection_window: config.reconnection_window,
                ping_interval: config.ping_interval,
                ping_window: config.ping_window,
                monitor,
                datagram: None,
            }),
            events: event_tx,
        });

        tokio::spawn(run_events(Arc::downgrade(&inner), connection_events));
        Ok((Self { inner }, event_rx))
    }

    /// Connect to `host:port`
    ///
    /// Ignored with a warning while connected or connecting.
    pub fn connect(&self, host: &str, port: u16) {
        let mut state = self.inner.lock();
        state.target = Some((host.to_owned(), port));

        if self.inner.manager.is_connected() {
            warn!("Connect ignored, already connected");
            return;
        }
        if state.connecting || self.inner.manager.is_reconnecting() {
            warn!("Connect ignored, a connection attempt is in progress");
            return;
        }

        state.connecting = true;
        // A manual disconnect disables the window; restore it
        self.inner.manager.set_reconnection_window(state.reconnection_window);
        self.inner.manager.connect(host, port);
    }

    /// Connect again to the last host and port
    pub fn reconnect(&self) {
        let target = self.inner.lock().target.clone();
        match target {
            Some((host, port)) => self.connect(&host, port),
            None => warn!("Reconnect ignored, connect was never called"),
        }
    }

    /// Close the connection without reconnecting
    pub async fn disconnect(&self) {
        if self.is_connected() {
            tokio::time::sleep(self.inner.disconnect_grace).await;
        }

        self.inner.manager.set_reconnection_window(Duration::ZERO);
        self.inner
            .manager
            .disconnect(Some(MANUAL_DISCONNECT_REASON.to_string()));

        let mut state = self.inner.lock();
        state.monitor.destroy();
        state.monitor = self.inner.new_monitor(state.ping_interval, state.ping_window);
    }

    /// Drop the connection immediately
    pub fn kill_connection(&self) {
        self.inner.manager.kill();
    }

    /// Send a message over the connection
    pub fn send(&self, message: &dyn Message) {
        self.inner.manager.send(message);
    }

    /// Bind the datagram side channel
    pub async fn configure_unreliable(
        &self,
        out_host: &str,
        out_port: u16,
        in_port: u16,
    ) -> Result<(), EngineError> {
        let events = self.inner.events.clone();
        let channel = DatagramChannel::bind(out_host, out_port, in_port, move |data| {
            if events.send(SessionEvent::UnreliableData(data)).is_err() {
                debug!("Datagram dropped, receiver is gone");
            }
        })
        .await?;

        if let Some(previous) = self.inner.lock().datagram.replace(channel) {
            previous.close();
        }
        Ok(())
    }

    /// Send a message over the side channel
    pub fn send_unreliable(&self, message: &dyn Message) {
        match &self.inner.lock().datagram {
            Some(channel) => channel.send_message(message),
            None => debug!(?message, "Side channel not configured, message dropped"),
        }
    }

    /// Send raw bytes over the side channel
    pub fn send_unreliable_bytes(&self, data: &[u8]) {
        match &self.inner.lock().datagram {
            Some(channel) => channel.send(data),
            None => debug!(bytes = data.len(), "Side channel not configured, datagram dropped"),
        }
    }

    /// Average round trip in milliseconds, 0 before the first pong
    pub fn average_round_trip_ms(&self) -> u64 {
        self.inner.lock().monitor.average_round_trip_ms()
    }

    /// Replace the latency monitor settings
    ///
    /// Samples are discarded; a running monitor keeps running.
    pub fn set_latency_monitor(&self, interval: Duration, window: usize) {
        let mut state = self.inner.lock();
        let was_running = state.monitor.is_running();
        state.monitor.destroy();

        state.ping_interval = interval;
        state.ping_window = window;
        state.monitor = self.inner.new_monitor(interval, window);
        if was_running {
            state.monitor.start();
        }
    }

    /// Whether the transport is connected
    pub fn is_connected(&self) -> bool {
        self.inner.manager.is_connected()
    }

    /// Whether a connect is waiting for its handshake
    pub fn is_connecting(&self) -> bool {
        self.inner.lock().connecting
    }

    /// Whether an outage is being retried
    pub fn is_reconnecting(&self) -> bool {
        self.inner.manager.is_reconnecting()
    }

    /// Token issued by the last accepted handshake
    pub fn session_token(&self) -> Option<String> {
        self.inner.lock().session.session_token.clone()
    }

    /// Window in effect for the current connection
    pub fn reconnection_window(&self) -> Duration {
        self.inner.manager.reconnection_window()
    }

    /// Change the reconnection window
    pub fn set_reconnection_window(&self, window: Duration) {
        self.inner.lock().reconnection_window = window;
        self.inner.manager.set_reconnection_window(window);
    }

    /// Tear everything down; safe in any state
    pub fn destroy(&self) {
        let mut state = self.inner.lock();
        if let Some(channel) = state.datagram.take() {
            channel.close();
        }
        state.monitor.destroy();
        state.connecting = false;
        self.inner.manager.destroy();
    }
}

async fn run_events(
    engine: Weak<EngineInner>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = engine.upgrade() else {
            break;
        };
        inner.handle_connection_event(event);
    }
    debug!("Session engine event loop finished");
}

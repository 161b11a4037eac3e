//! Connection manager: owns one transport and keeps it connected.
//!
//! The manager is an actor. A single task owns the transport, the
//! reconnection context and the retry timer, and processes commands from
//! [`ConnectionManager`] handles and events from the transport one at a time,
//! so state transitions for a connection never interleave. Inbound data is
//! decoded through the [`MessageRegistry`] and republished as
//! [`ConnectionEvent`]s. Transport events that arrive after a kill or a
//! finalized disconnect are stale and ignored until the next connect.

use crate::reconnect::{ReconnectionContext, RetryDecision};
use crate::transport::{Transport, TransportEvent};
use bytes::Bytes;
use pdnet_wire::{decode_frames, encode_message, Message, MessageRegistry, ResponseRef};
use std::future::pending;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant, Sleep};
use tracing::{debug, error, info, warn};

/// Disconnect reason that bypasses reconnection
pub const MANUAL_DISCONNECT_REASON: &str = "manual";

/// Events published by the connection manager
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Transport connected
    Connected {
        /// Whether this connection ends an outage
        is_reconnection: bool,
    },
    /// Connection finalized as closed; no more retries
    Disconnected {
        /// Reason of the disconnect that started it
        reason: Option<String>,
    },
    /// One decoded inbound message
    Response(ResponseRef),
    /// A reconnection attempt was scheduled
    ReconnectionAttempt(u32),
    /// Transport failure outside of a reconnection
    IoError(String),
    /// Inbound data that could not be decoded
    DataError(String),
}

enum Command {
    Connect { host: String, port: u16 },
    Send(Bytes),
    Disconnect(Option<String>),
    Kill,
    Destroy,
}

/// Where the actor is in the connection life cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// No connection wanted; transport lifecycle events are stale
    Idle,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Default)]
struct ManagerShared {
    connected: AtomicBool,
    reconnecting: AtomicBool,
    window_ms: AtomicU64,
}

impl ManagerShared {
    fn reconnection_window(&self) -> Duration {
        Duration::from_millis(self.window_ms.load(Ordering::SeqCst))
    }
}

/// Handle to a connection manager actor
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<ManagerShared>,
}

impl ConnectionManager {
    /// Take ownership of `transport` and start the actor
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<T: Transport>(
        transport: T,
        registry: Arc<MessageRegistry>,
        reconnection_window: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        transport.bind(transport_tx);

        let manager = Self {
            commands: command_tx,
            shared: Arc::new(ManagerShared::default()),
        };
        manager.set_reconnection_window(reconnection_window);

        let actor = ManagerActor {
            transport: Box::new(transport),
            registry,
            shared: manager.shared.clone(),
            events: event_tx,
            target: None,
            phase: Phase::Idle,
            reconnection: None,
            retry_timer: None,
        };
        tokio::spawn(actor.run(command_rx, transport_rx));

        (manager, event_rx)
    }

    /// Connect to `host:port`, remembered for reconnection
    pub fn connect(&self, host: &str, port: u16) {
        self.command(Command::Connect {
            host: host.to_owned(),
            port,
        });
    }

    /// Encode and send a message; dropped with a warning when not connected
    pub fn send(&self, message: &dyn Message) {
        if !self.is_connected() {
            warn!(?message, "Not connected, message dropped");
            return;
        }

        match encode_message(message) {
            Ok(frame) => self.command(Command::Send(frame)),
            Err(e) => error!(?message, "Could not encode message: {}", e),
        }
    }

    /// Close the connection with an optional reason
    pub fn disconnect(&self, reason: Option<String>) {
        self.command(Command::Disconnect(reason));
    }

    /// Force the transport down and finalize the disconnect without a reason
    pub fn kill(&self) {
        self.command(Command::Kill);
    }

    /// Destroy the transport and stop the actor
    pub fn destroy(&self) {
        self.command(Command::Destroy);
    }

    /// Whether the transport is connected
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Whether an outage is being retried
    pub fn is_reconnecting(&self) -> bool {
        self.shared.reconnecting.load(Ordering::SeqCst)
    }

    /// Window during which an unexpected disconnect is retried
    pub fn reconnection_window(&self) -> Duration {
        self.shared.reconnection_window()
    }

    /// Set the reconnection window; zero disables reconnection
    pub fn set_reconnection_window(&self, window: Duration) {
        let millis = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        self.shared.window_ms.store(millis, Ordering::SeqCst);
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Connection manager is shut down, command ignored");
        }
    }
}

struct ManagerActor {
    transport: Box<dyn Transport>,
    registry: Arc<MessageRegistry>,
    shared: Arc<ManagerShared>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    target: Option<(String, u16)>,
    phase: Phase,
    reconnection: Option<ReconnectionContext>,
    retry_timer: Option<Pin<Box<Sleep>>>,
}

impl ManagerActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Destroy) | None => break,
                    Some(Command::Kill) => {
                        self.handle_command(Command::Kill);
                        // Events raised before the kill belong to the dead connection
                        let mut stale = 0;
                        while transport_events.try_recv().is_ok() {
                            stale += 1;
                        }
                        if stale > 0 {
                            debug!(stale, "Discarded transport events queued before kill");
                        }
                    }
                    Some(command) => self.handle_command(command),
                },
                Some(event) = transport_events.recv() => self.handle_transport_event(event),
                _ = wait_for(&mut self.retry_timer) => self.retry(),
            }
        }

        info!("Connection manager shutting down");
        self.retry_timer = None;
        self.reconnection = None;
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.reconnecting.store(false, Ordering::SeqCst);
        self.transport.destroy();
    }

    fn emit(&self, event: ConnectionEvent) {
        if self.events.send(event).is_err() {
            debug!("Connection event dropped, receiver is gone");
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { host, port } => {
                info!(host = %host, port, "Connecting");
                if self.phase == Phase::Idle {
                    self.phase = Phase::Connecting;
                }
                self.transport.connect(&host, port);
                self.target = Some((host, port));
            }
            Command::Send(frame) => {
                if self.phase != Phase::Connected {
                    warn!(bytes = frame.len(), "Not connected, frame dropped");
                } else if let Err(e) = self.transport.write(frame) {
                    warn!("Write failed: {}", e);
                }
            }
            Command::Disconnect(reason) => {
                if self.phase == Phase::Connected {
                    self.cancel_retry();
                    self.transport.disconnect(reason);
                } else if self.reconnection.is_some() {
                    debug!("Disconnect during reconnection, abandoning outage");
                    self.transport.kill();
                    self.finalize_disconnect(reason);
                } else {
                    warn!("Disconnect ignored, not connected");
                }
            }
            Command::Kill => {
                self.transport.kill();
                self.finalize_disconnect(None);
            }
            Command::Destroy => {}
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        if !self.accepts(&event) {
            debug!(phase = ?self.phase, event = ?event, "Stale transport event ignored");
            return;
        }

        match event {
            TransportEvent::Connected => {
                self.cancel_retry();
                let is_reconnection = self.reconnection.take().is_some();
                self.phase = Phase::Connected;
                self.shared.connected.store(true, Ordering::SeqCst);
                self.shared.reconnecting.store(false, Ordering::SeqCst);
                info!(is_reconnection, "Connection established");
                self.emit(ConnectionEvent::Connected { is_reconnection });
            }
            TransportEvent::Data(data) => self.dispatch(data),
            TransportEvent::Disconnected { reason } => {
                self.shared.connected.store(false, Ordering::SeqCst);
                self.on_disconnected(reason);
            }
            TransportEvent::Error { message, kind } => {
                if self.reconnection.is_some() {
                    debug!(kind = ?kind, "Reconnection attempt failed: {}", message);
                    self.schedule_retry();
                } else {
                    warn!(kind = ?kind, "I/O error: {}", message);
                    if self.phase == Phase::Connecting {
                        self.phase = Phase::Idle;
                    }
                    self.emit(ConnectionEvent::IoError(message));
                }
            }
        }
    }

    /// Whether `event` fits the current phase
    fn accepts(&self, event: &TransportEvent) -> bool {
        match (self.phase, event) {
            (Phase::Idle, _) => false,
            (Phase::Connected, TransportEvent::Connected) => false,
            (Phase::Connecting | Phase::Reconnecting, TransportEvent::Data(_)) => false,
            _ => true,
        }
    }

    /// Decode every frame in `data` and publish them in order
    fn dispatch(&self, data: Bytes) {
        for frame in decode_frames(data) {
            match frame.and_then(|frame| self.registry.read_frame(frame)) {
                Ok(response) => self.emit(ConnectionEvent::Response(response)),
                Err(e) => {
                    error!("Data error: {}", e);
                    self.emit(ConnectionEvent::DataError(e.to_string()));
                }
            }
        }
    }

    fn on_disconnected(&mut self, reason: Option<String>) {
        let window = self.shared.reconnection_window();
        let manual = reason.as_deref() == Some(MANUAL_DISCONNECT_REASON);
        if manual || window.is_zero() {
            self.finalize_disconnect(reason);
            return;
        }

        if self.reconnection.is_none() {
            info!(window = ?window, reason = ?reason, "Connection lost, reconnecting");
            self.reconnection = Some(ReconnectionContext::start(Instant::now(), window, reason));
            self.shared.reconnecting.store(true, Ordering::SeqCst);
        }
        self.phase = Phase::Reconnecting;
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        if self.retry_timer.is_some() {
            debug!("Reconnection attempt already scheduled");
            return;
        }
        let Some(ctx) = self.reconnection.as_mut() else {
            return;
        };

        let now = Instant::now();
        match ctx.next_attempt(now) {
            RetryDecision::Retry { attempt, delay } => {
                info!(attempt, time_left = ?ctx.time_left(now), "Reconnection attempt scheduled in {:?}", delay);
                self.retry_timer = Some(Box::pin(sleep(delay)));
                self.emit(ConnectionEvent::ReconnectionAttempt(attempt));
            }
            RetryDecision::Exhausted { attempts } => {
                let reason = ctx.reason().map(str::to_owned);
                warn!(attempts, "Reconnection window exhausted");
                self.finalize_disconnect(reason);
            }
        }
    }

    fn retry(&mut self) {
        self.retry_timer = None;
        match &self.target {
            Some((host, port)) => {
                debug!(host = %host, port, "Reconnecting");
                self.transport.connect(host, *port);
            }
            None => {
                let reason = self.reconnection.as_ref().and_then(|ctx| ctx.reason().map(str::to_owned));
                self.finalize_disconnect(reason);
            }
        }
    }

    fn cancel_retry(&mut self) {
        self.retry_timer = None;
    }

    fn finalize_disconnect(&mut self, reason: Option<String>) {
        self.cancel_retry();
        self.reconnection = None;
        self.phase = Phase::Idle;
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.reconnecting.store(false, Ordering::SeqCst);
        info!(reason = ?reason, "Disconnected");
        self.emit(ConnectionEvent::Disconnected { reason });
    }
}

async fn wait_for(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamTransport;
    use crate::testing::ScriptedTransport;
    use crate::transport::{listen_tcp, TransportState};
    use pdnet_wire::{encode_frame, HandshakeResponse, PingPong};
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    fn start(window: Duration) -> (ScriptedTransport, ConnectionManager, UnboundedReceiver<ConnectionEvent>) {
        let transport = ScriptedTransport::new();
        let registry = Arc::new(MessageRegistry::with_protocol_messages());
        let (manager, events) = ConnectionManager::start(transport.clone(), registry, window);
        (transport, manager, events)
    }

    async fn next(events: &mut UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
        timeout(Duration::from_secs(60), events.recv())
            .await
            .expect("timed out waiting for connection event")
            .expect("event channel closed")
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    async fn connected(window: Duration) -> (ScriptedTransport, ConnectionManager, UnboundedReceiver<ConnectionEvent>) {
        let (transport, manager, mut events) = start(window);
        manager.connect("game.example", 7777);
        assert!(matches!(
            next(&mut events).await,
            ConnectionEvent::Connected { is_reconnection: false }
        ));
        (transport, manager, events)
    }

    #[tokio::test]
    async fn test_connect_and_send() {
        let (transport, manager, _events) = connected(Duration::ZERO).await;
        assert!(manager.is_connected());
        assert_eq!(transport.connects(), vec![("game.example".to_string(), 7777)]);

        manager.send(&PingPong);
        settle().await;
        assert_eq!(transport.written(), vec![Bytes::from_static(&[1, 0, 1])]);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_is_dropped() {
        let (transport, manager, mut events) = start(Duration::ZERO);
        manager.send(&PingPong);
        settle().await;

        assert!(transport.written().is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_frames_dispatched_in_order() {
        let (transport, _manager, mut events) = connected(Duration::ZERO).await;

        let mut data = encode_message(&HandshakeResponse::Accepted {
            session_token: "abc".into(),
        })
        .unwrap()
        .to_vec();
        data.extend_from_slice(&encode_message(&PingPong).unwrap());
        transport.deliver(Bytes::from(data));

        match next(&mut events).await {
            ConnectionEvent::Response(r) => {
                let handshake = r.downcast_ref::<HandshakeResponse>().unwrap();
                assert_eq!(handshake.session_token(), Some("abc"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        match next(&mut events).await {
            ConnectionEvent::Response(r) => assert!(r.is::<PingPong>()),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_header_does_not_stop_the_buffer() {
        let (transport, manager, mut events) = connected(Duration::ZERO).await;

        let mut data = encode_frame(42, |_| {}).unwrap().to_vec();
        data.extend_from_slice(&encode_message(&PingPong).unwrap());
        transport.deliver(Bytes::from(data));

        assert!(matches!(next(&mut events).await, ConnectionEvent::DataError(_)));
        assert!(matches!(next(&mut events).await, ConnectionEvent::Response(_)));
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn test_overlong_frame_is_a_data_error() {
        let (transport, manager, mut events) = connected(Duration::ZERO).await;

        transport.deliver(Bytes::from_static(&[200, 0, 1, 0]));
        assert!(matches!(next(&mut events).await, ConnectionEvent::DataError(_)));
        settle().await;
        assert!(events.try_recv().is_err());
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnection_window_exhausted_after_two_attempts() {
        let (transport, manager, mut events) = connected(Duration::from_secs(8)).await;

        transport.refuse_connects();
        transport.drop_connection(Some("reset"));

        assert!(matches!(next(&mut events).await, ConnectionEvent::ReconnectionAttempt(1)));
        assert!(manager.is_reconnecting());
        assert!(matches!(next(&mut events).await, ConnectionEvent::ReconnectionAttempt(2)));
        match next(&mut events).await {
            ConnectionEvent::Disconnected { reason } => assert_eq!(reason.as_deref(), Some("reset")),
            other => panic!("unexpected event {:?}", other),
        }

        assert!(!manager.is_reconnecting());
        assert!(!manager.is_connected());
        // Initial connect plus two retries
        assert_eq!(transport.connects().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_reports_reconnection() {
        let (transport, manager, mut events) = connected(Duration::from_secs(30)).await;

        transport.drop_connection(None);
        assert!(matches!(next(&mut events).await, ConnectionEvent::ReconnectionAttempt(1)));
        assert!(matches!(
            next(&mut events).await,
            ConnectionEvent::Connected { is_reconnection: true }
        ));
        assert!(manager.is_connected());
        assert!(!manager.is_reconnecting());

        // A later outage starts counting from one again
        transport.drop_connection(None);
        assert!(matches!(next(&mut events).await, ConnectionEvent::ReconnectionAttempt(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_disconnect_bypasses_reconnection() {
        let (transport, manager, mut events) = connected(Duration::from_secs(30)).await;

        manager.disconnect(Some(MANUAL_DISCONNECT_REASON.to_string()));
        match next(&mut events).await {
            ConnectionEvent::Disconnected { reason } => {
                assert_eq!(reason.as_deref(), Some(MANUAL_DISCONNECT_REASON))
            }
            other => panic!("unexpected event {:?}", other),
        }

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(transport.connects().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_window_disconnect_is_terminal() {
        let (transport, _manager, mut events) = connected(Duration::ZERO).await;

        transport.drop_connection(None);
        assert!(matches!(
            next(&mut events).await,
            ConnectionEvent::Disconnected { reason: None }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_cancels_pending_retry() {
        let (transport, manager, mut events) = connected(Duration::from_secs(30)).await;

        transport.refuse_connects();
        transport.drop_connection(None);
        assert!(matches!(next(&mut events).await, ConnectionEvent::ReconnectionAttempt(1)));

        manager.kill();
        assert!(matches!(
            next(&mut events).await,
            ConnectionEvent::Disconnected { reason: None }
        ));
        assert_eq!(transport.kills(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(transport.connects().len(), 1);
    }

    #[tokio::test]
    async fn test_kill_right_after_connect_is_terminal() {
        let (transport, manager, mut events) = start(Duration::from_secs(30));

        // Connected is queued by the transport before the kill is handled
        manager.connect("game.example", 7777);
        manager.kill();
        assert!(matches!(
            next(&mut events).await,
            ConnectionEvent::Disconnected { reason: None }
        ));

        settle().await;
        assert!(events.try_recv().is_err());
        assert!(!manager.is_connected());
        assert_eq!(transport.state(), TransportState::Disconnected);

        // The manager accepts a fresh connect afterwards
        manager.connect("game.example", 7777);
        assert!(matches!(
            next(&mut events).await,
            ConnectionEvent::Connected { is_reconnection: false }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_after_remote_drop_does_not_reconnect() {
        let (transport, manager, mut events) = connected(Duration::from_secs(30)).await;

        transport.drop_connection(None);
        manager.kill();
        assert!(matches!(
            next(&mut events).await,
            ConnectionEvent::Disconnected { reason: None }
        ));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(events.try_recv().is_err());
        assert!(!manager.is_reconnecting());
        assert_eq!(transport.connects().len(), 1);
    }

    #[tokio::test]
    async fn test_remote_close_over_tcp_goes_to_reconnection() {
        let listener = listen_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let registry = Arc::new(MessageRegistry::with_protocol_messages());
        let (manager, mut events) =
            ConnectionManager::start(StreamTransport::plain(), registry, Duration::from_secs(30));
        manager.connect("127.0.0.1", port);
        let (server, _) = listener.accept().await.unwrap();
        assert!(matches!(
            next(&mut events).await,
            ConnectionEvent::Connected { is_reconnection: false }
        ));

        drop(server);
        match next(&mut events).await {
            ConnectionEvent::ReconnectionAttempt(1) => {}
            other => panic!("unexpected event {:?}", other),
        }

        // The read error that follows is absorbed by the outage
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events.try_recv().is_err());
        assert!(manager.is_reconnecting());
        manager.destroy();
    }

    #[tokio::test]
    async fn test_connect_failure_is_io_error() {
        let (transport, manager, mut events) = start(Duration::from_secs(30));
        transport.refuse_connects();
        manager.connect("game.example", 7777);

        match next(&mut events).await {
            ConnectionEvent::IoError(message) => assert_eq!(message, "connection refused"),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn test_destroy_releases_transport() {
        let (transport, manager, mut events) = connected(Duration::from_secs(30)).await;

        manager.destroy();
        assert!(timeout(Duration::from_secs(5), events.recv()).await.unwrap().is_none());
        assert!(transport.is_destroyed());
        assert!(!manager.is_connected());

        // Handles outlive the actor without panicking
        manager.connect("game.example", 7777);
        manager.send(&PingPong);
    }
}

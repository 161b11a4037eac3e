//! Stream socket transport driver (plain TCP, or TLS with the `tls` feature).
//!
//! Connection establishment runs on a spawned task which then becomes the
//! read loop. Writes go through an unbounded queue drained by a writer task,
//! so [`Transport::write`] never waits on the socket. Every spawned task
//! carries the connection generation it was started for and its events are
//! dropped once the transport has moved on to another generation.

use crate::error::TransportError;
use crate::transport::{
    connect_tcp, IoStream, Transport, TransportEvent, TransportEventSender, TransportState,
};
use bytes::{Bytes, BytesMut};
use pdnet_wire::take_complete_frames;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// How the TCP stream is wrapped once connected
#[derive(Clone)]
enum Connector {
    Plain,
    #[cfg(feature = "tls")]
    Tls {
        config: Arc<rustls::ClientConfig>,
        server_name: Option<String>,
    },
}

struct StreamInner {
    state: TransportState,
    generation: u64,
    remote_addr: Option<SocketAddr>,
    events: Option<TransportEventSender>,
    writer: Option<mpsc::UnboundedSender<Bytes>>,
    reader_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
}

impl StreamInner {
    fn emit(&self, event: TransportEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                debug!("Transport event dropped, receiver is gone");
            }
        }
    }

    /// Invalidate the current connection and stop its tasks
    fn teardown(&mut self, abort_writer: bool) {
        self.generation += 1;
        self.state = TransportState::Disconnected;
        self.remote_addr = None;
        self.writer = None;
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        // Without an abort the writer drains its queue and shuts the socket down
        if let Some(task) = self.writer_task.take() {
            if abort_writer {
                task.abort();
            }
        }
    }
}

type Shared = Arc<Mutex<StreamInner>>;

fn lock(shared: &Shared) -> MutexGuard<'_, StreamInner> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// TCP stream transport
#[derive(Clone)]
pub struct StreamTransport {
    inner: Shared,
    connector: Connector,
}

impl StreamTransport {
    /// Create a plain TCP transport
    pub fn plain() -> Self {
        Self::with_connector(Connector::Plain)
    }

    /// Create a TLS transport; `server_name` defaults to the connect host
    #[cfg(feature = "tls")]
    pub fn tls(config: rustls::ClientConfig, server_name: Option<String>) -> Self {
        Self::with_connector(Connector::Tls {
            config: Arc::new(config),
            server_name,
        })
    }

    /// Resolved address of the connected server
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner).remote_addr
    }

    fn with_connector(connector: Connector) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StreamInner {
                state: TransportState::Disconnected,
                generation: 0,
                remote_addr: None,
                events: None,
                writer: None,
                reader_task: None,
                writer_task: None,
            })),
            connector,
        }
    }
}

impl Default for StreamTransport {
    fn default() -> Self {
        Self::plain()
    }
}

impl Transport for StreamTransport {
    fn bind(&self, events: TransportEventSender) {
        lock(&self.inner).events = Some(events);
    }

    fn connect(&self, host: &str, port: u16) {
        let mut inner = lock(&self.inner);
        if inner.state != TransportState::Disconnected {
            warn!(state = ?inner.state, "Connect ignored, socket is already connected or connecting");
            return;
        }

        inner.state = TransportState::Connecting;
        inner.generation += 1;
        let generation = inner.generation;
        debug!(host, port, generation, "Connecting");

        inner.reader_task = Some(tokio::spawn(run_connection(
            self.inner.clone(),
            self.connector.clone(),
            host.to_owned(),
            port,
            generation,
        )));
    }

    fn write(&self, data: Bytes) -> Result<(), TransportError> {
        let inner = lock(&self.inner);
        if inner.state != TransportState::Connected {
            return Err(TransportError::NotConnected);
        }
        match &inner.writer {
            Some(writer) => writer.send(data).map_err(|_| TransportError::NotConnected),
            None => Err(TransportError::NotConnected),
        }
    }

    fn disconnect(&self, reason: Option<String>) {
        let mut inner = lock(&self.inner);
        if inner.state != TransportState::Connected {
            warn!(state = ?inner.state, "Disconnect ignored, socket is not connected");
            return;
        }

        info!(reason = ?reason, "Disconnecting");
        inner.teardown(false);
        inner.emit(TransportEvent::Disconnected { reason });
    }

    fn kill(&self) {
        let mut inner = lock(&self.inner);
        if inner.state != TransportState::Disconnected {
            debug!(state = ?inner.state, "Killing connection");
        }
        inner.teardown(true);
    }

    fn destroy(&self) {
        let mut inner = lock(&self.inner);
        inner.teardown(true);
        inner.events = None;
    }

    fn state(&self) -> TransportState {
        lock(&self.inner).state
    }
}

async fn open_stream(connector: &Connector, host: &str, port: u16) -> io::Result<IoStream> {
    let tcp = connect_tcp(host, port).await?;
    match connector {
        Connector::Plain => Ok(IoStream::Plain(tcp)),
        #[cfg(feature = "tls")]
        Connector::Tls {
            config,
            server_name,
        } => {
            let sni = server_name.as_deref().unwrap_or(host);
            crate::transport::tls::connect_tls(config.clone(), tcp, sni)
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::ConnectionAborted, format!("{e:#}")))
        }
    }
}

async fn run_connection(
    shared: Shared,
    connector: Connector,
    host: String,
    port: u16,
    generation: u64,
) {
    let stream = match open_stream(&connector, &host, port).await {
        Ok(stream) => stream,
        Err(e) => {
            fail(&shared, generation, format!("connection error: {e}"), e.kind());
            return;
        }
    };

    let remote_addr = match stream.peer_addr() {
        Ok(addr) => Some(addr),
        Err(e) => {
            debug!("Peer address unavailable: {}", e);
            None
        }
    };
    let (read_half, write_half) = tokio::io::split(stream);
    {
        let mut inner = lock(&shared);
        if inner.generation != generation {
            debug!(generation, "Connection established after being abandoned, dropping it");
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        inner.writer = Some(tx);
        inner.writer_task = Some(tokio::spawn(write_loop(
            shared.clone(),
            write_half,
            rx,
            generation,
        )));
        inner.state = TransportState::Connected;
        inner.remote_addr = remote_addr;
        info!(host = %host, port, remote = ?remote_addr, "Connected");
        inner.emit(TransportEvent::Connected);
    }

    read_loop(&shared, read_half, generation).await;
}

async fn read_loop(shared: &Shared, mut reader: ReadHalf<IoStream>, generation: u64) {
    let mut buffer = BytesMut::with_capacity(READ_CHUNK_SIZE);

    loop {
        buffer.reserve(READ_CHUNK_SIZE);
        match reader.read_buf(&mut buffer).await {
            Ok(0) => {
                fail(
                    shared,
                    generation,
                    "connection closed by the remote side".to_string(),
                    io::ErrorKind::UnexpectedEof,
                );
                return;
            }
            Ok(n) => {
                trace!(bytes = n, buffered = buffer.len(), "Read from socket");
                let chunk = match take_complete_frames(&mut buffer) {
                    Ok(Some(frames)) => frames,
                    Ok(None) => continue,
                    Err(e) => {
                        // The stream can no longer be delimited; hand the bytes
                        // up so decoding reports them as a data error.
                        warn!("Discarding undelimitable stream data: {}", e);
                        buffer.split().freeze()
                    }
                };

                let inner = lock(shared);
                if inner.generation != generation {
                    return;
                }
                inner.emit(TransportEvent::Data(chunk));
            }
            Err(e) => {
                fail(shared, generation, format!("error reading from socket: {e}"), e.kind());
                return;
            }
        }
    }
}

async fn write_loop(
    shared: Shared,
    mut writer: WriteHalf<IoStream>,
    mut queue: mpsc::UnboundedReceiver<Bytes>,
    generation: u64,
) {
    while let Some(data) = queue.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            fail(&shared, generation, format!("error writing to socket: {e}"), e.kind());
            return;
        }
        trace!(bytes = data.len(), "Wrote to socket");
    }

    if let Err(e) = writer.shutdown().await {
        debug!("Socket shutdown failed: {}", e);
    }
}

/// Error-driven teardown
///
/// A live connection raises `Disconnected` before the `Error`, so the
/// manager sees the loss first and can fold the error into reconnection.
fn fail(shared: &Shared, generation: u64, message: String, kind: io::ErrorKind) {
    let mut inner = lock(shared);
    if inner.generation != generation || inner.state == TransportState::Disconnected {
        return;
    }

    let was_connected = inner.state == TransportState::Connected;
    error!(kind = ?kind, "{}", message);
    inner.teardown(true);
    if was_connected {
        inner.emit(TransportEvent::Disconnected { reason: None });
    }
    inner.emit(TransportEvent::Error { message, kind });
}

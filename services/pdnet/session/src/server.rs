//! Peer server: accepts stream connections and keeps a registry of peers.
//!
//! Each accepted connection gets a one-byte peer id, a reader task that
//! reassembles and decodes frames, and a writer queue. The registry is a
//! concurrent map so sends and broadcasts can come from any task.

use crate::error::TransportError;
use crate::transport::{listen_tcp, IoStream};
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use pdnet_wire::{decode_frames, encode_message, take_complete_frames, Message};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

const READ_CHUNK_SIZE: usize = 8 * 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Events raised by the peer server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Listening on the given address
    Started(SocketAddr),
    /// A peer connected
    PeerConnected {
        /// Assigned peer id
        peer: u8,
        /// Remote address
        addr: SocketAddr,
    },
    /// A peer went away or was disconnected
    PeerDisconnected {
        /// Peer id
        peer: u8,
        /// Why the peer is gone
        reason: Option<String>,
    },
    /// One frame received from a peer
    Frame {
        /// Sender
        peer: u8,
        /// Message header
        header: u8,
        /// Message body
        body: Bytes,
    },
    /// Listener or peer error
    Error(String),
}

struct PeerEntry {
    serial: u64,
    addr: SocketAddr,
    writer: mpsc::UnboundedSender<Bytes>,
    reader: JoinHandle<()>,
}

type Registry = Arc<DashMap<u8, PeerEntry>>;

/// TCP server with a peer registry
pub struct PeerServer {
    local_addr: SocketAddr,
    peers: Registry,
    events: mpsc::UnboundedSender<ServerEvent>,
    accept_task: JoinHandle<()>,
}

impl PeerServer {
    /// Bind `addr` and start accepting peers
    pub async fn start(
        addr: SocketAddr,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> Result<Self, TransportError> {
        let listener = listen_tcp(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Peer server listening on {}", local_addr);
        emit(&events, ServerEvent::Started(local_addr));

        let peers: Registry = Arc::new(DashMap::new());
        let accept_task = tokio::spawn(accept_loop(listener, peers.clone(), events.clone()));

        Ok(Self {
            local_addr,
            peers,
            events,
            accept_task,
        })
    }

    /// Address the server is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connected peers
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Ids of connected peers
    pub fn peers(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.peers.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Remote address of a peer
    pub fn peer_addr(&self, peer: u8) -> Option<SocketAddr> {
        self.peers.get(&peer).map(|entry| entry.addr)
    }

    /// Queue raw bytes for one peer
    pub fn send_to(&self, peer: u8, data: Bytes) -> Result<(), TransportError> {
        let entry = self.peers.get(&peer).ok_or(TransportError::UnknownPeer(peer))?;
        entry
            .writer
            .send(data)
            .map_err(|_| TransportError::NotConnected)
    }

    /// Encode and queue a message for one peer
    pub fn send_message_to(&self, peer: u8, message: &dyn Message) -> Result<(), TransportError> {
        self.send_to(peer, encode_message(message)?)
    }

    /// Queue raw bytes for the listed peers, skipping unknown ids
    pub fn send_to_many(&self, recipients: &[u8], data: Bytes) {
        for &peer in recipients {
            if let Err(e) = self.send_to(peer, data.clone()) {
                warn!(peer, "Send skipped: {}", e);
            }
        }
    }

    /// Queue raw bytes for every peer
    pub fn broadcast(&self, data: Bytes) {
        for entry in self.peers.iter() {
            if entry.writer.send(data.clone()).is_err() {
                debug!(peer = *entry.key(), "Broadcast skipped closing peer");
            }
        }
    }

    /// Encode a message once and queue it for every peer
    pub fn broadcast_message(&self, message: &dyn Message) -> Result<(), TransportError> {
        self.broadcast(encode_message(message)?);
        Ok(())
    }

    /// Close one peer's connection; returns false if it was not connected
    pub fn disconnect_peer(&self, peer: u8, reason: Option<String>) -> bool {
        match self.peers.remove(&peer) {
            Some((_, entry)) => {
                // Dropping the writer flushes queued data and shuts the socket down
                entry.reader.abort();
                info!(peer, reason = ?reason, "Peer disconnected by server");
                emit(&self.events, ServerEvent::PeerDisconnected { peer, reason });
                true
            }
            None => false,
        }
    }

    /// Stop accepting and disconnect every peer
    pub fn shutdown(&self) {
        self.accept_task.abort();
        for peer in self.peers() {
            self.disconnect_peer(peer, Some("server shutdown".to_string()));
        }
        info!("Peer server on {} stopped", self.local_addr);
    }
}

impl Drop for PeerServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        for entry in self.peers.iter() {
            entry.reader.abort();
        }
    }
}

fn emit(events: &mpsc::UnboundedSender<ServerEvent>, event: ServerEvent) {
    if events.send(event).is_err() {
        debug!("Server event dropped, receiver is gone");
    }
}

fn next_free_id(peers: &Registry, after: u8) -> Option<u8> {
    let mut candidate = after;
    for _ in 0..u8::MAX {
        candidate = if candidate == u8::MAX { 1 } else { candidate + 1 };
        if !peers.contains_key(&candidate) {
            return Some(candidate);
        }
    }
    None
}

async fn accept_loop(
    listener: TcpListener,
    peers: Registry,
    events: mpsc::UnboundedSender<ServerEvent>,
) {
    let mut next_serial = 0u64;
    let mut last_id = 0u8;

    loop {
        let (tcp, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Accept failed: {}", e);
                emit(&events, ServerEvent::Error(format!("accept failed: {e}")));
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        let Some(peer) = next_free_id(&peers, last_id) else {
            warn!(addr = %addr, "No free peer id, rejecting connection");
            continue;
        };
        last_id = peer;

        if let Err(e) = tcp.set_nodelay(true) {
            debug!(peer, "Could not set TCP_NODELAY: {}", e);
        }

        let (read_half, write_half) = tokio::io::split(IoStream::Plain(tcp));
        let (tx, rx) = mpsc::unbounded_channel();
        let serial = next_serial;
        next_serial += 1;

        // The reader waits for registration so its removal can't race the insert
        let (registered_tx, registered_rx) = oneshot::channel();
        tokio::spawn(write_loop(peer, write_half, rx));
        let reader = tokio::spawn(read_loop(
            peer,
            serial,
            read_half,
            peers.clone(),
            events.clone(),
            registered_rx,
        ));

        peers.insert(
            peer,
            PeerEntry {
                serial,
                addr,
                writer: tx,
                reader,
            },
        );
        info!(peer, addr = %addr, "Peer connected");
        emit(&events, ServerEvent::PeerConnected { peer, addr });
        if registered_tx.send(()).is_err() {
            debug!(peer, "Reader finished before registration");
        }
    }
}

async fn read_loop(
    peer: u8,
    serial: u64,
    mut reader: ReadHalf<IoStream>,
    peers: Registry,
    events: mpsc::UnboundedSender<ServerEvent>,
    registered: oneshot::Receiver<()>,
) {
    if registered.await.is_err() {
        return;
    }
    let mut buffer = BytesMut::with_capacity(READ_CHUNK_SIZE);

    let reason = loop {
        buffer.reserve(READ_CHUNK_SIZE);
        match reader.read_buf(&mut buffer).await {
            Ok(0) => break "disconnected by peer".to_string(),
            Ok(n) => {
                trace!(peer, bytes = n, "Read from peer");
                let chunk = match take_complete_frames(&mut buffer) {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => continue,
                    Err(e) => {
                        buffer.clear();
                        warn!(peer, "Discarding undelimitable data: {}", e);
                        emit(&events, ServerEvent::Error(format!("peer {peer}: {e}")));
                        continue;
                    }
                };

                for frame in decode_frames(chunk) {
                    match frame {
                        Ok(frame) => {
                            emit(
                                &events,
                                ServerEvent::Frame {
                                    peer,
                                    header: frame.header,
                                    body: frame.body,
                                },
                            );
                        }
                        Err(e) => {
                            emit(&events, ServerEvent::Error(format!("peer {peer}: {e}")));
                        }
                    }
                }
            }
            Err(e) => break format!("read error: {e}"),
        }
    };

    // The server may already have removed this peer, or reused its id
    if peers.remove_if(&peer, |_, entry| entry.serial == serial).is_some() {
        info!(peer, reason = %reason, "Peer disconnected");
        emit(
            &events,
            ServerEvent::PeerDisconnected {
                peer,
                reason: Some(reason),
            },
        );
    }
}

async fn write_loop(
    peer: u8,
    mut writer: WriteHalf<IoStream>,
    mut queue: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(data) = queue.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            warn!(peer, "Write to peer failed: {}", e);
            return;
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!(peer, "Socket shutdown failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::connect_tcp;
    use pdnet_wire::{HandshakeResponse, PingPong};
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    async fn next(events: &mut UnboundedReceiver<ServerEvent>) -> ServerEvent {
        timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for server event")
            .expect("event channel closed")
    }

    async fn started() -> (PeerServer, UnboundedReceiver<ServerEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = PeerServer::start("127.0.0.1:0".parse().unwrap(), tx).await.unwrap();
        assert_eq!(next(&mut rx).await, ServerEvent::Started(server.local_addr()));
        (server, rx)
    }

    #[tokio::test]
    async fn test_peers_get_increasing_ids() {
        let (server, mut rx) = started().await;
        let port = server.local_addr().port();

        let _a = connect_tcp("127.0.0.1", port).await.unwrap();
        assert!(matches!(next(&mut rx).await, ServerEvent::PeerConnected { peer: 1, .. }));
        let _b = connect_tcp("127.0.0.1", port).await.unwrap();
        assert!(matches!(next(&mut rx).await, ServerEvent::PeerConnected { peer: 2, .. }));

        assert_eq!(server.peers(), vec![1, 2]);
        assert!(server.peer_addr(1).is_some());
    }

    #[tokio::test]
    async fn test_keeps_serving_without_event_receiver() {
        let (server, rx) = started().await;
        drop(rx);
        let port = server.local_addr().port();

        let mut client = connect_tcp("127.0.0.1", port).await.unwrap();
        client.write_all(&encode_message(&PingPong).unwrap()).await.unwrap();
        timeout(Duration::from_secs(5), async {
            while server.peer_count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        server.send_message_to(1, &PingPong).unwrap();
        let mut reply = [0u8; 3];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [1, 0, 1]);
        assert!(server.disconnect_peer(1, None));
    }

    #[tokio::test]
    async fn test_frames_and_replies() {
        let (server, mut rx) = started().await;
        let mut client = connect_tcp("127.0.0.1", server.local_addr().port()).await.unwrap();
        assert!(matches!(next(&mut rx).await, ServerEvent::PeerConnected { peer: 1, .. }));

        // Two frames in one write plus a split third
        let ping = encode_message(&PingPong).unwrap();
        let mut data = ping.to_vec();
        data.extend_from_slice(&ping);
        data.extend_from_slice(&ping[..2]);
        client.write_all(&data).await.unwrap();
        for _ in 0..2 {
            assert_eq!(
                next(&mut rx).await,
                ServerEvent::Frame { peer: 1, header: 1, body: Bytes::new() }
            );
        }
        client.write_all(&ping[2..]).await.unwrap();
        assert_eq!(
            next(&mut rx).await,
            ServerEvent::Frame { peer: 1, header: 1, body: Bytes::new() }
        );

        let reply = HandshakeResponse::Accepted { session_token: "t".into() };
        server.send_message_to(1, &reply).unwrap();
        let expected = encode_message(&reply).unwrap();
        let mut received = vec![0u8; expected.len()];
        client.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected.to_vec());

        assert!(matches!(
            server.send_to(9, Bytes::new()),
            Err(TransportError::UnknownPeer(9))
        ));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_peer() {
        let (server, mut rx) = started().await;
        let port = server.local_addr().port();
        let mut a = connect_tcp("127.0.0.1", port).await.unwrap();
        let mut b = connect_tcp("127.0.0.1", port).await.unwrap();
        next(&mut rx).await;
        next(&mut rx).await;

        server.broadcast_message(&PingPong).unwrap();
        for client in [&mut a, &mut b] {
            let mut received = [0u8; 3];
            client.read_exact(&mut received).await.unwrap();
            assert_eq!(received, [1, 0, 1]);
        }
    }

    #[tokio::test]
    async fn test_peer_close_and_server_disconnect() {
        let (server, mut rx) = started().await;
        let port = server.local_addr().port();

        let a = connect_tcp("127.0.0.1", port).await.unwrap();
        next(&mut rx).await;
        let mut b = connect_tcp("127.0.0.1", port).await.unwrap();
        next(&mut rx).await;

        drop(a);
        match next(&mut rx).await {
            ServerEvent::PeerDisconnected { peer, reason } => {
                assert_eq!(peer, 1);
                assert_eq!(reason.as_deref(), Some("disconnected by peer"));
            }
            other => panic!("unexpected event {:?}", other),
        }

        assert!(server.disconnect_peer(2, Some("kicked".into())));
        assert_eq!(
            next(&mut rx).await,
            ServerEvent::PeerDisconnected { peer: 2, reason: Some("kicked".into()) }
        );
        assert!(!server.disconnect_peer(2, None));
        assert_eq!(server.peer_count(), 0);

        // Client sees the socket closed
        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(5), b.read(&mut buf)).await.unwrap().unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_all() {
        let (server, mut rx) = started().await;
        let port = server.local_addr().port();
        let _a = connect_tcp("127.0.0.1", port).await.unwrap();
        next(&mut rx).await;

        server.shutdown();
        assert_eq!(
            next(&mut rx).await,
            ServerEvent::PeerDisconnected { peer: 1, reason: Some("server shutdown".into()) }
        );
        assert_eq!(server.peer_count(), 0);
    }
}

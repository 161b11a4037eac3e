//! Unreliable datagram side channel.
//!
//! Fire-and-forget: no retry, no ordering, no backpressure. Outbound
//! messages use the same header/body encoding as the stream path; every
//! inbound datagram is handed to the callback as-is.

use crate::error::TransportError;
use bytes::Bytes;
use pdnet_wire::{encode_message, Message};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{lookup_host, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Bound UDP socket with a receive task
#[derive(Debug)]
pub struct DatagramChannel {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    receiver: JoinHandle<()>,
}

impl DatagramChannel {
    /// Bind `in_port` locally, resolve the outbound endpoint and start receiving
    pub async fn bind<F>(
        out_host: &str,
        out_port: u16,
        in_port: u16,
        on_datagram: F,
    ) -> Result<Self, TransportError>
    where
        F: Fn(Bytes) + Send + 'static,
    {
        let remote = lookup_host((out_host, out_port))
            .await?
            .next()
            .ok_or_else(|| TransportError::Resolve(format!("{out_host}:{out_port}")))?;

        let local: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, in_port).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, in_port).into()
        };
        let socket = Arc::new(UdpSocket::bind(local).await?);
        info!(local = %socket.local_addr()?, remote = %remote, "Datagram channel bound");

        let receiver = tokio::spawn(receive_loop(socket.clone(), on_datagram));
        Ok(Self {
            socket,
            remote,
            receiver,
        })
    }

    /// Local address the channel receives on
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Remote endpoint datagrams are sent to
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Send raw bytes; dropped if the socket is not ready
    pub fn send(&self, data: &[u8]) {
        match self.socket.try_send_to(data, self.remote) {
            Ok(n) => trace!(bytes = n, "Datagram sent"),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!(bytes = data.len(), "Datagram dropped, socket not ready")
            }
            Err(e) => warn!("Datagram send failed: {}", e),
        }
    }

    /// Encode and send a message
    pub fn send_message(&self, message: &dyn Message) {
        match encode_message(message) {
            Ok(frame) => self.send(&frame),
            Err(e) => warn!(?message, "Could not encode datagram: {}", e),
        }
    }

    /// Stop receiving
    pub fn close(&self) {
        self.receiver.abort();
    }
}

impl Drop for DatagramChannel {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

async fn receive_loop<F>(socket: Arc<UdpSocket>, on_datagram: F)
where
    F: Fn(Bytes) + Send + 'static,
{
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                trace!(bytes = n, from = %from, "Datagram received");
                on_datagram(Bytes::copy_from_slice(&buf[..n]));
            }
            Err(e) => {
                warn!("Datagram receive failed, closing side channel: {}", e);
                return;
            }
        }
    }
}

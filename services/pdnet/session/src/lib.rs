//! Transports, connection management, handshake and latency monitoring for pdnet.
//!
//! This crate keeps a client connected to an application server over a
//! pluggable [`Transport`], decodes inbound frames through a
//! [`pdnet_wire::MessageRegistry`], runs the handshake with session
//! resumption and measures round-trip latency.
//!
//! ## Features
//!
//! - **Transport contract**: stream socket driver (plain TCP, TLS behind the
//!   `tls` feature) and a datagram side channel
//! - **Connection manager**: actor owning the transport, with a fixed-delay
//!   reconnection inside a configurable window
//! - **Session engine**: handshake, resumption and event fan-out
//! - **Latency monitor**: periodic ping with a sliding round-trip average
//! - **Peer server**: server-side peer registry with send and broadcast
//!
//! ## Example
//!
//! ```rust,no_run
//! use pdnet_session::{EngineConfig, SessionEngine, SessionEvent, StreamTransport};
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = EngineConfig {
//!     app_id: 1,
//!     auth_token: Some("token".into()),
//!     api_version: Some("1.0".into()),
//!     reconnection_window: Duration::from_secs(30),
//!     ..Default::default()
//! };
//!
//! let (engine, mut events) = SessionEngine::configure(config, StreamTransport::plain())?;
//! engine.connect("127.0.0.1", 7777);
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SessionEvent::Connected { is_reconnection } => {
//!             println!("Connected (reconnection: {})", is_reconnection);
//!         }
//!         SessionEvent::Response(message) => {
//!             println!("Received {:?}", message);
//!         }
//!         SessionEvent::Disconnected { reason } => {
//!             println!("Disconnected: {:?}", reason);
//!             break;
//!         }
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod datagram;
pub mod error;
pub mod latency;
pub mod manager;
pub mod reconnect;
pub mod server;
pub mod session;
pub mod stream;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export main types
pub use datagram::DatagramChannel;
pub use error::{EngineError, TransportError};
pub use latency::{
    LatencyMonitor, LatencyWindow, PingSender, DEFAULT_PING_INTERVAL, DEFAULT_WINDOW_SIZE,
    MIN_PING_INTERVAL,
};
pub use manager::{ConnectionEvent, ConnectionManager, MANUAL_DISCONNECT_REASON};
pub use reconnect::{ReconnectionContext, RetryDecision, RECONNECTION_DELAY};
pub use server::{PeerServer, ServerEvent};
pub use session::{EngineConfig, Session, SessionEngine, SessionEvent};
pub use stream::StreamTransport;
pub use transport::{
    connect_tcp, listen_tcp, IoStream, Transport, TransportEvent, TransportEventSender,
    TransportState,
};

// Re-export TLS functionality when available
#[cfg(feature = "tls")]
pub use transport::tls::{connect_tls, make_client_config, ClientIdentity};

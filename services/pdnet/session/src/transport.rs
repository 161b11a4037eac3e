//! Transport contract and the stream types shared by the drivers.
//!
//! The connection manager depends only on [`Transport`]. A transport reports
//! everything that happens to it as [`TransportEvent`]s on the channel it was
//! bound to, so callbacks from I/O tasks are funneled into a single owner.

use crate::error::TransportError;
use bytes::Bytes;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
#[cfg(feature = "tls")]
use tracing::{debug, info};

/// Connection state owned by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// No connection and no attempt in flight
    Disconnected,
    /// Connection establishment in progress
    Connecting,
    /// Connection established
    Connected,
}

/// Events raised by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Connection established
    Connected,
    /// Connection closed
    Disconnected {
        /// Why the connection was closed, if a reason was given
        reason: Option<String>,
    },
    /// One or more complete frames received
    Data(Bytes),
    /// I/O failure
    Error {
        /// Human readable description
        message: String,
        /// Kind of the underlying I/O error
        kind: std::io::ErrorKind,
    },
}

/// Sink a transport raises its events on
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// Uniform transport contract
///
/// Every method returns immediately. Connection establishment and reads run
/// on background tasks and report back through the bound event channel.
pub trait Transport: Send + Sync + 'static {
    /// Attach the channel that receives this transport's events
    fn bind(&self, events: TransportEventSender);

    /// Start connecting; warns and does nothing if not disconnected
    fn connect(&self, host: &str, port: u16);

    /// Queue bytes for writing; fails if not connected
    fn write(&self, data: Bytes) -> Result<(), TransportError>;

    /// Close the connection and raise `Disconnected { reason }`
    fn disconnect(&self, reason: Option<String>);

    /// Tear the connection down without raising any event
    fn kill(&self);

    /// Release every resource; no events are raised afterwards
    fn destroy(&self);

    /// Current connection state
    fn state(&self) -> TransportState;
}

/// Unified stream type that can be either plain TCP or TLS
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// TLS client stream
    #[cfg(feature = "tls")]
    TlsClient(tokio_rustls::client::TlsStream<TcpStream>),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl IoStream {
    /// Get the peer address of the underlying stream
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            IoStream::Plain(stream) => stream.peer_addr(),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => stream.get_ref().0.peer_addr(),
        }
    }
}

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> tokio::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to a host and port with Nagle's algorithm disabled
pub async fn connect_tcp(host: &str, port: u16) -> tokio::io::Result<TcpStream> {
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

// TLS-specific functionality
#[cfg(feature = "tls")]
/// TLS client support for the stream transport
pub mod tls {
    use super::*;
    use anyhow::{Context as AnyhowContext, Result};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
    use rustls::{ClientConfig, RootCertStore};
    use std::sync::Arc;
    use tokio_rustls::TlsConnector;

    /// Client certificate chain and private key for mTLS
    #[derive(Debug, Clone)]
    pub struct ClientIdentity {
        /// PEM encoded certificate chain
        pub cert_chain_pem: String,
        /// PEM encoded PKCS#8 private key
        pub private_key_pem: String,
    }

    /// Create a TLS client configuration trusting the given CA bundle
    pub fn make_client_config(
        ca_pem: &str,
        identity: Option<&ClientIdentity>,
    ) -> Result<ClientConfig> {
        info!(mtls = identity.is_some(), "Creating TLS client configuration");

        // Install default crypto provider if not already set
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut roots = RootCertStore::empty();
        let ca_results: Result<Vec<_>, _> = rustls_pemfile::certs(&mut ca_pem.as_bytes()).collect();
        let ca_certs = ca_results.context("Failed to parse CA certificates")?;
        if ca_certs.is_empty() {
            anyhow::bail!("No CA certificates found");
        }

        for ca_cert in ca_certs {
            roots
                .add(CertificateDer::from(ca_cert))
                .context("Failed to add CA certificate to root store")?;
        }

        let builder = ClientConfig::builder().with_root_certificates(roots);
        let config = match identity {
            None => builder.with_no_client_auth(),
            Some(identity) => {
                let cert_results: Result<Vec<_>, _> =
                    rustls_pemfile::certs(&mut identity.cert_chain_pem.as_bytes()).collect();
                let certs = cert_results
                    .context("Failed to parse certificate chain")?
                    .into_iter()
                    .map(CertificateDer::from)
                    .collect::<Vec<_>>();

                if certs.is_empty() {
                    anyhow::bail!("No certificates found in certificate chain");
                }

                let key_results: Result<Vec<_>, _> =
                    rustls_pemfile::pkcs8_private_keys(&mut identity.private_key_pem.as_bytes())
                        .collect();
                let mut keys = key_results.context("Failed to parse private key")?;
                if keys.is_empty() {
                    anyhow::bail!("No private key found");
                }
                let key = PrivateKeyDer::from(keys.remove(0));

                builder
                    .with_client_auth_cert(certs, key)
                    .context("Failed to configure client certificate")?
            }
        };

        Ok(config)
    }

    /// Run the TLS client handshake over an established TCP stream
    pub async fn connect_tls(
        config: Arc<ClientConfig>,
        tcp_stream: TcpStream,
        sni: &str,
    ) -> Result<IoStream> {
        debug!("Starting TLS handshake (SNI: {})", sni);

        let connector = TlsConnector::from(config);
        let server_name = ServerName::try_from(sni.to_owned())
            .map_err(|_| anyhow::anyhow!("Invalid server name: {}", sni))?;

        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .with_context(|| format!("TLS handshake failed (SNI: {})", sni))?;

        debug!("TLS connection established");
        Ok(IoStream::TlsClient(tls_stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[tokio::test]
    async fn test_tcp_listen_connect() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = listen_tcp(addr).await.unwrap();
        let bound_addr = listener.local_addr().unwrap();

        let stream = connect_tcp("127.0.0.1", bound_addr.port()).await.unwrap();
        assert!(stream.nodelay().unwrap());

        let io_stream = IoStream::Plain(stream);
        assert_eq!(io_stream.peer_addr().unwrap(), bound_addr);
    }

    #[cfg(feature = "tls")]
    #[test]
    fn test_client_config_rejects_empty_ca() {
        assert!(tls::make_client_config("", None).is_err());
    }
}

//! Reference server: answers handshakes and pings for local testing.

use anyhow::Result;
use bytes::Bytes;
use pdnet_session::{PeerServer, ServerEvent};
use pdnet_wire::{HandshakeErrorCode, HandshakeRequest, HandshakeResponse, Header, Message, PingPong};
use std::collections::HashSet;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Protocol side of the reference server, kept free of I/O
#[derive(Debug, Default)]
pub struct ReferenceHandler {
    api_version: Option<String>,
    issued_tokens: HashSet<String>,
}

impl ReferenceHandler {
    pub fn new(api_version: Option<String>) -> Self {
        Self {
            api_version,
            issued_tokens: HashSet::new(),
        }
    }

    /// Reply to one inbound frame, `None` when no reply is due
    pub fn respond(&mut self, peer: u8, header: u8, body: Bytes) -> Option<Box<dyn Message>> {
        match Header::try_from(header) {
            Ok(Header::Handshake) => Some(Box::new(self.handshake(peer, body))),
            Ok(Header::PingPong) => Some(Box::new(PingPong)),
            Err(_) => {
                debug!(peer, header, bytes = body.len(), "Application frame ignored");
                None
            }
        }
    }

    fn handshake(&mut self, peer: u8, body: Bytes) -> HandshakeResponse {
        let request = match HandshakeRequest::decode(body) {
            Ok(request) => request,
            Err(e) => {
                warn!(peer, "Malformed handshake: {}", e);
                return HandshakeResponse::Rejected {
                    error: format!("malformed handshake: {}", e),
                    code: HandshakeErrorCode::OtherError,
                };
            }
        };

        if let Some(required) = &self.api_version {
            if request.api_version.as_deref() != Some(required.as_str()) {
                warn!(peer, offered = ?request.api_version, "Handshake rejected, wrong API version");
                return HandshakeResponse::Rejected {
                    error: format!("API version {} required", required),
                    code: HandshakeErrorCode::WrongVersion,
                };
            }
        }

        if let Some(token) = request.session_token {
            if !self.issued_tokens.contains(&token) {
                warn!(peer, "Handshake rejected, unknown session token");
                return HandshakeResponse::Rejected {
                    error: "unknown session token".to_string(),
                    code: HandshakeErrorCode::InvalidSessionToken,
                };
            }
            info!(peer, app_id = request.app_id, "Session resumed");
            return HandshakeResponse::Accepted { session_token: token };
        }

        let session_token = Uuid::new_v4().to_string();
        self.issued_tokens.insert(session_token.clone());
        info!(peer, app_id = request.app_id, "Session started");
        HandshakeResponse::Accepted { session_token }
    }
}

/// Run the reference server until the event stream ends
pub async fn serve(listen: SocketAddr, api_version: Option<String>) -> Result<()> {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let server = PeerServer::start(listen, events_tx).await?;
    let mut handler = ReferenceHandler::new(api_version);

    while let Some(event) = events.recv().await {
        match event {
            ServerEvent::Started(addr) => info!("Reference server ready on {}", addr),
            ServerEvent::PeerConnected { peer, addr } => info!(peer, %addr, "Peer connected"),
            ServerEvent::PeerDisconnected { peer, reason } => {
                info!(peer, reason = ?reason, "Peer disconnected")
            }
            ServerEvent::Frame { peer, header, body } => {
                if let Some(reply) = handler.respond(peer, header, body) {
                    if let Err(e) = server.send_message_to(peer, reply.as_ref()) {
                        warn!(peer, "Reply not sent: {}", e);
                    }
                }
            }
            ServerEvent::Error(message) => error!("Server error: {}", message),
        }
    }

    server.shutdown();
    Ok(())
}

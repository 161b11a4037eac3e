//! pdnet binary.
//!
//! `pdnet connect` runs a client session against a server and logs its
//! events; `pdnet serve` runs the reference server that answers handshakes
//! and pings.

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use pdnet_session::{SessionEngine, SessionEvent, StreamTransport};
use pdnet_wire::HandshakeResponse;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;
mod reference;

use config::{PdnetConfig, UnreliableConfig};
use logging::PdnetLogFormatter;

const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// Client network engine with reconnection and session resumption
#[derive(Parser, Debug)]
#[command(name = "pdnet", version, about = "Client network engine and reference server")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Configuration file path
    #[arg(long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to a server and keep the session alive
    Connect(ConnectArgs),
    /// Run the reference server
    Serve(ServeArgs),
}

#[derive(ClapArgs, Debug)]
struct ConnectArgs {
    /// Server host
    #[arg(long)]
    host: Option<String>,

    /// Server port
    #[arg(long)]
    port: Option<u16>,

    /// Application identifier
    #[arg(long)]
    app_id: Option<u8>,

    /// Authentication token
    #[arg(long)]
    auth_token: Option<String>,

    /// API version
    #[arg(long)]
    api_version: Option<String>,

    /// Reconnection window, e.g. 30s; 0s disables reconnection
    #[arg(long)]
    reconnect_window: Option<humantime::Duration>,

    /// Ping interval, e.g. 10s
    #[arg(long)]
    ping_interval: Option<humantime::Duration>,

    /// Remote port for the datagram side channel
    #[arg(long, requires = "unreliable_in_port")]
    unreliable_out_port: Option<u16>,

    /// Local port for the datagram side channel
    #[arg(long, requires = "unreliable_out_port")]
    unreliable_in_port: Option<u16>,

    /// Enable TLS
    #[arg(long)]
    tls: bool,

    /// Path to CA certificate file (PEM format)
    #[arg(long, requires = "tls")]
    tls_ca: Option<PathBuf>,

    /// Path to client certificate file (PEM format)
    #[arg(long, requires = "tls")]
    tls_cert: Option<PathBuf>,

    /// Path to client private key file (PEM format)
    #[arg(long, requires = "tls")]
    tls_key: Option<PathBuf>,

    /// Server name for TLS SNI
    #[arg(long)]
    tls_sni: Option<String>,

    /// Disconnect after this long, e.g. 5m
    #[arg(long)]
    run_for: Option<humantime::Duration>,
}

#[derive(ClapArgs, Debug)]
struct ServeArgs {
    /// Listen address, e.g. 0.0.0.0:7777
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// API version clients must present
    #[arg(long)]
    api_version: Option<String>,
}

impl ConnectArgs {
    /// Command line flags take precedence over file and environment
    fn apply_to(&self, config: &mut PdnetConfig) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(app_id) = self.app_id {
            config.app_id = app_id;
        }
        if let Some(token) = &self.auth_token {
            config.auth_token = Some(token.clone());
        }
        if let Some(version) = &self.api_version {
            config.api_version = Some(version.clone());
        }
        if let Some(window) = self.reconnect_window {
            config.reconnect_secs = Duration::from(window).as_secs();
        }
        if let Some(interval) = self.ping_interval {
            config.ping_interval_secs = Duration::from(interval).as_secs();
        }
        if let (Some(out_port), Some(in_port)) = (self.unreliable_out_port, self.unreliable_in_port) {
            config.unreliable = Some(UnreliableConfig { out_port, in_port });
        }
        if self.tls {
            config.tls.enabled = true;
        }
        if let Some(ca) = &self.tls_ca {
            config.tls.ca_file = ca.to_string_lossy().into_owned();
        }
        if let Some(cert) = &self.tls_cert {
            config.tls.cert_file = Some(cert.to_string_lossy().into_owned());
        }
        if let Some(key) = &self.tls_key {
            config.tls.key_file = Some(key.to_string_lossy().into_owned());
        }
        if let Some(sni) = &self.tls_sni {
            config.tls.server_name = Some(sni.clone());
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive(format!("pdnet={}", args.log_level).parse()?)
        .add_directive(format!("pdnet_session={}", args.log_level).parse()?)
        .add_directive(format!("pdnet_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .event_format(PdnetLogFormatter::new("pdnet"))
        .init();

    info!("Starting pdnet v{}", env!("CARGO_PKG_VERSION"));

    let mut config = PdnetConfig::load_from_file(&args.config)?;

    match args.command {
        Command::Connect(connect) => {
            connect.apply_to(&mut config);
            run_client(config, connect.run_for.map(Duration::from)).await
        }
        Command::Serve(serve) => {
            let listen = serve.listen.unwrap_or(config.server.listen);
            let api_version = serve.api_version.or(config.server.api_version);
            tokio::select! {
                result = reference::serve(listen, api_version) => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received interrupt, shutting down");
                    Ok(())
                }
            }
        }
    }
}

#[cfg(feature = "tls")]
fn make_transport(config: &PdnetConfig) -> Result<StreamTransport> {
    if !config.tls.enabled {
        return Ok(StreamTransport::plain());
    }

    let (ca_pem, identity) = config.read_tls_files()?;
    let identity = identity.map(|(cert_chain_pem, private_key_pem)| pdnet_session::ClientIdentity {
        cert_chain_pem,
        private_key_pem,
    });
    let client_config = pdnet_session::make_client_config(&ca_pem, identity.as_ref())?;
    info!("TLS enabled for {}:{}", config.host, config.port);
    Ok(StreamTransport::tls(client_config, config.tls.server_name.clone()))
}

#[cfg(not(feature = "tls"))]
fn make_transport(config: &PdnetConfig) -> Result<StreamTransport> {
    if config.tls.enabled {
        anyhow::bail!("TLS requested but not compiled with TLS support. Build with --features tls");
    }
    Ok(StreamTransport::plain())
}

async fn run_client(config: PdnetConfig, run_for: Option<Duration>) -> Result<()> {
    let transport = make_transport(&config)?;
    let (engine, mut events) = SessionEngine::configure(config.engine_config(), transport)
        .context("Invalid engine configuration")?;

    if let Some(unreliable) = &config.unreliable {
        engine
            .configure_unreliable(&config.host, unreliable.out_port, unreliable.in_port)
            .await
            .context("Failed to configure the datagram side channel")?;
        info!(
            out_port = unreliable.out_port,
            in_port = unreliable.in_port,
            "Datagram side channel ready"
        );
    }

    engine.connect(&config.host, config.port);

    // Only polled when a run time was given
    let deadline = tokio::time::sleep(run_for.unwrap_or(STATUS_INTERVAL));
    tokio::pin!(deadline);
    let mut status = tokio::time::interval_at(tokio::time::Instant::now() + STATUS_INTERVAL, STATUS_INTERVAL);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if !handle_event(&engine, event) {
                    break;
                }
            }
            _ = status.tick() => {
                info!(
                    connected = engine.is_connected(),
                    average_rtt_ms = engine.average_round_trip_ms(),
                    "Session status"
                );
            }
            _ = &mut deadline, if run_for.is_some() => {
                info!("Run time elapsed, disconnecting");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt, disconnecting");
                break;
            }
        }
    }

    engine.disconnect().await;
    engine.destroy();
    info!("pdnet client stopped");
    Ok(())
}

/// Log one session event; returns false when the client should stop
fn handle_event(engine: &SessionEngine, event: SessionEvent) -> bool {
    match event {
        SessionEvent::Connected { is_reconnection } => {
            info!(is_reconnection, "Connected, handshake sent");
        }
        SessionEvent::ConnectionResumed => info!("Session resumed"),
        SessionEvent::Response(response) => {
            if let Some(handshake) = response.downcast_ref::<HandshakeResponse>() {
                match handshake {
                    HandshakeResponse::Accepted { .. } => info!("Handshake accepted"),
                    HandshakeResponse::Rejected { error, code } => {
                        error!(?code, "Handshake rejected: {}", error);
                        return false;
                    }
                }
            } else {
                debug!(header = response.header(), "Message received");
            }
        }
        SessionEvent::ReconnectionAttempt(attempt) => {
            info!(attempt, window = ?engine.reconnection_window(), "Reconnecting");
        }
        SessionEvent::ConnectError(message) => warn!("Connection error: {}", message),
        SessionEvent::DataError(message) => warn!("Data error: {}", message),
        SessionEvent::UnreliableData(data) => debug!(bytes = data.len(), "Datagram received"),
        SessionEvent::Disconnected { reason } => {
            info!(reason = ?reason, "Disconnected");
            return false;
        }
    }
    true
}

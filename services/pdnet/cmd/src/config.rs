//! Configuration handling for the pdnet binary.
//!
//! Values come from the `pdnet` section of a YAML file, then environment
//! variables, then command line flags (applied in `main`).

use anyhow::{Context, Result};
use pdnet_session::EngineConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// pdnet configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PdnetConfig {
    /// Server host to connect to
    pub host: String,
    /// Server port to connect to
    pub port: u16,
    /// Application identifier
    pub app_id: u8,
    /// Authentication token sent in the handshake
    pub auth_token: Option<String>,
    /// API version sent in the handshake
    pub api_version: Option<String>,
    /// Reconnection window in seconds, 0 disables reconnection
    pub reconnect_secs: u64,
    /// Ping interval in seconds
    pub ping_interval_secs: u64,
    /// Round trips averaged by the latency monitor
    pub ping_window: usize,
    /// Datagram side channel
    pub unreliable: Option<UnreliableConfig>,
    /// TLS configuration
    pub tls: TlsConfig,
    /// Reference server configuration
    pub server: ServerConfig,
}

/// Datagram side channel ports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnreliableConfig {
    /// Remote port datagrams are sent to
    pub out_port: u16,
    /// Local port datagrams are received on
    pub in_port: u16,
}

/// TLS configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Whether TLS is enabled
    pub enabled: bool,
    /// Path to CA certificate file
    pub ca_file: String,
    /// Path to client certificate file, for mTLS
    pub cert_file: Option<String>,
    /// Path to client private key file, for mTLS
    pub key_file: Option<String>,
    /// Server name for SNI, defaults to the host
    pub server_name: Option<String>,
}

/// Reference server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: SocketAddr,
    /// API version clients must present, any when unset
    pub api_version: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 7777)),
            api_version: None,
        }
    }
}

impl Default for PdnetConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7777,
            app_id: 1,
            auth_token: None,
            api_version: None,
            reconnect_secs: 30,
            ping_interval_secs: 10,
            ping_window: 4,
            unreliable: None,
            tls: TlsConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    pdnet: Option<PdnetConfig>,
}

impl PdnetConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                    root.pdnet.unwrap_or_default()
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?}, using defaults: {}", config_path.as_ref(), e);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", config_path.as_ref());
                Self::default()
            }
        };

        config.apply_environment_overrides();

        info!(
            "Final pdnet configuration: server={}:{}, app_id={}, reconnect={}s",
            config.host, config.port, config.app_id, config.reconnect_secs
        );
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        if let Ok(host) = std::env::var("PDNET_HOST") {
            self.host = host;
            info!("Host overridden by environment: {}", self.host);
        }

        if let Ok(port) = std::env::var("PDNET_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    self.port = port;
                    info!("Port overridden by environment: {}", port);
                }
                Err(_) => warn!("Ignoring invalid PDNET_PORT {:?}", port),
            }
        }

        if let Ok(app_id) = std::env::var("PDNET_APP_ID") {
            match app_id.parse::<u8>() {
                Ok(id) => {
                    self.app_id = id;
                    info!("App ID overridden by environment: {}", id);
                }
                Err(_) => warn!("Ignoring invalid PDNET_APP_ID {:?}", app_id),
            }
        }

        if let Ok(token) = std::env::var("PDNET_AUTH_TOKEN") {
            self.auth_token = Some(token);
            info!("Auth token overridden by environment");
        }

        if let Ok(version) = std::env::var("PDNET_API_VERSION") {
            info!("API version overridden by environment: {}", version);
            self.api_version = Some(version);
        }

        if let Ok(secs) = std::env::var("PDNET_RECONNECT_SECS") {
            match secs.parse::<u64>() {
                Ok(secs) => {
                    self.reconnect_secs = secs;
                    info!("Reconnection window overridden by environment: {}s", secs);
                }
                Err(_) => warn!("Ignoring invalid PDNET_RECONNECT_SECS {:?}", secs),
            }
        }
    }

    /// Session engine settings derived from this configuration
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            app_id: self.app_id,
            auth_token: self.auth_token.clone(),
            api_version: self.api_version.clone(),
            reconnection_window: Duration::from_secs(self.reconnect_secs),
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            ping_window: self.ping_window,
            ..Default::default()
        }
    }

    /// Read the PEM files named by the TLS section
    #[cfg_attr(not(feature = "tls"), allow(dead_code))]
    pub fn read_tls_files(&self) -> Result<(String, Option<(String, String)>)> {
        let ca = std::fs::read_to_string(&self.tls.ca_file)
            .with_context(|| format!("Failed to read CA file {:?}", self.tls.ca_file))?;

        let identity = match (&self.tls.cert_file, &self.tls.key_file) {
            (Some(cert_file), Some(key_file)) => {
                let cert = std::fs::read_to_string(cert_file)
                    .with_context(|| format!("Failed to read certificate file {:?}", cert_file))?;
                let key = std::fs::read_to_string(key_file)
                    .with_context(|| format!("Failed to read key file {:?}", key_file))?;
                Some((cert, key))
            }
            (None, None) => None,
            _ => anyhow::bail!("tls.cert_file and tls.key_file must be set together"),
        };

        Ok((ca, identity))
    }
}

//! Session layer error types.

use pdnet_wire::WireError;
use thiserror::Error;

/// Transport and peer I/O errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Operation needs an established connection
    #[error("not connected")]
    NotConnected,

    /// Underlying socket error
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Host name did not resolve to any address
    #[error("could not resolve {0}")]
    Resolve(String),

    /// No peer registered under this id
    #[error("unknown peer {0}")]
    UnknownPeer(u8),

    /// Message could not be framed
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

/// Session engine configuration and setup errors
#[derive(Error, Debug)]
pub enum EngineError {
    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Transport setup failed
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Registry setup failed
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

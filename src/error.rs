//! Error types for the companion relay

use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the companion relay
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The dialogue engine link could not be established or re-established.
    /// Fatal to the owning session
    #[error("upstream connect error: {0}")]
    UpstreamConnect(String),

    /// Sending to a device whose socket is already closed
    #[error("device transport error: {0}")]
    DeviceTransport(String),

    /// Malformed inbound event
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

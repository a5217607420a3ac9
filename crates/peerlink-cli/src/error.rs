//! Error handling for the PeerLink CLI

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("PeerLink error: {0}")]
    Peerlink(#[from] peerlink_core::PeerlinkError),

    #[error("Send failed: {0}")]
    Send(#[from] peerlink_core::SendError),

    #[error("Key error: {0}")]
    Crypto(#[from] peerlink_core::CryptographicError),

    #[error("Transport error: {0}")]
    Transport(#[from] peerlink_core::TransportError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("TOML writing error: {0}")]
    TomlWriting(#[from] toml::ser::Error),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

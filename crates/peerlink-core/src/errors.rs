//! Error types for PeerLink
//!
//! This module contains every error type used across the workspace: the
//! cryptographic errors, the connection and send errors surfaced by the
//! runtime managers, the collaborator errors (relay, store, directory,
//! transport) and the `PeerlinkError` type that unifies them all.

use crate::types::Address;

// ----------------------------------------------------------------------------
// Cryptographic Errors
// ----------------------------------------------------------------------------

/// Failures raised by the key agreement, AEAD and signing primitives
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptographicError {
    #[error("Cryptographic backend unavailable")]
    CryptoUnavailable,
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("No signing identity available")]
    SigningUnavailable,
    #[error("Key derivation failed")]
    KeyDerivationFailed,
    #[error("Invalid key format")]
    InvalidKeyFormat,
}

// ----------------------------------------------------------------------------
// Collaborator Errors
// ----------------------------------------------------------------------------

/// Errors reported by a signal relay implementation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("Signal relay unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("Failed to publish signal to {to}: {reason}")]
    PublishFailed { to: Address, reason: String },
    #[error("Signal subscription closed")]
    SubscriptionClosed,
}

/// Errors reported by the content-addressed fallback store
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("No stored payload for key {key}")]
    NotFound { key: String },
    #[error("Fallback store unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Errors reported by the public key directory
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("Key directory unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("Malformed key record for {address}")]
    MalformedRecord { address: Address },
}

/// Errors reported by a peer transport or one of its sessions
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Transport unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("Negotiation failed with {peer}: {reason}")]
    NegotiationFailed { peer: Address, reason: String },
    #[error("Invalid session description: {reason}")]
    InvalidDescription { reason: String },
    #[error("Data channel is closed")]
    ChannelClosed,
    #[error("Send failed: {reason}")]
    SendFailed { reason: String },
}

// ----------------------------------------------------------------------------
// Runtime Errors
// ----------------------------------------------------------------------------

/// Errors returned while establishing a peer connection
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection to {peer} timed out after {timeout_ms}ms")]
    ConnectionTimeout { peer: Address, timeout_ms: u64 },
    #[error("Giving up on {peer} after {attempts} attempts")]
    MaxRetriesExceeded { peer: Address, attempts: u32 },
    #[error("Connection to {peer} failed: {reason}")]
    ConnectionFailed { peer: Address, reason: String },
    #[error("Signal relay error: {0}")]
    Relay(#[from] RelayError),
    #[error("Connection manager was shut down")]
    Shutdown,
}

/// Errors returned from the send path, either on a channel or through the coordinator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("No channel to {peer}")]
    NoChannel { peer: Address },
    #[error("Channel to {peer} is not open")]
    ChannelNotReady { peer: Address },
    #[error("Not connected")]
    NotConnected,
    #[error("No public key known for {peer}")]
    PeerKeyUnavailable { peer: Address },
    #[error("{peer} is offline")]
    PeerOffline { peer: Address },
    #[error("Unknown message {id}")]
    UnknownMessage { id: String },
    #[error("Invalid message state: {0}")]
    InvalidState(#[from] StateTransitionError),
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Fallback store error: {0}")]
    Store(#[from] StoreError),
    #[error("Key directory error: {0}")]
    Directory(#[from] DirectoryError),
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptographicError),
    #[error("Serialization error: {reason}")]
    Serialization { reason: String },
}

impl From<serde_json::Error> for SendError {
    fn from(err: serde_json::Error) -> Self {
        SendError::Serialization {
            reason: err.to_string(),
        }
    }
}

/// Errors that can occur during state transitions
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateTransitionError {
    #[error("Invalid transition from {from_state} on event {event}")]
    InvalidTransition { from_state: String, event: String },
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

/// Unified error type for PeerLink operations
#[derive(Debug, thiserror::Error)]
pub enum PeerlinkError {
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptographicError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Send error: {0}")]
    Send(#[from] SendError),

    #[error("Signal relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Fallback store error: {0}")]
    Store(#[from] StoreError),

    #[error("Key directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("State transition error: {0}")]
    StateTransition(#[from] StateTransitionError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid address: {value}")]
    InvalidAddress { value: String },

    #[error("Invalid envelope: {reason}")]
    InvalidEnvelope { reason: String },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

impl PeerlinkError {
    /// Create a configuration error
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        PeerlinkError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create an invalid envelope error
    pub fn invalid_envelope<T: Into<String>>(reason: T) -> Self {
        PeerlinkError::InvalidEnvelope {
            reason: reason.into(),
        }
    }

    /// Create a connection failure for a peer
    pub fn connection_failed<R: Into<String>>(peer: Address, reason: R) -> Self {
        PeerlinkError::Connection(ConnectionError::ConnectionFailed {
            peer,
            reason: reason.into(),
        })
    }
}

/// Result type alias for PeerLink operations
pub type Result<T> = core::result::Result<T, PeerlinkError>;
pub type PeerlinkResult<T> = Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_error_wraps_connection_error() {
        let peer = Address::new("0xabc");
        let err: SendError = ConnectionError::MaxRetriesExceeded {
            peer: peer.clone(),
            attempts: 3,
        }
        .into();

        assert!(matches!(
            err,
            SendError::Connection(ConnectionError::MaxRetriesExceeded { attempts: 3, .. })
        ));
        assert_eq!(
            err.to_string(),
            "Connection error: Giving up on 0xabc after 3 attempts"
        );
    }

    #[test]
    fn test_peerlink_error_from_crypto() {
        let err: PeerlinkError = CryptographicError::DecryptionFailed.into();
        assert!(matches!(
            err,
            PeerlinkError::Crypto(CryptographicError::DecryptionFailed)
        ));
    }
}

//! Peer transport abstraction
//!
//! A transport turns session descriptions and candidates into a reliable,
//! ordered data channel between two addresses. The connection manager drives
//! negotiation through these traits and consumes the session's event stream,
//! so it never touches a concrete WebRTC stack.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::errors::TransportError;
use crate::link::NegotiationRole;
use crate::signal::IceCandidate;
use crate::types::Address;

// ----------------------------------------------------------------------------
// Channel Options
// ----------------------------------------------------------------------------

/// STUN/TURN server used for connectivity checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun<S: Into<String>>(url: S) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Parameters for the data channel and the connectivity layer beneath it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelOptions {
    pub label: String,
    pub ordered: bool,
    pub max_retransmits: u16,
    pub ice_servers: Vec<IceServer>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            label: "messageChannel".to_string(),
            ordered: true,
            max_retransmits: 3,
            ice_servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer::stun("stun:stun1.l.google.com:19302"),
            ],
        }
    }
}

// ----------------------------------------------------------------------------
// Sessions
// ----------------------------------------------------------------------------

/// Asynchronous notifications from a negotiating or open session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A local candidate that must be relayed to the remote side
    LocalCandidate(IceCandidate),
    /// The data channel is ready for frames
    ChannelOpen,
    /// A frame arrived on the data channel
    Message(Vec<u8>),
    /// Negotiation or connectivity failed irrecoverably
    Failed(String),
    /// The channel closed
    Closed,
}

/// One negotiation attempt with one peer
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Create the local offer (initiator side)
    async fn create_offer(&self) -> Result<String, TransportError>;

    /// Apply a remote offer and produce the answer (responder side)
    async fn accept_offer(&self, sdp: String) -> Result<String, TransportError>;

    /// Apply the remote answer (initiator side)
    async fn accept_answer(&self, sdp: String) -> Result<(), TransportError>;

    /// Apply a candidate discovered by the remote side
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Send one frame on the open data channel
    async fn send(&self, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Release every resource held by the session
    async fn close(&self);
}

/// A freshly created session together with its event stream
pub struct SessionHandle {
    pub session: Arc<dyn TransportSession>,
    pub events: mpsc::Receiver<SessionEvent>,
}

/// Factory for transport sessions
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_session(
        &self,
        local: &Address,
        peer: &Address,
        role: NegotiationRole,
        options: &ChannelOptions,
    ) -> Result<SessionHandle, TransportError>;
}

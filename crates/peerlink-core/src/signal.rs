//! Signalling messages and the relay that carries them
//!
//! Before a direct channel exists, peers exchange session descriptions and
//! connectivity candidates through a shared relay keyed by recipient address.
//! The relay is an external collaborator; this module only fixes the message
//! shapes and the trait an implementation must satisfy.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::RelayError;
use crate::types::{Address, Timestamp};

/// A single connectivity candidate discovered by one side of a negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new<S: Into<String>>(candidate: S) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Negotiation payload exchanged through the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate(IceCandidate),
}

impl Signal {
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Offer { .. } => "offer",
            Signal::Answer { .. } => "answer",
            Signal::Candidate(_) => "candidate",
        }
    }
}

/// A signal addressed from one participant to another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub from: Address,
    pub to: Address,
    pub signal: Signal,
    pub sent_at: Timestamp,
}

/// Shared store-and-forward channel for negotiation signals
#[async_trait]
pub trait SignalRelay: Send + Sync {
    /// Append a signal addressed to `to`
    async fn publish(&self, from: &Address, to: &Address, signal: Signal) -> Result<(), RelayError>;

    /// Stream every signal addressed to `address`, in arrival order
    async fn subscribe(&self, address: &Address) -> Result<mpsc::Receiver<SignalEnvelope>, RelayError>;
}

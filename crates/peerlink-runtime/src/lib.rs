//! PeerLink Runtime
//!
//! The tokio side of PeerLink:
//! - `PeerConnectionManager`: negotiates and owns direct channels per peer
//! - `DeliveryCoordinator`: message log, encryption, direct delivery with
//!   fallback, receipts and privacy policies
//! - `RuntimeBuilder`: wires the coordinator to its external collaborators
//!
//! `peerlink-core` holds the data model and the collaborator traits.

pub mod builder;
pub mod managers;

pub use builder::RuntimeBuilder;
pub use managers::*;

// Re-export core types for convenience
pub use peerlink_core::{
    Address, Conversation, DeliveryStatus, IdentityProvider, LocalWallet, MessageId, MessageView,
    PeerlinkConfig, PeerlinkError, PeerlinkResult, RenderedContent, SendError, SendOptions,
};

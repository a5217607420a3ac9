//! PeerLink Core
//!
//! Address-to-address encrypted messaging over direct peer channels, with an
//! offline store as fallback. This crate holds everything that does not need
//! a runtime: identifiers, error types, configuration, key agreement and
//! AEAD, recoverable signatures, the wire formats, the message model, the
//! link state machine and the traits for external collaborators (signal
//! relay, fallback store, key directory, presence feed, peer transport).
//!
//! The orchestration lives in `peerlink-runtime`.

pub mod config;
pub mod conversation;
pub mod crypto;
pub mod directory;
pub mod envelope;
pub mod errors;
pub mod identity;
pub mod link;
pub mod message;
pub mod presence;
pub mod signal;
pub mod store;
pub mod transport;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{
    ConfigBuilderError, ConnectionConfig, DeliveryConfig, PeerlinkConfig, PeerlinkConfigBuilder,
};
pub use conversation::{Conversation, ConversationKey};
pub use crypto::{
    decrypt, derive_shared_key, encrypt, generate_key_pair, Nonce, PublicKey, SessionKeyPair,
    SharedKey,
};
pub use directory::KeyDirectory;
pub use envelope::{ChannelFrame, FrameKind, MessageEnvelope};
pub use errors::{
    ConnectionError, CryptographicError, DirectoryError, PeerlinkError, PeerlinkResult,
    RelayError, Result, SendError, StateTransitionError, StoreError, TransportError,
};
pub use identity::{verify, IdentityProvider, LocalWallet, SharedIdentity, Signature};
pub use link::{AuditEntry, LinkEvent, LinkState, LinkTransition, NegotiationRole};
pub use message::{
    DeliveryStatus, Message, MessageView, RenderedContent, SendOptions, REDACTED_TEXT,
    TOMBSTONE_TEXT,
};
pub use presence::{PresenceFeed, PresenceSet, PresenceTracker};
pub use signal::{IceCandidate, Signal, SignalEnvelope, SignalRelay};
pub use store::FallbackStore;
pub use transport::{
    ChannelOptions, IceServer, PeerTransport, SessionEvent, SessionHandle, TransportSession,
};
pub use types::{Address, MessageId, SharedTimeSource, SystemTimeSource, TimeSource, Timestamp};

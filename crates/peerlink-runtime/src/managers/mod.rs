//! Stateful managers for the PeerLink runtime
//!
//! The connection manager owns direct channels; the delivery coordinator owns
//! the message log and decides between the direct path and the fallback store.

pub mod connection;
pub mod delivery;
pub mod keys;

pub use connection::{ConnectionStats, InboundFrame, MessageSubscription, PeerConnectionManager};
pub use delivery::{DeliveryCoordinator, DeliveryEvent, DeliveryServices};
pub use keys::SharedKeyCache;

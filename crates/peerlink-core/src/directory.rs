//! Public key directory
//!
//! Every connected session publishes its ephemeral public key under its
//! address. Senders look up the receiver's key here before deriving the
//! shared key used to encrypt a message.

use async_trait::async_trait;

use crate::crypto::PublicKey;
use crate::errors::DirectoryError;
use crate::types::Address;

#[async_trait]
pub trait KeyDirectory: Send + Sync {
    /// Publish (or replace) the session key for `address`
    async fn publish(&self, address: &Address, key: PublicKey) -> Result<(), DirectoryError>;

    /// Current session key for `address`, if one has been published
    async fn lookup(&self, address: &Address) -> Result<Option<PublicKey>, DirectoryError>;
}

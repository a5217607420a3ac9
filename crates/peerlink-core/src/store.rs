//! Offline fallback storage
//!
//! When no direct channel can be used, the signed envelope is parked in an
//! external store under its message id so the receiver can pull it later.

use async_trait::async_trait;

use crate::errors::StoreError;
use crate::types::MessageId;

/// Content-addressed store for envelopes that could not be delivered directly
#[async_trait]
pub trait FallbackStore: Send + Sync {
    /// Store `payload` under `id`, returning the content address assigned by the store
    async fn put(&self, id: &MessageId, payload: Vec<u8>) -> Result<String, StoreError>;

    /// Fetch the payload stored under `id`
    async fn get(&self, id: &MessageId) -> Result<Vec<u8>, StoreError>;
}

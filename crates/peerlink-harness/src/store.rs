//! In-memory fallback store and key directory

use async_trait::async_trait;
use peerlink_core::{
    Address, DirectoryError, FallbackStore, KeyDirectory, MessageId, PublicKey, StoreError,
};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ----------------------------------------------------------------------------
// Fallback Store
// ----------------------------------------------------------------------------

#[derive(Default)]
struct StoreState {
    blobs: HashMap<MessageId, Vec<u8>>,
    unavailable: bool,
}

/// Content-addressed blob store held in memory
#[derive(Clone, Default)]
pub struct MemoryFallbackStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryFallbackStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.state).unavailable = unavailable;
    }

    pub fn len(&self) -> usize {
        lock(&self.state).blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw stored bytes, bypassing availability checks
    pub fn raw(&self, id: &MessageId) -> Option<Vec<u8>> {
        lock(&self.state).blobs.get(id).cloned()
    }

    pub fn content_address(payload: &[u8]) -> String {
        format!("mem://{}", hex::encode(Sha256::digest(payload)))
    }
}

#[async_trait]
impl FallbackStore for MemoryFallbackStore {
    async fn put(&self, id: &MessageId, payload: Vec<u8>) -> Result<String, StoreError> {
        let mut state = lock(&self.state);
        if state.unavailable {
            return Err(StoreError::Unavailable {
                reason: "store offline".to_string(),
            });
        }
        let address = Self::content_address(&payload);
        state.blobs.insert(*id, payload);
        Ok(address)
    }

    async fn get(&self, id: &MessageId) -> Result<Vec<u8>, StoreError> {
        let state = lock(&self.state);
        if state.unavailable {
            return Err(StoreError::Unavailable {
                reason: "store offline".to_string(),
            });
        }
        state.blobs.get(id).cloned().ok_or_else(|| StoreError::NotFound {
            key: id.to_string(),
        })
    }
}

// ----------------------------------------------------------------------------
// Key Directory
// ----------------------------------------------------------------------------

#[derive(Default)]
struct DirectoryState {
    keys: HashMap<Address, PublicKey>,
    unavailable: bool,
}

/// Address to session key map held in memory
#[derive(Clone, Default)]
pub struct MemoryKeyDirectory {
    state: Arc<Mutex<DirectoryState>>,
}

impl MemoryKeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.state).unavailable = unavailable;
    }

    pub fn remove(&self, address: &Address) -> Option<PublicKey> {
        lock(&self.state).keys.remove(address)
    }
}

#[async_trait]
impl KeyDirectory for MemoryKeyDirectory {
    async fn publish(&self, address: &Address, key: PublicKey) -> Result<(), DirectoryError> {
        let mut state = lock(&self.state);
        if state.unavailable {
            return Err(DirectoryError::Unavailable {
                reason: "directory offline".to_string(),
            });
        }
        state.keys.insert(address.clone(), key);
        Ok(())
    }

    async fn lookup(&self, address: &Address) -> Result<Option<PublicKey>, DirectoryError> {
        let state = lock(&self.state);
        if state.unavailable {
            return Err(DirectoryError::Unavailable {
                reason: "directory offline".to_string(),
            });
        }
        Ok(state.keys.get(address).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_put_get() {
        let store = MemoryFallbackStore::new();
        let id = MessageId::new();

        let address = store.put(&id, b"envelope".to_vec()).await.unwrap();
        assert!(address.starts_with("mem://"));
        assert_eq!(store.get(&id).await.unwrap(), b"envelope");

        let missing = MessageId::new();
        assert!(matches!(
            store.get(&missing).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_store_unavailable() {
        let store = MemoryFallbackStore::new();
        store.set_unavailable(true);
        assert!(store.put(&MessageId::new(), vec![1]).await.is_err());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_directory_replaces_key() {
        let directory = MemoryKeyDirectory::new();
        let alice = Address::new("0xa");
        let first = PublicKey::from_bytes([1; 32]);
        let second = PublicKey::from_bytes([2; 32]);

        assert_eq!(directory.lookup(&alice).await.unwrap(), None);
        directory.publish(&alice, first).await.unwrap();
        directory.publish(&alice, second).await.unwrap();
        assert_eq!(directory.lookup(&alice).await.unwrap(), Some(second));
    }
}

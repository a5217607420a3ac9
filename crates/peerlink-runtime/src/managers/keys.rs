//! Shared key cache
//!
//! Derived shared keys are cached per peer address for the lifetime of one
//! connected session. Concurrent derivations for the same peer may race; the
//! first insert wins and every caller ends up with the same key.

use dashmap::DashMap;
use peerlink_core::{Address, SharedKey};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct SharedKeyCache {
    keys: Arc<DashMap<Address, Arc<SharedKey>>>,
}

impl SharedKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer: &Address) -> Option<Arc<SharedKey>> {
        self.keys.get(peer).map(|entry| Arc::clone(entry.value()))
    }

    /// Cache `key` unless another caller got there first; returns the cached key
    pub fn insert_if_absent(&self, peer: &Address, key: SharedKey) -> Arc<SharedKey> {
        Arc::clone(
            self.keys
                .entry(peer.clone())
                .or_insert_with(|| Arc::new(key))
                .value(),
        )
    }

    /// Forget the key for `peer`, e.g. after it rotated its session key
    pub fn evict(&self, peer: &Address) -> bool {
        self.keys.remove(peer).is_some()
    }

    pub fn clear(&self) {
        self.keys.clear();
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_insert_wins() {
        let cache = SharedKeyCache::new();
        let peer = Address::new("0xb0b");

        let first = cache.insert_if_absent(&peer, SharedKey::from_bytes([1u8; 32]));
        let second = cache.insert_if_absent(&peer, SharedKey::from_bytes([2u8; 32]));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_evict_and_clear() {
        let cache = SharedKeyCache::new();
        let peer = Address::new("0xb0b");
        cache.insert_if_absent(&peer, SharedKey::from_bytes([1u8; 32]));

        assert!(cache.evict(&peer));
        assert!(!cache.evict(&peer));
        assert!(cache.get(&peer).is_none());

        cache.insert_if_absent(&peer, SharedKey::from_bytes([1u8; 32]));
        cache.clear();
        assert!(cache.is_empty());
    }
}

//! Online presence
//!
//! A presence feed reports the set of addresses currently online. The
//! coordinator uses it to decide whether to attempt a direct connection or go
//! straight to the fallback store.

use async_trait::async_trait;
use hashbrown::HashSet;
use tokio::sync::mpsc;

use crate::types::Address;

/// Snapshot of online addresses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceSet {
    online: HashSet<Address>,
}

impl PresenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.online.contains(address)
    }

    pub fn insert(&mut self, address: Address) -> bool {
        self.online.insert(address)
    }

    pub fn remove(&mut self, address: &Address) -> bool {
        self.online.remove(address)
    }

    pub fn len(&self) -> usize {
        self.online.len()
    }

    pub fn is_empty(&self) -> bool {
        self.online.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Address> {
        self.online.iter()
    }
}

impl FromIterator<Address> for PresenceSet {
    fn from_iter<I: IntoIterator<Item = Address>>(iter: I) -> Self {
        Self {
            online: iter.into_iter().collect(),
        }
    }
}

/// Tracks the latest presence snapshot.
///
/// Until the first snapshot arrives nobody is considered absent, so sends are
/// never short-circuited by a feed that has not reported yet.
#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    current: PresenceSet,
    synced: bool,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot
    pub fn update(&mut self, snapshot: PresenceSet) {
        self.current = snapshot;
        self.synced = true;
    }

    pub fn is_online(&self, address: &Address) -> bool {
        self.current.contains(address)
    }

    /// Known to be offline according to a received snapshot
    pub fn is_absent(&self, address: &Address) -> bool {
        self.synced && !self.current.contains(address)
    }

    pub fn snapshot(&self) -> &PresenceSet {
        &self.current
    }
}

/// Source of presence snapshots
#[async_trait]
pub trait PresenceFeed: Send + Sync {
    async fn subscribe(&self) -> mpsc::Receiver<PresenceSet>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsynced_tracker_reports_nobody_absent() {
        let tracker = PresenceTracker::new();
        let bob = Address::new("0xb0b");
        assert!(!tracker.is_absent(&bob));
        assert!(!tracker.is_online(&bob));
    }

    #[test]
    fn test_snapshot_replaces_previous() {
        let mut tracker = PresenceTracker::new();
        let alice = Address::new("0xa11ce");
        let bob = Address::new("0xb0b");

        tracker.update([alice.clone()].into_iter().collect());
        assert!(tracker.is_online(&alice));
        assert!(tracker.is_absent(&bob));

        tracker.update([bob.clone()].into_iter().collect());
        assert!(tracker.is_absent(&alice));
        assert!(tracker.is_online(&bob));
        assert_eq!(tracker.snapshot().len(), 1);
    }
}

//! Scriptable presence feed

use async_trait::async_trait;
use peerlink_core::{Address, PresenceFeed, PresenceSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

#[derive(Default)]
struct FeedState {
    current: Option<PresenceSet>,
    subscribers: Vec<mpsc::Sender<PresenceSet>>,
}

/// Presence feed driven by the test; every change is pushed to all subscribers
#[derive(Clone, Default)]
pub struct MemoryPresenceFeed {
    state: Arc<Mutex<FeedState>>,
}

impl MemoryPresenceFeed {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the online set
    pub fn set_online<I: IntoIterator<Item = Address>>(&self, online: I) {
        let snapshot: PresenceSet = online.into_iter().collect();
        let mut state = self.state();
        state.current = Some(snapshot.clone());
        state
            .subscribers
            .retain(|subscriber| subscriber.try_send(snapshot.clone()).is_ok());
    }

    pub fn go_online(&self, address: Address) {
        let mut online = self.state().current.clone().unwrap_or_default();
        online.insert(address);
        self.set_online(online.iter().cloned().collect::<Vec<_>>());
    }

    pub fn go_offline(&self, address: &Address) {
        let mut online = self.state().current.clone().unwrap_or_default();
        online.remove(address);
        self.set_online(online.iter().cloned().collect::<Vec<_>>());
    }
}

#[async_trait]
impl PresenceFeed for MemoryPresenceFeed {
    async fn subscribe(&self) -> mpsc::Receiver<PresenceSet> {
        let (tx, rx) = mpsc::channel(64);
        let mut state = self.state();
        if let Some(current) = &state.current {
            let _ = tx.try_send(current.clone());
        }
        state.subscribers.push(tx);
        rx
    }
}

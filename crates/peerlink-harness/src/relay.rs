//! In-memory signal relay
//!
//! Behaves like a shared signalling table: every published signal is kept in
//! an append-only log and pushed to live subscribers of the recipient.
//! Signals for a recipient with no subscriber are held until one appears.

use async_trait::async_trait;
use peerlink_core::{
    Address, RelayError, SharedTimeSource, Signal, SignalEnvelope, SignalRelay, SystemTimeSource,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::trace;

const SUBSCRIPTION_BUFFER: usize = 1024;

#[derive(Default)]
struct RelayState {
    subscribers: HashMap<Address, Vec<mpsc::Sender<SignalEnvelope>>>,
    held: HashMap<Address, Vec<SignalEnvelope>>,
    log: Vec<SignalEnvelope>,
    failing_kinds: HashSet<&'static str>,
    stalled_kinds: HashSet<&'static str>,
    unavailable: bool,
}

/// Shared in-process relay; clones see the same state
#[derive(Clone)]
pub struct MemorySignalRelay {
    state: Arc<Mutex<RelayState>>,
    time_source: SharedTimeSource,
}

impl Default for MemorySignalRelay {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(RelayState::default())),
            time_source: Arc::new(SystemTimeSource),
        }
    }
}

impl MemorySignalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp envelopes with `time_source` instead of the wall clock
    pub fn with_time_source(mut self, time_source: SharedTimeSource) -> Self {
        self.time_source = time_source;
        self
    }

    fn state(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every signal published so far, in order
    pub fn published(&self) -> Vec<SignalEnvelope> {
        self.state().log.clone()
    }

    /// Signals published from `from` to `to`
    pub fn published_between(&self, from: &Address, to: &Address) -> Vec<Signal> {
        self.state()
            .log
            .iter()
            .filter(|envelope| &envelope.from == from && &envelope.to == to)
            .map(|envelope| envelope.signal.clone())
            .collect()
    }

    /// Make publishing of one signal kind (`offer`, `answer`, `candidate`) fail
    pub fn fail_kind(&self, kind: &'static str) {
        self.state().failing_kinds.insert(kind);
    }

    /// Make publishing of one signal kind never complete
    pub fn stall_kind(&self, kind: &'static str) {
        self.state().stalled_kinds.insert(kind);
    }

    /// Reject every operation until re-enabled
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }
}

#[async_trait]
impl SignalRelay for MemorySignalRelay {
    async fn publish(&self, from: &Address, to: &Address, signal: Signal) -> Result<(), RelayError> {
        let stalled = self.state().stalled_kinds.contains(signal.kind());
        if stalled {
            trace!("relay stalling {} {} -> {}", signal.kind(), from, to);
            std::future::pending::<()>().await;
        }

        let mut state = self.state();
        if state.unavailable {
            return Err(RelayError::Unavailable {
                reason: "relay offline".to_string(),
            });
        }
        if state.failing_kinds.contains(signal.kind()) {
            return Err(RelayError::PublishFailed {
                to: to.clone(),
                reason: format!("{} publishing disabled", signal.kind()),
            });
        }

        let envelope = SignalEnvelope {
            from: from.clone(),
            to: to.clone(),
            signal,
            sent_at: self.time_source.now(),
        };
        trace!("relay {} {} -> {}", envelope.signal.kind(), from, to);
        state.log.push(envelope.clone());

        let delivered = match state.subscribers.get_mut(to) {
            Some(senders) => {
                senders.retain(|sender| sender.try_send(envelope.clone()).is_ok());
                !senders.is_empty()
            }
            None => false,
        };
        if !delivered {
            state.held.entry(to.clone()).or_default().push(envelope);
        }
        Ok(())
    }

    async fn subscribe(&self, address: &Address) -> Result<mpsc::Receiver<SignalEnvelope>, RelayError> {
        let mut state = self.state();
        if state.unavailable {
            return Err(RelayError::Unavailable {
                reason: "relay offline".to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        for envelope in state.held.remove(address).unwrap_or_default() {
            // fresh channel with spare capacity
            let _ = tx.try_send(envelope);
        }
        state.subscribers.entry(address.clone()).or_default().push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::MockTimeSource;

    fn offer() -> Signal {
        Signal::Offer { sdp: "v=0".into() }
    }

    #[tokio::test]
    async fn test_live_delivery_and_log() {
        let relay = MemorySignalRelay::new();
        let alice = Address::new("0xa");
        let bob = Address::new("0xb");

        let mut inbox = relay.subscribe(&bob).await.unwrap();
        relay.publish(&alice, &bob, offer()).await.unwrap();

        let received = inbox.recv().await.unwrap();
        assert_eq!(received.from, alice);
        assert_eq!(received.signal, offer());
        assert_eq!(relay.published_between(&alice, &bob), vec![offer()]);
    }

    #[tokio::test]
    async fn test_signals_held_until_subscribe() {
        let relay = MemorySignalRelay::new();
        let alice = Address::new("0xa");
        let bob = Address::new("0xb");

        relay.publish(&alice, &bob, offer()).await.unwrap();
        let mut inbox = relay.subscribe(&bob).await.unwrap();
        assert_eq!(inbox.recv().await.unwrap().signal, offer());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let relay = MemorySignalRelay::new();
        let alice = Address::new("0xa");
        let bob = Address::new("0xb");

        relay.fail_kind("candidate");
        let candidate = Signal::Candidate(peerlink_core::IceCandidate::new("c"));
        assert!(matches!(
            relay.publish(&alice, &bob, candidate).await,
            Err(RelayError::PublishFailed { .. })
        ));
        assert!(relay.publish(&alice, &bob, offer()).await.is_ok());

        relay.set_unavailable(true);
        assert!(relay.subscribe(&bob).await.is_err());
    }

    #[tokio::test]
    async fn test_envelopes_use_injected_clock() {
        let clock = MockTimeSource::new_at(1_700_000_000_000);
        let relay = MemorySignalRelay::new().with_time_source(Arc::new(clock.clone()));
        let alice = Address::new("0xa");
        let bob = Address::new("0xb");

        relay.publish(&alice, &bob, offer()).await.unwrap();
        clock.advance(std::time::Duration::from_secs(5));
        relay.publish(&alice, &bob, offer()).await.unwrap();

        let stamps: Vec<u64> = relay
            .published()
            .iter()
            .map(|envelope| envelope.sent_at.as_millis())
            .collect();
        assert_eq!(stamps, vec![1_700_000_000_000, 1_700_000_005_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_kind_never_completes() {
        let relay = MemorySignalRelay::new();
        let alice = Address::new("0xa");
        let bob = Address::new("0xb");

        relay.stall_kind("offer");
        let publish = relay.publish(&alice, &bob, offer());
        let outcome = tokio::time::timeout(std::time::Duration::from_secs(60), publish).await;
        assert!(outcome.is_err());
        assert!(relay.published().is_empty());

        let answer = Signal::Answer { sdp: "v=0".into() };
        assert!(relay.publish(&alice, &bob, answer).await.is_ok());
    }
}

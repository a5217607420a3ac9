//! Loopback peer transport
//!
//! Sessions created from one [`LoopbackNetwork`] can reach each other. Offers
//! and answers are opaque tokens naming the session that produced them, so
//! they still have to travel through a real signal relay. A channel opens on
//! both sides once the initiator accepts an answer that matches its offer.
//!
//! Failure injection covers the ways negotiation goes wrong in practice: an
//! address whose sessions cannot be created at all ([`reject`]), one whose
//! negotiations never complete ([`blackhole`]) and one whose connectivity
//! checks fail after the exchange ([`fail_negotiation`]).
//!
//! [`reject`]: LoopbackNetwork::reject
//! [`blackhole`]: LoopbackNetwork::blackhole
//! [`fail_negotiation`]: LoopbackNetwork::fail_negotiation

use async_trait::async_trait;
use peerlink_core::{
    Address, ChannelOptions, IceCandidate, NegotiationRole, PeerTransport, SessionEvent,
    SessionHandle, TransportError, TransportSession,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

const EVENT_BUFFER: usize = 256;
const OFFER_PREFIX: &str = "loopback-offer:";
const ANSWER_PREFIX: &str = "loopback-answer:";

// ----------------------------------------------------------------------------
// Network State
// ----------------------------------------------------------------------------

struct SessionSlot {
    local: Address,
    peer: Address,
    role: NegotiationRole,
    events: mpsc::Sender<SessionEvent>,
    /// Session on the other side whose offer this session answered
    answered_offer_of: Option<u64>,
    linked: Option<u64>,
    remote_candidates: usize,
}

/// Counters for assertions in tests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub sessions_created: u64,
    pub sessions_rejected: u64,
    pub channels_opened: u64,
    pub frames_delivered: u64,
}

#[derive(Default)]
struct NetworkState {
    sessions: HashMap<u64, SessionSlot>,
    next_id: u64,
    rejected: HashSet<Address>,
    blackholed: HashSet<Address>,
    failing: HashSet<Address>,
    stats: NetworkStats,
}

/// Shared in-process network; clones see the same sessions
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Transport handle for one participant
    pub fn transport(&self) -> LoopbackTransport {
        LoopbackTransport {
            network: self.clone(),
        }
    }

    /// Session creation fails for any session involving `address`
    pub fn reject(&self, address: Address) {
        self.state().rejected.insert(address);
    }

    /// Negotiations involving `address` never reach an open channel
    pub fn blackhole(&self, address: Address) {
        self.state().blackholed.insert(address);
    }

    /// Negotiations involving `address` end with `SessionEvent::Failed` on both sides
    pub fn fail_negotiation(&self, address: Address) {
        self.state().failing.insert(address);
    }

    /// Lift every injected failure
    pub fn heal(&self) {
        let mut state = self.state();
        state.rejected.clear();
        state.blackholed.clear();
        state.failing.clear();
    }

    /// Drop every open channel between `a` and `b`, notifying both ends
    pub fn sever(&self, a: &Address, b: &Address) {
        let mut notify = Vec::new();
        {
            let mut state = self.state();
            let linked: Vec<u64> = state
                .sessions
                .iter()
                .filter(|(_, slot)| {
                    slot.linked.is_some()
                        && ((&slot.local == a && &slot.peer == b)
                            || (&slot.local == b && &slot.peer == a))
                })
                .map(|(id, _)| *id)
                .collect();
            for id in linked {
                if let Some(slot) = state.sessions.get_mut(&id) {
                    slot.linked = None;
                    notify.push(slot.events.clone());
                }
            }
        }
        for events in notify {
            let _ = events.try_send(SessionEvent::Closed);
        }
    }

    pub fn stats(&self) -> NetworkStats {
        self.state().stats.clone()
    }

    /// Sessions currently registered (not yet closed)
    pub fn live_sessions(&self) -> usize {
        self.state().sessions.len()
    }

    /// Remote candidates applied to sessions between `local` and `peer`
    pub fn remote_candidates(&self, local: &Address, peer: &Address) -> usize {
        self.state()
            .sessions
            .values()
            .filter(|slot| &slot.local == local && &slot.peer == peer)
            .map(|slot| slot.remote_candidates)
            .sum()
    }
}

fn parse_token(sdp: &str, prefix: &str) -> Result<u64, TransportError> {
    sdp.strip_prefix(prefix)
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| TransportError::InvalidDescription {
            reason: format!("expected {prefix}<id>, got {sdp}"),
        })
}

// ----------------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------------

#[derive(Clone)]
pub struct LoopbackTransport {
    network: LoopbackNetwork,
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn create_session(
        &self,
        local: &Address,
        peer: &Address,
        role: NegotiationRole,
        _options: &ChannelOptions,
    ) -> Result<SessionHandle, TransportError> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let id = {
            let mut state = self.network.state();
            if state.rejected.contains(local) || state.rejected.contains(peer) {
                state.stats.sessions_rejected += 1;
                return Err(TransportError::Unavailable {
                    reason: format!("loopback refuses sessions between {local} and {peer}"),
                });
            }
            let id = state.next_id;
            state.next_id += 1;
            state.stats.sessions_created += 1;
            state.sessions.insert(
                id,
                SessionSlot {
                    local: local.clone(),
                    peer: peer.clone(),
                    role,
                    events: events_tx,
                    answered_offer_of: None,
                    linked: None,
                    remote_candidates: 0,
                },
            );
            id
        };
        debug!("loopback session {} created for {} -> {} ({:?})", id, local, peer, role);

        Ok(SessionHandle {
            session: Arc::new(LoopbackSession {
                id,
                network: self.network.clone(),
            }),
            events: events_rx,
        })
    }
}

// ----------------------------------------------------------------------------
// Session
// ----------------------------------------------------------------------------

pub struct LoopbackSession {
    id: u64,
    network: LoopbackNetwork,
}

impl LoopbackSession {
    fn local_candidate(&self, slot: &SessionSlot) -> (mpsc::Sender<SessionEvent>, IceCandidate) {
        let candidate = IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                self.id,
                40_000 + self.id
            ),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        (slot.events.clone(), candidate)
    }

    async fn announce(&self, (events, candidate): (mpsc::Sender<SessionEvent>, IceCandidate)) {
        let _ = events.send(SessionEvent::LocalCandidate(candidate)).await;
    }
}

#[async_trait]
impl TransportSession for LoopbackSession {
    async fn create_offer(&self) -> Result<String, TransportError> {
        let pending = {
            let state = self.network.state();
            let slot = state.sessions.get(&self.id).ok_or(TransportError::ChannelClosed)?;
            if slot.role != NegotiationRole::Initiator {
                return Err(TransportError::NegotiationFailed {
                    peer: slot.peer.clone(),
                    reason: "responder sessions cannot offer".to_string(),
                });
            }
            self.local_candidate(slot)
        };
        self.announce(pending).await;
        Ok(format!("{OFFER_PREFIX}{}", self.id))
    }

    async fn accept_offer(&self, sdp: String) -> Result<String, TransportError> {
        let offerer = parse_token(&sdp, OFFER_PREFIX)?;
        let pending = {
            let mut state = self.network.state();
            let (local, peer) = {
                let slot = state.sessions.get(&self.id).ok_or(TransportError::ChannelClosed)?;
                (slot.local.clone(), slot.peer.clone())
            };
            let matches = state
                .sessions
                .get(&offerer)
                .map(|other| other.local == peer && other.peer == local)
                .unwrap_or(false);
            if !matches {
                return Err(TransportError::NegotiationFailed {
                    peer,
                    reason: format!("offer {offerer} does not belong to this pair"),
                });
            }
            let slot = state.sessions.get_mut(&self.id).ok_or(TransportError::ChannelClosed)?;
            slot.answered_offer_of = Some(offerer);
            self.local_candidate(slot)
        };
        self.announce(pending).await;
        Ok(format!("{ANSWER_PREFIX}{}", self.id))
    }

    async fn accept_answer(&self, sdp: String) -> Result<(), TransportError> {
        let answerer = parse_token(&sdp, ANSWER_PREFIX)?;
        let (notify, failing) = {
            let mut state = self.network.state();
            let (local, peer) = {
                let slot = state.sessions.get(&self.id).ok_or(TransportError::ChannelClosed)?;
                (slot.local.clone(), slot.peer.clone())
            };
            let answered_us = state
                .sessions
                .get(&answerer)
                .map(|other| other.answered_offer_of == Some(self.id))
                .unwrap_or(false);
            if !answered_us {
                return Err(TransportError::NegotiationFailed {
                    peer,
                    reason: format!("answer {answerer} does not match our offer"),
                });
            }
            if state.blackholed.contains(&local) || state.blackholed.contains(&peer) {
                debug!("loopback negotiation {} <-> {} stalls", local, peer);
                return Ok(());
            }

            let failing = state.failing.contains(&local) || state.failing.contains(&peer);
            let mut notify = Vec::with_capacity(2);
            for (id, other) in [(self.id, answerer), (answerer, self.id)] {
                if let Some(slot) = state.sessions.get_mut(&id) {
                    if !failing {
                        slot.linked = Some(other);
                    }
                    notify.push(slot.events.clone());
                }
            }
            if failing {
                debug!("loopback negotiation {} <-> {} fails", local, peer);
            } else {
                state.stats.channels_opened += 1;
            }
            (notify, failing)
        };

        for events in notify {
            let event = if failing {
                SessionEvent::Failed("connectivity checks failed".to_string())
            } else {
                SessionEvent::ChannelOpen
            };
            let _ = events.send(event).await;
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, _candidate: IceCandidate) -> Result<(), TransportError> {
        let mut state = self.network.state();
        let slot = state
            .sessions
            .get_mut(&self.id)
            .ok_or(TransportError::ChannelClosed)?;
        slot.remote_candidates += 1;
        Ok(())
    }

    async fn send(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        let target = {
            let mut state = self.network.state();
            let other = state
                .sessions
                .get(&self.id)
                .and_then(|slot| slot.linked)
                .ok_or(TransportError::ChannelClosed)?;
            let events = state
                .sessions
                .get(&other)
                .map(|slot| slot.events.clone())
                .ok_or(TransportError::ChannelClosed)?;
            state.stats.frames_delivered += 1;
            events
        };
        target
            .send(SessionEvent::Message(payload))
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }

    async fn close(&self) {
        let notify = {
            let mut state = self.network.state();
            let linked = state.sessions.remove(&self.id).and_then(|slot| slot.linked);
            linked.and_then(|other| {
                state.sessions.get_mut(&other).map(|slot| {
                    slot.linked = None;
                    slot.events.clone()
                })
            })
        };
        if let Some(events) = notify {
            let _ = events.send(SessionEvent::Closed).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn session(
        network: &LoopbackNetwork,
        local: &Address,
        peer: &Address,
        role: NegotiationRole,
    ) -> SessionHandle {
        network
            .transport()
            .create_session(local, peer, role, &ChannelOptions::default())
            .await
            .unwrap()
    }

    async fn next_non_candidate(events: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
        loop {
            match events.recv().await.unwrap() {
                SessionEvent::LocalCandidate(_) => continue,
                other => return other,
            }
        }
    }

    #[tokio::test]
    async fn test_offer_answer_opens_both_sides() {
        let network = LoopbackNetwork::new();
        let alice = Address::new("0xa");
        let bob = Address::new("0xb");

        let mut a = session(&network, &alice, &bob, NegotiationRole::Initiator).await;
        let mut b = session(&network, &bob, &alice, NegotiationRole::Responder).await;

        let offer = a.session.create_offer().await.unwrap();
        let answer = b.session.accept_offer(offer).await.unwrap();
        a.session.accept_answer(answer).await.unwrap();

        assert_eq!(next_non_candidate(&mut a.events).await, SessionEvent::ChannelOpen);
        assert_eq!(next_non_candidate(&mut b.events).await, SessionEvent::ChannelOpen);

        a.session.send(b"ping".to_vec()).await.unwrap();
        assert_eq!(
            next_non_candidate(&mut b.events).await,
            SessionEvent::Message(b"ping".to_vec())
        );

        b.session.close().await;
        assert_eq!(next_non_candidate(&mut a.events).await, SessionEvent::Closed);
        assert_eq!(a.session.send(vec![1]).await, Err(TransportError::ChannelClosed));
        assert_eq!(network.stats().channels_opened, 1);
    }

    #[tokio::test]
    async fn test_rejected_address() {
        let network = LoopbackNetwork::new();
        let alice = Address::new("0xa");
        let bob = Address::new("0xb");
        network.reject(bob.clone());

        let result = network
            .transport()
            .create_session(&alice, &bob, NegotiationRole::Initiator, &ChannelOptions::default())
            .await;
        assert!(matches!(result, Err(TransportError::Unavailable { .. })));
        assert_eq!(network.stats().sessions_rejected, 1);
    }

    #[tokio::test]
    async fn test_mismatched_offer_rejected() {
        let network = LoopbackNetwork::new();
        let alice = Address::new("0xa");
        let bob = Address::new("0xb");
        let carol = Address::new("0xc");

        let a = session(&network, &alice, &carol, NegotiationRole::Initiator).await;
        let b = session(&network, &bob, &alice, NegotiationRole::Responder).await;

        let offer = a.session.create_offer().await.unwrap();
        assert!(b.session.accept_offer(offer).await.is_err());
        assert!(b.session.accept_offer("garbage".into()).await.is_err());
    }

    #[tokio::test]
    async fn test_failing_negotiation_reports_failed() {
        let network = LoopbackNetwork::new();
        let alice = Address::new("0xa");
        let bob = Address::new("0xb");
        network.fail_negotiation(bob.clone());

        let mut a = session(&network, &alice, &bob, NegotiationRole::Initiator).await;
        let mut b = session(&network, &bob, &alice, NegotiationRole::Responder).await;

        let offer = a.session.create_offer().await.unwrap();
        let answer = b.session.accept_offer(offer).await.unwrap();
        a.session.accept_answer(answer).await.unwrap();

        assert!(matches!(
            next_non_candidate(&mut a.events).await,
            SessionEvent::Failed(_)
        ));
        assert!(matches!(
            next_non_candidate(&mut b.events).await,
            SessionEvent::Failed(_)
        ));
        assert_eq!(a.session.send(vec![1]).await, Err(TransportError::ChannelClosed));
        assert_eq!(network.stats().channels_opened, 0);
    }
}

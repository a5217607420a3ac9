//! Peer connection management
//!
//! `PeerConnectionManager` owns every direct channel of one local identity.
//! It negotiates channels through the signal relay, enforces the per-peer
//! attempt budget and negotiation timeout, signs outbound frames and drops
//! inbound frames whose signature does not belong to the channel's peer.
//!
//! Two background tasks feed it: one pump per transport session (candidates,
//! channel open/close, frames) and one pump for signals addressed to the
//! local identity (offers, answers, candidates). Both hold only a weak
//! reference, so dropping the last manager handle stops them.
//!
//! When both sides offer at the same time, the side whose address sorts
//! greater abandons its own offer and answers the remote one; the other side
//! ignores the remote offer and waits for that answer.

use futures::future::join_all;
use peerlink_core::identity;
use peerlink_core::{
    Address, AuditEntry, ChannelFrame, ConnectionConfig, ConnectionError, FrameKind,
    IceCandidate, LinkEvent, LinkState, MessageId, NegotiationRole, PeerTransport,
    SendError, SessionEvent, SharedIdentity, SharedTimeSource, Signal, SignalEnvelope,
    SignalRelay, Timestamp, TransportSession,
};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

const AUDIT_CAPACITY: usize = 1000;
const MAX_BUFFERED_CANDIDATES: usize = 64;
/// Distinct untracked peers whose offers or candidates are held at once
const MAX_BUFFERED_PEERS: usize = 64;

// ----------------------------------------------------------------------------
// Public Types
// ----------------------------------------------------------------------------

/// Frame received on an open channel, after signature and sender checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub from: Address,
    pub kind: FrameKind,
    pub content: String,
    pub timestamp: Timestamp,
}

/// Receiver side of an `on_message` registration
pub type MessageSubscription = mpsc::Receiver<InboundFrame>;

/// Connection statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub negotiations_started: u64,
    pub channels_opened: u64,
    pub negotiations_failed: u64,
    pub timeouts: u64,
    pub retries_exhausted: u64,
    pub glare_yields: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub frames_rejected: u64,
    pub signals_dropped: u64,
}

// ----------------------------------------------------------------------------
// Connection Table
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Readiness {
    Pending,
    Open,
    Failed(String),
    Closed,
}

struct PeerEntry {
    /// Identifies one `init_connection` attempt
    generation: u64,
    /// Identifies the transport session currently serving the attempt
    serial: u64,
    state: LinkState,
    session: Option<Arc<dyn TransportSession>>,
    pump: Option<JoinHandle<()>>,
    ready: watch::Sender<Readiness>,
    remote_description_set: bool,
}

impl PeerEntry {
    fn advance(&mut self, event: LinkEvent, now: Timestamp) -> Option<AuditEntry> {
        match self.state.clone().transition(event, now) {
            Ok(transition) => {
                let audit = &transition.audit_entry;
                if audit.from_state != audit.to_state {
                    debug!("{}: {} -> {}", audit.peer, audit.from_state, audit.to_state);
                }
                self.state = transition.new_state;
                Some(transition.audit_entry)
            }
            Err(e) => {
                warn!("Rejected link transition for {}: {}", self.state.peer(), e);
                None
            }
        }
    }

    fn is_current(&self, generation: u64, serial: u64) -> bool {
        self.generation == generation && self.serial == serial
    }
}

#[derive(Default)]
struct ConnectionTable {
    peers: HashMap<Address, PeerEntry>,
    attempts: HashMap<Address, u32>,
    pending_offers: HashMap<Address, String>,
    pending_candidates: HashMap<Address, Vec<IceCandidate>>,
    audit: VecDeque<AuditEntry>,
    stats: ConnectionStats,
}

impl ConnectionTable {
    fn record(&mut self, entry: Option<AuditEntry>) {
        if let Some(entry) = entry {
            self.audit.push_back(entry);
            if self.audit.len() > AUDIT_CAPACITY {
                self.audit.pop_front();
            }
        }
    }

    /// Remove the entry for `peer` if it still belongs to `generation`
    fn take(&mut self, peer: &Address, generation: u64) -> Option<PeerEntry> {
        match self.peers.get(peer) {
            Some(entry) if entry.generation == generation => self.peers.remove(peer),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Manager
// ----------------------------------------------------------------------------

struct ManagerInner {
    local: Address,
    identity: SharedIdentity,
    relay: Arc<dyn SignalRelay>,
    transport: Arc<dyn PeerTransport>,
    config: ConnectionConfig,
    time_source: SharedTimeSource,
    table: Mutex<ConnectionTable>,
    subscribers: Mutex<Vec<mpsc::Sender<InboundFrame>>>,
    epoch: AtomicU64,
    next_generation: AtomicU64,
    next_serial: AtomicU64,
    signal_pump: StdMutex<Option<JoinHandle<()>>>,
}

/// Manages direct channels to peers for one local identity
#[derive(Clone)]
pub struct PeerConnectionManager {
    inner: Arc<ManagerInner>,
}

impl PeerConnectionManager {
    /// Subscribe to signals for the local identity and start the signal pump
    pub async fn start(
        identity: SharedIdentity,
        relay: Arc<dyn SignalRelay>,
        transport: Arc<dyn PeerTransport>,
        config: ConnectionConfig,
        time_source: SharedTimeSource,
    ) -> Result<Self, ConnectionError> {
        let local = identity.address();
        let signals = relay.subscribe(&local).await?;

        let inner = Arc::new(ManagerInner {
            local: local.clone(),
            identity,
            relay,
            transport,
            config,
            time_source,
            table: Mutex::new(ConnectionTable::default()),
            subscribers: Mutex::new(Vec::new()),
            epoch: AtomicU64::new(0),
            next_generation: AtomicU64::new(1),
            next_serial: AtomicU64::new(1),
            signal_pump: StdMutex::new(None),
        });

        let pump = tokio::spawn(run_signal_pump(Arc::downgrade(&inner), signals));
        if let Ok(mut slot) = inner.signal_pump.lock() {
            *slot = Some(pump);
        }

        info!("Connection manager started for {}", local);
        Ok(Self { inner })
    }

    pub fn local_address(&self) -> &Address {
        &self.inner.local
    }

    /// Establish (or reuse) a direct channel to `target`
    pub async fn init_connection(
        &self,
        target: &Address,
        is_initiator: bool,
    ) -> Result<(), ConnectionError> {
        self.inner.init_connection(target, is_initiator).await
    }

    /// Send `content` as a signed message frame
    pub async fn send(&self, target: &Address, content: &str) -> Result<(), SendError> {
        self.inner
            .send_frame(target, FrameKind::Message, content.to_string())
            .await
    }

    /// Acknowledge delivery of `message_id` to `target`
    pub async fn send_receipt(&self, target: &Address, message_id: &MessageId) -> Result<(), SendError> {
        self.inner
            .send_frame(target, FrameKind::Receipt, message_id.to_string())
            .await
    }

    /// Register for verified inbound frames
    pub async fn on_message(&self) -> MessageSubscription {
        let (tx, rx) = mpsc::channel(self.inner.config.inbound_buffer_size);
        self.inner.subscribers.lock().await.push(tx);
        rx
    }

    /// Tear down every connection and discard all pending negotiation state
    pub async fn destroy(&self) {
        self.inner.destroy().await
    }

    pub async fn state(&self, target: &Address) -> Option<LinkState> {
        let table = self.inner.table.lock().await;
        table.peers.get(target).map(|entry| entry.state.clone())
    }

    pub async fn is_open(&self, target: &Address) -> bool {
        let table = self.inner.table.lock().await;
        table
            .peers
            .get(target)
            .map(|entry| entry.state.is_open())
            .unwrap_or(false)
    }

    pub async fn open_peers(&self) -> Vec<Address> {
        let table = self.inner.table.lock().await;
        let mut peers: Vec<Address> = table
            .peers
            .iter()
            .filter(|(_, entry)| entry.state.is_open())
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Attempts counted against `target` since its last success
    pub async fn attempts(&self, target: &Address) -> u32 {
        let table = self.inner.table.lock().await;
        table.attempts.get(target).copied().unwrap_or(0)
    }

    /// Remote candidates held for `target` until its session can take them
    pub async fn buffered_candidates(&self, target: &Address) -> usize {
        let table = self.inner.table.lock().await;
        table.pending_candidates.get(target).map(Vec::len).unwrap_or(0)
    }

    /// Peers with an offer waiting to be answered
    pub async fn buffered_offers(&self) -> usize {
        self.inner.table.lock().await.pending_offers.len()
    }

    /// Most recent `limit` link transitions, oldest first
    pub async fn audit_trail(&self, limit: usize) -> Vec<AuditEntry> {
        let table = self.inner.table.lock().await;
        let skip = table.audit.len().saturating_sub(limit);
        table.audit.iter().skip(skip).cloned().collect()
    }

    pub async fn stats(&self) -> ConnectionStats {
        self.inner.table.lock().await.stats.clone()
    }
}

enum Plan {
    AlreadyOpen,
    Join(watch::Receiver<Readiness>),
    Start {
        role: NegotiationRole,
        generation: u64,
        ready: watch::Receiver<Readiness>,
        stale: Option<PeerEntry>,
    },
}

enum OfferAction {
    Answer {
        generation: u64,
        session: Arc<dyn TransportSession>,
    },
    Yield {
        generation: u64,
    },
    Buffer {
        stale: Option<PeerEntry>,
    },
    Ignore,
    Drop,
}

impl ManagerInner {
    fn now(&self) -> Timestamp {
        self.time_source.now()
    }

    fn is_stale(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) != epoch
    }

    // ------------------------------------------------------------------------
    // Negotiation
    // ------------------------------------------------------------------------

    async fn init_connection(
        self: &Arc<Self>,
        target: &Address,
        is_initiator: bool,
    ) -> Result<(), ConnectionError> {
        if *target == self.local {
            return Err(ConnectionError::ConnectionFailed {
                peer: target.clone(),
                reason: "cannot connect to self".to_string(),
            });
        }
        let epoch = self.epoch.load(Ordering::SeqCst);

        let plan = self.plan_attempt(target, is_initiator).await?;
        match plan {
            Plan::AlreadyOpen => Ok(()),
            Plan::Join(ready) => {
                debug!("Joining negotiation already in flight with {}", target);
                let deadline = Instant::now() + self.config.connect_timeout;
                self.await_ready(target, ready, epoch, None, deadline).await
            }
            Plan::Start {
                role,
                generation,
                ready,
                stale,
            } => {
                if let Some(stale) = stale {
                    debug!("Tearing down stale {} link to {}", stale.state.state_name(), target);
                    self.dispose(stale, true).await;
                }
                info!("Negotiating with {} as {:?}", target, role);

                // One deadline bounds the exchange and the wait for the channel
                let deadline = Instant::now() + self.config.connect_timeout;
                let exchange = self.negotiate(target, role, generation, epoch);
                match tokio::time::timeout_at(deadline, exchange).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        self.fail_attempt(target, generation, &e.to_string()).await;
                        if self.is_stale(epoch) {
                            return Err(ConnectionError::Shutdown);
                        }
                        return Err(e);
                    }
                    Err(_) => {
                        if self.is_stale(epoch) {
                            return Err(ConnectionError::Shutdown);
                        }
                        self.expire(target, generation).await;
                        return Err(self.timeout_error(target));
                    }
                }
                self.await_ready(target, ready, epoch, Some(generation), deadline)
                    .await
            }
        }
    }

    /// Decide, under the table lock, what an `init_connection` call should do
    async fn plan_attempt(
        &self,
        target: &Address,
        is_initiator: bool,
    ) -> Result<Plan, ConnectionError> {
        let mut table = self.table.lock().await;

        if let Some(entry) = table.peers.get(target) {
            if entry.state.is_open() {
                return Ok(Plan::AlreadyOpen);
            }
            if entry.state.is_negotiating() {
                return Ok(Plan::Join(entry.ready.subscribe()));
            }
        }
        let stale = table.peers.remove(target);

        let attempts = table.attempts.get(target).copied().unwrap_or(0);
        if attempts >= self.config.max_attempts {
            table.attempts.remove(target);
            table.stats.retries_exhausted += 1;
            drop(table);
            warn!("Giving up on {} after {} attempts", target, attempts);
            if let Some(stale) = stale {
                self.dispose(stale, true).await;
            }
            return Err(ConnectionError::MaxRetriesExceeded {
                peer: target.clone(),
                attempts,
            });
        }
        table.attempts.insert(target.clone(), attempts + 1);

        // An initiator that already holds the peer's offer is in a glare
        // situation: the greater address answers, the lower one ignores it.
        let role = if !is_initiator {
            NegotiationRole::Responder
        } else if table.pending_offers.contains_key(target) && self.local > *target {
            table.stats.glare_yields += 1;
            NegotiationRole::Responder
        } else {
            table.pending_offers.remove(target);
            NegotiationRole::Initiator
        };

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let (ready_tx, ready_rx) = watch::channel(Readiness::Pending);
        let mut entry = PeerEntry {
            generation,
            serial: 0,
            state: LinkState::new_idle(target.clone()),
            session: None,
            pump: None,
            ready: ready_tx,
            remote_description_set: false,
        };
        let audit = entry.advance(
            LinkEvent::StartNegotiation {
                role,
                timeout: self.config.connect_timeout,
            },
            self.now(),
        );
        table.record(audit);
        table.stats.negotiations_started += 1;
        table.peers.insert(target.clone(), entry);

        Ok(Plan::Start {
            role,
            generation,
            ready: ready_rx,
            stale,
        })
    }

    /// Create the transport session and perform this side's half of the exchange
    async fn negotiate(
        self: &Arc<Self>,
        target: &Address,
        role: NegotiationRole,
        generation: u64,
        epoch: u64,
    ) -> Result<(), ConnectionError> {
        let (session, serial) = self.attach_session(target, role, generation, epoch).await?;

        match role {
            NegotiationRole::Initiator => {
                let sdp = session.create_offer().await.map_err(|e| {
                    ConnectionError::ConnectionFailed {
                        peer: target.clone(),
                        reason: e.to_string(),
                    }
                })?;
                self.relay
                    .publish(&self.local, target, Signal::Offer { sdp })
                    .await?;
                trace!("Offer published to {}", target);
            }
            NegotiationRole::Responder => {
                let offer = {
                    let mut table = self.table.lock().await;
                    let offer = table.pending_offers.remove(target);
                    match table.peers.get_mut(target) {
                        Some(entry) if entry.is_current(generation, serial) && offer.is_some() => {
                            entry.remote_description_set = true;
                            offer
                        }
                        _ => None,
                    }
                };
                match offer {
                    Some(sdp) => self.answer_offer(target, &session, sdp).await?,
                    None => debug!("Waiting for an offer from {}", target),
                }
            }
        }
        Ok(())
    }

    /// Create a session for the attempt and install it with a fresh event pump
    async fn attach_session(
        self: &Arc<Self>,
        target: &Address,
        role: NegotiationRole,
        generation: u64,
        epoch: u64,
    ) -> Result<(Arc<dyn TransportSession>, u64), ConnectionError> {
        let handle = self
            .transport
            .create_session(&self.local, target, role, &self.config.channel)
            .await
            .map_err(|e| ConnectionError::ConnectionFailed {
                peer: target.clone(),
                reason: e.to_string(),
            })?;

        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        let pump = tokio::spawn(run_session_pump(
            Arc::downgrade(self),
            target.clone(),
            generation,
            serial,
            handle.events,
        ));

        let replaced = {
            let mut table = self.table.lock().await;
            match table.peers.get_mut(target) {
                Some(entry) if entry.generation == generation && !self.is_stale(epoch) => {
                    entry.serial = serial;
                    let old_session = entry.session.replace(handle.session.clone());
                    let old_pump = entry.pump.replace(pump);
                    Ok((old_session, old_pump))
                }
                _ => Err(pump),
            }
        };

        match replaced {
            Ok((old_session, old_pump)) => {
                if let Some(old) = old_session {
                    old.close().await;
                }
                if let Some(old) = old_pump {
                    old.abort();
                }
                Ok((handle.session, serial))
            }
            Err(pump) => {
                pump.abort();
                handle.session.close().await;
                Err(if self.is_stale(epoch) {
                    ConnectionError::Shutdown
                } else {
                    ConnectionError::ConnectionFailed {
                        peer: target.clone(),
                        reason: "negotiation superseded".to_string(),
                    }
                })
            }
        }
    }

    async fn answer_offer(
        &self,
        peer: &Address,
        session: &Arc<dyn TransportSession>,
        offer: String,
    ) -> Result<(), ConnectionError> {
        let answer = session
            .accept_offer(offer)
            .await
            .map_err(|e| ConnectionError::ConnectionFailed {
                peer: peer.clone(),
                reason: e.to_string(),
            })?;
        self.relay
            .publish(&self.local, peer, Signal::Answer { sdp: answer })
            .await?;
        trace!("Answer published to {}", peer);
        self.flush_candidates(peer, session).await;
        Ok(())
    }

    async fn flush_candidates(&self, peer: &Address, session: &Arc<dyn TransportSession>) {
        let buffered = {
            let mut table = self.table.lock().await;
            table.pending_candidates.remove(peer).unwrap_or_default()
        };
        for candidate in buffered {
            if let Err(e) = session.add_remote_candidate(candidate).await {
                warn!("Failed to apply buffered candidate from {}: {}", peer, e);
            }
        }
    }

    async fn await_ready(
        &self,
        target: &Address,
        ready: watch::Receiver<Readiness>,
        epoch: u64,
        owned_generation: Option<u64>,
        deadline: Instant,
    ) -> Result<(), ConnectionError> {
        let outcome = tokio::time::timeout_at(deadline, wait_for_readiness(ready)).await;

        if self.is_stale(epoch) {
            return Err(ConnectionError::Shutdown);
        }

        match outcome {
            Ok(Readiness::Open) => Ok(()),
            Ok(Readiness::Failed(reason)) => Err(ConnectionError::ConnectionFailed {
                peer: target.clone(),
                reason,
            }),
            Ok(Readiness::Closed) | Ok(Readiness::Pending) => Err(ConnectionError::ConnectionFailed {
                peer: target.clone(),
                reason: "channel closed during negotiation".to_string(),
            }),
            Err(_) => {
                if let Some(generation) = owned_generation {
                    self.expire(target, generation).await;
                }
                Err(self.timeout_error(target))
            }
        }
    }

    fn timeout_error(&self, target: &Address) -> ConnectionError {
        ConnectionError::ConnectionTimeout {
            peer: target.clone(),
            timeout_ms: self.config.connect_timeout.as_millis() as u64,
        }
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Release a removed entry's session and, unless called from it, its pump
    async fn dispose(&self, entry: PeerEntry, abort_pump: bool) {
        entry.ready.send_if_modified(|readiness| {
            if *readiness == Readiness::Pending || *readiness == Readiness::Open {
                *readiness = Readiness::Closed;
                true
            } else {
                false
            }
        });
        if let Some(session) = entry.session {
            session.close().await;
        }
        if abort_pump {
            if let Some(pump) = entry.pump {
                pump.abort();
            }
        }
    }

    async fn fail_attempt(&self, peer: &Address, generation: u64, reason: &str) {
        let taken = {
            let mut table = self.table.lock().await;
            let mut taken = table.take(peer, generation);
            if let Some(entry) = taken.as_mut() {
                let audit = entry.advance(
                    LinkEvent::NegotiationFailed {
                        reason: reason.to_string(),
                    },
                    self.now(),
                );
                table.record(audit);
                table.stats.negotiations_failed += 1;
                table.pending_candidates.remove(peer);
                entry.ready.send_replace(Readiness::Failed(reason.to_string()));
            }
            taken
        };
        if let Some(entry) = taken {
            warn!("Negotiation with {} failed: {}", peer, reason);
            self.dispose(entry, true).await;
        }
    }

    async fn expire(&self, peer: &Address, generation: u64) {
        let taken = {
            let mut table = self.table.lock().await;
            let mut taken = table.take(peer, generation);
            if let Some(entry) = taken.as_mut() {
                let audit = entry.advance(LinkEvent::Timeout, self.now());
                table.record(audit);
                table.stats.timeouts += 1;
                table.pending_candidates.remove(peer);
                entry.ready.send_replace(Readiness::Failed("timeout".to_string()));
            }
            taken
        };
        if let Some(entry) = taken {
            warn!("Negotiation with {} timed out", peer);
            self.dispose(entry, true).await;
        }
    }

    async fn destroy(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);

        let entries: Vec<PeerEntry> = {
            let mut table = self.table.lock().await;
            table.attempts.clear();
            table.pending_offers.clear();
            table.pending_candidates.clear();

            let now = self.now();
            let mut entries: Vec<PeerEntry> = table.peers.drain().map(|(_, entry)| entry).collect();
            for entry in entries.iter_mut() {
                let audit = entry.advance(LinkEvent::Teardown, now);
                table.record(audit);
            }
            entries
        };
        self.subscribers.lock().await.clear();

        if !entries.is_empty() {
            info!("Tearing down {} connection(s) for {}", entries.len(), self.local);
        }
        join_all(entries.into_iter().map(|entry| self.dispose(entry, true))).await;
    }

    // ------------------------------------------------------------------------
    // Session events
    // ------------------------------------------------------------------------

    /// Handle one session event; returns whether the session is finished
    async fn handle_session_event(
        &self,
        peer: &Address,
        generation: u64,
        serial: u64,
        event: SessionEvent,
    ) -> bool {
        match event {
            SessionEvent::LocalCandidate(candidate) => {
                if let Err(e) = self
                    .relay
                    .publish(&self.local, peer, Signal::Candidate(candidate))
                    .await
                {
                    warn!("Failed to publish candidate to {}: {}", peer, e);
                }
                false
            }
            SessionEvent::ChannelOpen => {
                self.mark_open(peer, generation, serial).await;
                false
            }
            SessionEvent::Message(bytes) => {
                self.handle_frame(peer, generation, serial, bytes).await;
                false
            }
            SessionEvent::Failed(reason) => {
                self.retire(peer, generation, serial, reason, false).await;
                true
            }
            SessionEvent::Closed => {
                self.retire(peer, generation, serial, "closed by peer".to_string(), true)
                    .await;
                true
            }
        }
    }

    async fn mark_open(&self, peer: &Address, generation: u64, serial: u64) {
        let mut table = self.table.lock().await;
        let now = self.now();
        let audit = match table.peers.get_mut(peer) {
            Some(entry) if entry.is_current(generation, serial) && entry.state.is_negotiating() => {
                let audit = entry.advance(LinkEvent::ChannelOpened, now);
                entry.ready.send_replace(Readiness::Open);
                audit
            }
            _ => return,
        };
        table.record(audit);
        table.stats.channels_opened += 1;
        table.attempts.remove(peer);
        info!("Channel to {} open", peer);
    }

    async fn retire(
        &self,
        peer: &Address,
        generation: u64,
        serial: u64,
        reason: String,
        closed_cleanly: bool,
    ) {
        let taken = {
            let mut table = self.table.lock().await;
            let current = table
                .peers
                .get(peer)
                .map(|entry| entry.is_current(generation, serial))
                .unwrap_or(false);
            if !current {
                return;
            }
            let mut taken = table.peers.remove(peer);
            if let Some(entry) = taken.as_mut() {
                let was_open = entry.state.is_open();
                let event = if was_open {
                    LinkEvent::ChannelClosed {
                        reason: reason.clone(),
                    }
                } else {
                    LinkEvent::NegotiationFailed {
                        reason: reason.clone(),
                    }
                };
                let audit = entry.advance(event, self.now());
                table.record(audit);
                if !was_open {
                    table.stats.negotiations_failed += 1;
                }
                table.pending_candidates.remove(peer);
                entry.ready.send_replace(if closed_cleanly {
                    Readiness::Closed
                } else {
                    Readiness::Failed(reason.clone())
                });
            }
            taken
        };
        if let Some(entry) = taken {
            info!("Link to {} ended: {}", peer, reason);
            self.dispose(entry, false).await;
        }
    }

    async fn handle_frame(&self, peer: &Address, generation: u64, serial: u64, bytes: Vec<u8>) {
        let frame = match ChannelFrame::from_bytes(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping malformed frame from {}: {}", peer, e);
                self.table.lock().await.stats.frames_rejected += 1;
                return;
            }
        };
        if frame.sender != *peer {
            warn!("Dropping frame on {}'s channel claiming sender {}", peer, frame.sender);
            self.table.lock().await.stats.frames_rejected += 1;
            return;
        }
        if !frame.verify_signature() {
            warn!("Dropping frame from {} with invalid signature", peer);
            self.table.lock().await.stats.frames_rejected += 1;
            return;
        }

        {
            let mut table = self.table.lock().await;
            let now = self.now();
            // Per-frame activity stays out of the audit trail
            if let Some(entry) = table.peers.get_mut(peer) {
                if entry.is_current(generation, serial) {
                    entry.advance(LinkEvent::FrameReceived, now);
                }
            }
            table.stats.frames_received += 1;
        }

        let inbound = InboundFrame {
            from: frame.sender,
            kind: frame.kind,
            content: frame.content,
            timestamp: frame.timestamp,
        };
        let subscribers: Vec<mpsc::Sender<InboundFrame>> = {
            let mut subscribers = self.subscribers.lock().await;
            subscribers.retain(|subscriber| !subscriber.is_closed());
            subscribers.clone()
        };
        for subscriber in subscribers {
            let _ = subscriber.send(inbound.clone()).await;
        }
    }

    // ------------------------------------------------------------------------
    // Outbound frames
    // ------------------------------------------------------------------------

    async fn send_frame(
        &self,
        target: &Address,
        kind: FrameKind,
        content: String,
    ) -> Result<(), SendError> {
        let (session, generation) = {
            let table = self.table.lock().await;
            match table.peers.get(target) {
                None => return Err(SendError::NoChannel { peer: target.clone() }),
                Some(entry) => match (&entry.session, entry.state.is_open()) {
                    (Some(session), true) => (session.clone(), entry.generation),
                    _ => return Err(SendError::ChannelNotReady { peer: target.clone() }),
                },
            }
        };

        let mut frame = ChannelFrame::new(kind, content, self.local.clone(), self.now());
        let signature =
            identity::sign(&frame.signing_bytes(), Some(self.identity.as_ref())).await?;
        frame.signature = signature.to_hex();
        session.send(frame.to_bytes()?).await?;

        let mut table = self.table.lock().await;
        let now = self.now();
        if let Some(entry) = table.peers.get_mut(target) {
            if entry.generation == generation {
                entry.advance(LinkEvent::FrameSent, now);
            }
        }
        table.stats.frames_sent += 1;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Signals
    // ------------------------------------------------------------------------

    async fn handle_signal(self: &Arc<Self>, envelope: SignalEnvelope) {
        if envelope.to != self.local {
            return;
        }
        trace!("Signal {} from {}", envelope.signal.kind(), envelope.from);
        match envelope.signal {
            Signal::Offer { sdp } => self.on_remote_offer(envelope.from, sdp).await,
            Signal::Answer { sdp } => self.on_remote_answer(envelope.from, sdp).await,
            Signal::Candidate(candidate) => self.on_remote_candidate(envelope.from, candidate).await,
        }
    }

    async fn on_remote_offer(self: &Arc<Self>, from: Address, sdp: String) {
        let action = {
            let mut guard = self.table.lock().await;
            let table = &mut *guard;
            let negotiating = table
                .peers
                .get(&from)
                .map(|entry| (entry.state.is_negotiating(), entry.state.is_open()));
            let has_room = table.pending_offers.contains_key(&from)
                || table.pending_offers.len() < MAX_BUFFERED_PEERS;

            match negotiating {
                Some((true, _)) => {
                    let Some(entry) = table.peers.get_mut(&from) else {
                        return;
                    };
                    match entry.state.role() {
                        Some(NegotiationRole::Responder) if !entry.remote_description_set => {
                            match entry.session.clone() {
                                Some(session) => {
                                    entry.remote_description_set = true;
                                    OfferAction::Answer {
                                        generation: entry.generation,
                                        session,
                                    }
                                }
                                None => {
                                    table.pending_offers.insert(from.clone(), sdp.clone());
                                    OfferAction::Ignore
                                }
                            }
                        }
                        Some(NegotiationRole::Initiator) if self.local > from => {
                            let generation = entry.generation;
                            table.pending_offers.insert(from.clone(), sdp.clone());
                            table.stats.glare_yields += 1;
                            OfferAction::Yield { generation }
                        }
                        _ => OfferAction::Ignore,
                    }
                }
                _ if !has_room => {
                    table.stats.signals_dropped += 1;
                    OfferAction::Drop
                }
                Some((false, true)) => {
                    // The peer renegotiates a link we consider open
                    let stale = table.peers.remove(&from);
                    table.pending_offers.insert(from.clone(), sdp.clone());
                    OfferAction::Buffer { stale }
                }
                _ => {
                    table.pending_offers.insert(from.clone(), sdp.clone());
                    OfferAction::Buffer { stale: None }
                }
            }
        };

        match action {
            OfferAction::Answer {
                generation,
                session,
            } => {
                let answer = self.answer_offer(&from, &session, sdp);
                match tokio::time::timeout(self.config.connect_timeout, answer).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => self.fail_attempt(&from, generation, &e.to_string()).await,
                    Err(_) => self.expire(&from, generation).await,
                }
            }
            OfferAction::Yield { generation } => self.yield_to_offer(&from, generation).await,
            OfferAction::Buffer { stale } => {
                if let Some(stale) = stale {
                    self.dispose(stale, true).await;
                }
                if self.config.auto_accept_offers {
                    let manager = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(e) = manager.init_connection(&from, false).await {
                            warn!("Answering offer from {} failed: {}", from, e);
                        }
                    });
                } else {
                    debug!("Buffered offer from {}", from);
                }
            }
            OfferAction::Ignore => {
                debug!("Ignoring offer from {} during our own negotiation", from);
            }
            OfferAction::Drop => {
                warn!("Dropping offer from {}: too many peers waiting", from);
            }
        }
    }

    /// Abandon our own offer and answer the peer's instead
    async fn yield_to_offer(self: &Arc<Self>, peer: &Address, generation: u64) {
        info!("Simultaneous offers with {}; answering theirs", peer);
        let epoch = self.epoch.load(Ordering::SeqCst);

        {
            let mut table = self.table.lock().await;
            let now = self.now();
            let audit = match table.peers.get_mut(peer) {
                Some(entry) if entry.generation == generation => {
                    entry.advance(LinkEvent::YieldToRemoteOffer, now)
                }
                _ => return,
            };
            table.record(audit);
        }

        let exchange = self.negotiate(peer, NegotiationRole::Responder, generation, epoch);
        match tokio::time::timeout(self.config.connect_timeout, exchange).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.fail_attempt(peer, generation, &e.to_string()).await,
            Err(_) => self.expire(peer, generation).await,
        }
    }

    async fn on_remote_answer(&self, from: Address, sdp: String) {
        let target = {
            let mut table = self.table.lock().await;
            match table.peers.get_mut(&from) {
                Some(entry)
                    if entry.state.is_negotiating()
                        && entry.state.role() == Some(NegotiationRole::Initiator)
                        && !entry.remote_description_set =>
                {
                    entry.remote_description_set = true;
                    entry
                        .session
                        .clone()
                        .map(|session| (entry.generation, session))
                }
                _ => None,
            }
        };

        match target {
            Some((generation, session)) => match session.accept_answer(sdp).await {
                Ok(()) => self.flush_candidates(&from, &session).await,
                Err(e) => self.fail_attempt(&from, generation, &e.to_string()).await,
            },
            None => debug!("Ignoring unexpected answer from {}", from),
        }
    }

    async fn on_remote_candidate(&self, from: Address, candidate: IceCandidate) {
        let session = {
            let mut table = self.table.lock().await;
            let ready = table
                .peers
                .get(&from)
                .filter(|entry| entry.remote_description_set)
                .and_then(|entry| entry.session.clone());
            if ready.is_none() {
                let accept = match table.pending_candidates.get(&from) {
                    Some(held) => held.len() < MAX_BUFFERED_CANDIDATES,
                    None => table.pending_candidates.len() < MAX_BUFFERED_PEERS,
                };
                if accept {
                    table
                        .pending_candidates
                        .entry(from.clone())
                        .or_default()
                        .push(candidate.clone());
                } else {
                    trace!("Dropping candidate from {}", from);
                    table.stats.signals_dropped += 1;
                }
            }
            ready
        };

        if let Some(session) = session {
            if let Err(e) = session.add_remote_candidate(candidate).await {
                warn!("Failed to apply candidate from {}: {}", from, e);
            }
        }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        if let Ok(mut pump) = self.signal_pump.lock() {
            if let Some(pump) = pump.take() {
                pump.abort();
            }
        }
        for entry in self.table.get_mut().peers.values_mut() {
            if let Some(pump) = entry.pump.take() {
                pump.abort();
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Background pumps
// ----------------------------------------------------------------------------

async fn wait_for_readiness(mut ready: watch::Receiver<Readiness>) -> Readiness {
    loop {
        let current = ready.borrow_and_update().clone();
        if current != Readiness::Pending {
            return current;
        }
        if ready.changed().await.is_err() {
            return ready.borrow().clone();
        }
    }
}

async fn run_signal_pump(manager: Weak<ManagerInner>, mut signals: mpsc::Receiver<SignalEnvelope>) {
    while let Some(envelope) = signals.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.handle_signal(envelope).await;
    }
    debug!("Signal pump stopped");
}

async fn run_session_pump(
    manager: Weak<ManagerInner>,
    peer: Address,
    generation: u64,
    serial: u64,
    mut events: mpsc::Receiver<SessionEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        if manager
            .handle_session_event(&peer, generation, serial, event)
            .await
        {
            break;
        }
    }
    trace!("Session pump for {} stopped", peer);
}

//! Message delivery coordination
//!
//! The coordinator owns the local message log and drives each message through
//! `Sending -> Sent -> Delivered` (or `Failed`). A message is appended in
//! `Sending` before anything else happens and stays in the log whatever the
//! outcome; delivery then tries the direct channel and, when that fails for
//! any reason, parks the signed envelope in the fallback store.
//!
//! Inbound envelopes arrive from the connection manager's frame subscription
//! or from `fetch_offline`. Both paths verify the envelope signature, drop
//! duplicates by id and decrypt with the cached shared key.

use peerlink_core::{
    conversation, message::sort_thread, Address, Conversation, CryptographicError,
    DeliveryStatus, FallbackStore, FrameKind, KeyDirectory, Message, MessageEnvelope, MessageId,
    identity, MessageView, PeerTransport, PeerlinkConfig, PeerlinkError, PresenceFeed,
    PresenceSet, PresenceTracker, SendError, SendOptions, SessionKeyPair, SharedIdentity,
    SharedKey, SharedTimeSource, SignalRelay, Timestamp,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connection::{InboundFrame, MessageSubscription, PeerConnectionManager};
use super::keys::SharedKeyCache;

// ----------------------------------------------------------------------------
// Public Types
// ----------------------------------------------------------------------------

/// External collaborators the coordinator is constructed with
#[derive(Clone)]
pub struct DeliveryServices {
    pub relay: Arc<dyn SignalRelay>,
    pub store: Arc<dyn FallbackStore>,
    pub directory: Arc<dyn KeyDirectory>,
    pub transport: Arc<dyn PeerTransport>,
    pub presence: Option<Arc<dyn PresenceFeed>>,
}

/// Notifications for subscribers of the message log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeliveryEvent {
    MessageAdded { id: MessageId },
    StatusChanged { id: MessageId, status: DeliveryStatus },
    MessageReceived { id: MessageId, from: Address },
    MessageBurned { id: MessageId },
    ConversationsUpdated { conversations: Vec<Conversation> },
}

/// How a message left this node
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Direct,
    Stored { address: String },
}

struct ActiveSession {
    identity: SharedIdentity,
    address: Address,
    key_pair: SessionKeyPair,
    manager: PeerConnectionManager,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl ActiveSession {
    fn stop_tasks(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

// ----------------------------------------------------------------------------
// Coordinator
// ----------------------------------------------------------------------------

struct CoordinatorInner {
    config: PeerlinkConfig,
    services: DeliveryServices,
    time_source: SharedTimeSource,
    session: RwLock<Option<Arc<ActiveSession>>>,
    messages: Mutex<HashMap<MessageId, Message>>,
    /// Receipts that arrived while their message was still `Sending`
    early_receipts: StdMutex<HashSet<MessageId>>,
    keys: SharedKeyCache,
    presence: RwLock<PresenceTracker>,
    events: broadcast::Sender<DeliveryEvent>,
}

/// Coordinates sending, receiving and local state for one identity at a time
#[derive(Clone)]
pub struct DeliveryCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl DeliveryCoordinator {
    pub fn new(
        config: PeerlinkConfig,
        services: DeliveryServices,
        time_source: SharedTimeSource,
    ) -> Self {
        let (events, _) = broadcast::channel(config.delivery.event_buffer_size.max(1));
        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                services,
                time_source,
                session: RwLock::new(None),
                messages: Mutex::new(HashMap::new()),
                early_receipts: StdMutex::new(HashSet::new()),
                keys: SharedKeyCache::new(),
                presence: RwLock::new(PresenceTracker::new()),
                events,
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Session
    // ------------------------------------------------------------------------

    /// Start a session for `identity` with a fresh session key pair
    pub async fn connect(&self, identity: SharedIdentity) -> Result<(), PeerlinkError> {
        if self.is_connected().await {
            self.disconnect().await;
        }
        let inner = &self.inner;
        let address = identity.address();

        let key_pair = SessionKeyPair::generate()?;
        inner
            .services
            .directory
            .publish(&address, key_pair.public_key())
            .await?;

        let manager = PeerConnectionManager::start(
            identity.clone(),
            inner.services.relay.clone(),
            inner.services.transport.clone(),
            inner.config.connection.clone(),
            inner.time_source.clone(),
        )
        .await?;

        let mut tasks = Vec::new();
        let frames = manager.on_message().await;
        tasks.push(tokio::spawn(run_inbound_pump(Arc::downgrade(inner), frames)));
        if let Some(feed) = &inner.services.presence {
            let updates = feed.subscribe().await;
            tasks.push(tokio::spawn(run_presence_pump(Arc::downgrade(inner), updates)));
        }

        inner.keys.clear();
        *inner.session.write().await = Some(Arc::new(ActiveSession {
            identity,
            address: address.clone(),
            key_pair,
            manager,
            tasks: StdMutex::new(tasks),
        }));
        info!("Connected as {}", address);
        Ok(())
    }

    /// Tear down the session; the message log is kept
    pub async fn disconnect(&self) {
        let session = self.inner.session.write().await.take();
        if let Some(session) = session {
            session.stop_tasks();
            session.manager.destroy().await;
            self.inner.keys.clear();
            info!("Disconnected {}", session.address);
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.session.read().await.is_some()
    }

    pub async fn local_address(&self) -> Option<Address> {
        self.inner
            .session
            .read()
            .await
            .as_ref()
            .map(|session| session.address.clone())
    }

    /// Connection manager of the active session
    pub async fn connections(&self) -> Option<PeerConnectionManager> {
        self.inner
            .session
            .read()
            .await
            .as_ref()
            .map(|session| session.manager.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.inner.events.subscribe()
    }

    pub async fn is_online(&self, address: &Address) -> bool {
        self.inner.presence.read().await.is_online(address)
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    pub async fn send_message(
        &self,
        content: &str,
        receiver: &Address,
        encrypted: bool,
    ) -> Result<MessageId, SendError> {
        self.send_message_with(content, receiver, encrypted, SendOptions::default())
            .await
    }

    /// Send with disappearing or burn-after-reading options
    pub async fn send_message_with(
        &self,
        content: &str,
        receiver: &Address,
        encrypted: bool,
        options: SendOptions,
    ) -> Result<MessageId, SendError> {
        let session = self.inner.active().await?;
        let message = Message::outgoing(
            MessageId::new(),
            session.address.clone(),
            receiver.clone(),
            content.to_string(),
            encrypted,
            options,
            self.inner.now(),
        );
        let id = message.id;

        self.inner.messages.lock().await.insert(id, message);
        self.inner.emit(DeliveryEvent::MessageAdded { id });
        self.inner.emit_conversations(&session.address).await;

        self.inner.deliver(&session, id).await?;
        Ok(id)
    }

    /// Send a failed message again
    pub async fn retry(&self, id: &MessageId) -> Result<(), SendError> {
        let session = self.inner.active().await?;
        {
            let mut messages = self.inner.messages.lock().await;
            let message = messages
                .get_mut(id)
                .ok_or_else(|| SendError::UnknownMessage { id: id.to_string() })?;
            message.begin_retry()?;
        }
        self.inner.emit(DeliveryEvent::StatusChanged {
            id: *id,
            status: DeliveryStatus::Sending,
        });
        debug!("Retrying message {}", id);
        self.inner.deliver(&session, *id).await
    }

    // ------------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------------

    /// Ingest a raw JSON envelope. Returns `None` for a duplicate.
    pub async fn receive(&self, raw: &str) -> Result<Option<MessageId>, PeerlinkError> {
        let envelope = MessageEnvelope::from_json(raw)?;
        self.inner.ingest(envelope).await
    }

    /// Pull an envelope parked in the fallback store and ingest it
    pub async fn fetch_offline(&self, id: &MessageId) -> Result<Option<MessageId>, PeerlinkError> {
        let payload = self.inner.services.store.get(id).await?;
        let raw = String::from_utf8(payload)
            .map_err(|_| PeerlinkError::invalid_envelope("stored payload is not UTF-8"))?;
        let envelope = MessageEnvelope::from_json(&raw)?;
        if envelope.id != *id {
            return Err(PeerlinkError::invalid_envelope(format!(
                "stored under {} but carries id {}",
                id, envelope.id
            )));
        }
        self.inner.ingest(envelope).await
    }

    /// Mark an incoming message read; burn-after-reading messages start their timer
    pub async fn mark_read(&self, id: &MessageId) -> Result<bool, SendError> {
        let local = self.inner.active().await?.address.clone();
        let now = self.inner.now();

        let (changed, burns) = {
            let mut messages = self.inner.messages.lock().await;
            let message = messages
                .get_mut(id)
                .ok_or_else(|| SendError::UnknownMessage { id: id.to_string() })?;
            if message.receiver != local || message.tombstoned {
                return Ok(false);
            }
            let changed = message.mark_read(now);
            (changed, changed && message.options.burn_after_reading)
        };

        if burns {
            let delay = self.inner.config.delivery.burn_delay;
            let coordinator = Arc::downgrade(&self.inner);
            let id = *id;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(inner) = coordinator.upgrade() {
                    inner.burn(&id).await;
                }
            });
        }
        if changed {
            self.inner.emit_conversations(&local).await;
        }
        Ok(changed)
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Snapshot of one message with expiry applied
    pub async fn message(&self, id: &MessageId) -> Option<Message> {
        let now = self.inner.now();
        let delay = self.inner.config.delivery.burn_delay;
        let mut messages = self.inner.messages.lock().await;
        let message = messages.get_mut(id)?;
        message.enforce_policies(now, delay);
        Some(message.clone())
    }

    /// Messages exchanged with `peer`, ordered by timestamp
    pub async fn thread(&self, peer: &Address) -> Result<Vec<MessageView>, SendError> {
        let local = self.inner.active().await?.address.clone();
        let (mut views, burned) = {
            let mut messages = self.inner.messages.lock().await;
            let burned = self.inner.enforce_policies(&mut messages, Some(peer), &local);
            let views: Vec<MessageView> = messages
                .values()
                .filter(|message| message.involves(&local, peer))
                .map(|message| message.view(&local))
                .collect();
            (views, burned)
        };
        sort_thread(&mut views);
        for id in burned {
            self.inner.emit(DeliveryEvent::MessageBurned { id });
        }
        Ok(views)
    }

    /// Conversations of the local identity, most recent first
    pub async fn conversations(&self) -> Result<Vec<Conversation>, SendError> {
        let local = self.inner.active().await?.address.clone();
        let (conversations, burned) = {
            let mut messages = self.inner.messages.lock().await;
            let burned = self.inner.enforce_policies(&mut messages, None, &local);
            (Self::aggregate_for(&messages, &local), burned)
        };
        for id in burned {
            self.inner.emit(DeliveryEvent::MessageBurned { id });
        }
        Ok(conversations)
    }

    fn aggregate_for(messages: &HashMap<MessageId, Message>, local: &Address) -> Vec<Conversation> {
        conversation::aggregate(
            messages
                .values()
                .filter(|message| &message.sender == local || &message.receiver == local),
            local,
        )
    }
}

impl CoordinatorInner {
    fn now(&self) -> Timestamp {
        self.time_source.now()
    }

    fn emit(&self, event: DeliveryEvent) {
        let _ = self.events.send(event);
    }

    async fn emit_conversations(&self, local: &Address) {
        if self.events.receiver_count() == 0 {
            return;
        }
        let conversations = {
            let messages = self.messages.lock().await;
            DeliveryCoordinator::aggregate_for(&messages, local)
        };
        self.emit(DeliveryEvent::ConversationsUpdated { conversations });
    }

    async fn active(&self) -> Result<Arc<ActiveSession>, SendError> {
        self.session.read().await.clone().ok_or(SendError::NotConnected)
    }

    /// Tombstone everything a policy has expired; returns the ids that changed
    fn enforce_policies(
        &self,
        messages: &mut HashMap<MessageId, Message>,
        peer: Option<&Address>,
        local: &Address,
    ) -> Vec<MessageId> {
        let now = self.now();
        let delay = self.config.delivery.burn_delay;
        messages
            .values_mut()
            .filter(|message| peer.map_or(true, |peer| message.involves(local, peer)))
            .filter_map(|message| message.enforce_policies(now, delay).then_some(message.id))
            .collect()
    }

    async fn burn(&self, id: &MessageId) {
        let burned = {
            let mut messages = self.messages.lock().await;
            messages.get_mut(id).map(Message::tombstone).unwrap_or(false)
        };
        if burned {
            debug!("Burned message {}", id);
            self.emit(DeliveryEvent::MessageBurned { id: *id });
        }
    }

    // ------------------------------------------------------------------------
    // Keys
    // ------------------------------------------------------------------------

    /// Cached shared key for `peer`, derived from its directory entry on first use
    async fn shared_key(
        &self,
        session: &ActiveSession,
        peer: &Address,
    ) -> Result<Arc<SharedKey>, SendError> {
        if let Some(key) = self.keys.get(peer) {
            return Ok(key);
        }
        let public = self
            .services
            .directory
            .lookup(peer)
            .await?
            .ok_or_else(|| SendError::PeerKeyUnavailable { peer: peer.clone() })?;
        let derived = session.key_pair.derive_shared_key(&public)?;
        Ok(self.keys.insert_if_absent(peer, derived))
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    async fn deliver(&self, session: &Arc<ActiveSession>, id: MessageId) -> Result<(), SendError> {
        let outcome = self.dispatch(session, id).await;

        for status in self.record_outcome(id, &outcome).await? {
            self.emit(DeliveryEvent::StatusChanged { id, status });
        }
        self.emit_conversations(&session.address).await;

        match outcome {
            Ok((Route::Direct, _)) => {
                info!("Message {} delivered directly", id);
                Ok(())
            }
            Ok((Route::Stored { address }, _)) => {
                info!("Message {} parked in fallback store at {}", id, address);
                Ok(())
            }
            Err(e) => {
                warn!("Message {} failed: {}", id, e);
                Err(e)
            }
        }
    }

    /// Apply a dispatch outcome to the log; returns the statuses entered, in order
    async fn record_outcome(
        &self,
        id: MessageId,
        outcome: &Result<(Route, MessageEnvelope), SendError>,
    ) -> Result<Vec<DeliveryStatus>, SendError> {
        let mut messages = self.messages.lock().await;
        let message = messages
            .get_mut(&id)
            .ok_or_else(|| SendError::UnknownMessage { id: id.to_string() })?;
        let early_receipt = self.take_early_receipt(&id);

        match outcome {
            Ok((route, envelope)) => {
                message.signature = Some(envelope.signature.clone());
                if let Route::Stored { address } = route {
                    message.stored_at = Some(address.clone());
                    if envelope.encrypted {
                        message.ciphertext = Some(envelope.content.clone());
                        message.nonce = envelope.nonce.clone();
                    }
                }
                message.mark_sent()?;
                if early_receipt {
                    message.mark_delivered()?;
                    return Ok(vec![DeliveryStatus::Sent, DeliveryStatus::Delivered]);
                }
                Ok(vec![DeliveryStatus::Sent])
            }
            Err(e) => {
                message.mark_failed(e.to_string())?;
                Ok(vec![DeliveryStatus::Failed])
            }
        }
    }

    fn hold_receipt(&self, id: MessageId) {
        if let Ok(mut held) = self.early_receipts.lock() {
            held.insert(id);
        }
    }

    fn take_early_receipt(&self, id: &MessageId) -> bool {
        self.early_receipts
            .lock()
            .map(|mut held| held.remove(id))
            .unwrap_or(false)
    }

    async fn dispatch(
        &self,
        session: &Arc<ActiveSession>,
        id: MessageId,
    ) -> Result<(Route, MessageEnvelope), SendError> {
        let envelope = self.seal(session, id).await?;
        let payload = serde_json::to_string(&envelope)?;

        match self.deliver_direct(session, &envelope.receiver, &payload).await {
            Ok(()) => Ok((Route::Direct, envelope)),
            Err(e) => {
                debug!("Direct delivery of {} failed: {}", id, e);
                let address = self.services.store.put(&id, payload.into_bytes()).await?;
                Ok((Route::Stored { address }, envelope))
            }
        }
    }

    /// Build and sign the envelope for a logged message
    async fn seal(&self, session: &ActiveSession, id: MessageId) -> Result<MessageEnvelope, SendError> {
        let message = self
            .messages
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| SendError::UnknownMessage { id: id.to_string() })?;
        let content = message.content.as_deref().ok_or_else(|| SendError::UnknownMessage {
            id: id.to_string(),
        })?;

        let envelope = if message.encrypted {
            let key = self.shared_key(session, &message.receiver).await?;
            MessageEnvelope::sealed(
                id,
                message.sender.clone(),
                message.receiver.clone(),
                content,
                &key,
                message.timestamp,
            )?
        } else {
            MessageEnvelope::plaintext(
                id,
                message.sender.clone(),
                message.receiver.clone(),
                content,
                message.timestamp,
            )
        };
        let mut envelope = envelope.with_policies(
            message
                .options
                .disappear_after
                .map(|after| after.as_millis() as u64),
            message.options.burn_after_reading,
        );

        let signature =
            identity::sign(&envelope.signing_bytes(), Some(session.identity.as_ref())).await?;
        envelope.set_signature(&signature);
        Ok(envelope)
    }

    async fn deliver_direct(
        &self,
        session: &ActiveSession,
        receiver: &Address,
        payload: &str,
    ) -> Result<(), SendError> {
        let manager = &session.manager;
        if !manager.is_open(receiver).await {
            let absent = self.presence.read().await.is_absent(receiver);
            if absent && self.config.delivery.eager_fallback_when_absent {
                return Err(SendError::PeerOffline {
                    peer: receiver.clone(),
                });
            }
            manager.init_connection(receiver, true).await?;
        }
        manager.send(receiver, payload).await
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    async fn ingest(&self, envelope: MessageEnvelope) -> Result<Option<MessageId>, PeerlinkError> {
        let session = self.active().await?;
        if envelope.receiver != session.address {
            return Err(PeerlinkError::invalid_envelope(format!(
                "addressed to {}",
                envelope.receiver
            )));
        }
        if self.messages.lock().await.contains_key(&envelope.id) {
            debug!("Ignoring duplicate message {}", envelope.id);
            return Ok(None);
        }
        if !envelope.verify_signature() {
            return Err(PeerlinkError::invalid_envelope(format!(
                "signature does not match sender {}",
                envelope.sender
            )));
        }

        let plaintext = self.open(&session, &envelope).await?;
        let id = envelope.id;
        let from = envelope.sender.clone();
        {
            let mut messages = self.messages.lock().await;
            if messages.contains_key(&id) {
                return Ok(None);
            }
            messages.insert(id, Message::incoming(&envelope, plaintext));
        }
        info!("Received message {} from {}", id, from);
        self.emit(DeliveryEvent::MessageReceived {
            id,
            from: from.clone(),
        });
        self.emit_conversations(&session.address).await;

        if let Err(e) = session.manager.send_receipt(&from, &id).await {
            debug!("No receipt for {}: {}", id, e);
        }
        Ok(Some(id))
    }

    async fn open(
        &self,
        session: &ActiveSession,
        envelope: &MessageEnvelope,
    ) -> Result<String, PeerlinkError> {
        if !envelope.encrypted {
            return Ok(envelope.content.clone());
        }
        let key = self.shared_key(session, &envelope.sender).await?;
        match envelope.open(Some(&key)) {
            Err(CryptographicError::DecryptionFailed) if self.keys.evict(&envelope.sender) => {
                // The sender may have reconnected with a new session key
                debug!("Re-deriving key for {}", envelope.sender);
                let key = self.shared_key(session, &envelope.sender).await?;
                Ok(envelope.open(Some(&key))?)
            }
            other => Ok(other?),
        }
    }

    async fn handle_frame(&self, frame: InboundFrame) {
        match frame.kind {
            FrameKind::Message => {
                let envelope = match MessageEnvelope::from_json(&frame.content) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!("Dropping frame from {}: {}", frame.from, e);
                        return;
                    }
                };
                if envelope.sender != frame.from {
                    warn!(
                        "Dropping envelope from {} relayed by {}",
                        envelope.sender, frame.from
                    );
                    return;
                }
                if let Err(e) = self.ingest(envelope).await {
                    warn!("Rejected message from {}: {}", frame.from, e);
                }
            }
            FrameKind::Receipt => self.apply_receipt(&frame.from, &frame.content).await,
        }
    }

    async fn apply_receipt(&self, from: &Address, content: &str) {
        let Ok(id) = content.parse::<MessageId>() else {
            warn!("Malformed receipt from {}", from);
            return;
        };
        let delivered = {
            let mut messages = self.messages.lock().await;
            match messages.get_mut(&id) {
                Some(message) if &message.receiver == from => {
                    if message.status == DeliveryStatus::Sending {
                        // The peer answered before the send outcome was recorded
                        self.hold_receipt(id);
                        false
                    } else {
                        message.mark_delivered().is_ok()
                    }
                }
                _ => false,
            }
        };
        if delivered {
            debug!("Message {} acknowledged by {}", id, from);
            self.emit(DeliveryEvent::StatusChanged {
                id,
                status: DeliveryStatus::Delivered,
            });
        }
    }
}

// ----------------------------------------------------------------------------
// Background pumps
// ----------------------------------------------------------------------------

async fn run_inbound_pump(coordinator: Weak<CoordinatorInner>, mut frames: MessageSubscription) {
    while let Some(frame) = frames.recv().await {
        let Some(coordinator) = coordinator.upgrade() else {
            break;
        };
        coordinator.handle_frame(frame).await;
    }
    debug!("Inbound pump stopped");
}

async fn run_presence_pump(coordinator: Weak<CoordinatorInner>, mut updates: mpsc::Receiver<PresenceSet>) {
    while let Some(snapshot) = updates.recv().await {
        let Some(coordinator) = coordinator.upgrade() else {
            break;
        };
        debug!("Presence update: {} online", snapshot.len());
        coordinator.presence.write().await.update(snapshot);
    }
}

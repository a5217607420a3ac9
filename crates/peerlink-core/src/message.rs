//! Message records and their lifecycle
//!
//! A [`Message`] is the local record of one chat message, sent or received.
//! Outgoing messages move through `Sending -> Sent -> Delivered`, or
//! `Sending -> Failed` and back to `Sending` on an explicit retry. Received
//! messages are recorded directly as `Delivered`.
//!
//! Disappearing and burn-after-reading policies are evaluated lazily against
//! the supplied time: once a message is observed expired its plaintext is
//! dropped for good and only a tombstone remains.

use core::fmt;
use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::envelope::MessageEnvelope;
use crate::errors::StateTransitionError;
use crate::types::{Address, MessageId, Timestamp};

/// Text shown in place of an expired or burned message
pub const TOMBSTONE_TEXT: &str = "This message has disappeared";

/// Text shown for an unread burn-after-reading message
pub const REDACTED_TEXT: &str = "Burn after reading: open to reveal";

// ----------------------------------------------------------------------------
// Delivery Status
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Delivered,
    Failed,
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeliveryStatus::Sending => "sending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Send Options
// ----------------------------------------------------------------------------

/// Per-message privacy policies chosen by the sender
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOptions {
    /// Remove the message this long after it was sent
    pub disappear_after: Option<Duration>,
    /// Hide the message until read, then remove it shortly afterwards
    pub burn_after_reading: bool,
}

impl SendOptions {
    pub fn disappearing(after: Duration) -> Self {
        Self {
            disappear_after: Some(after),
            burn_after_reading: false,
        }
    }

    pub fn burn_after_reading() -> Self {
        Self {
            disappear_after: None,
            burn_after_reading: true,
        }
    }
}

// ----------------------------------------------------------------------------
// Message
// ----------------------------------------------------------------------------

/// How a message body should be presented right now
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "text", rename_all = "snake_case")]
pub enum RenderedContent {
    Visible(String),
    Redacted,
    Tombstone,
}

impl RenderedContent {
    pub fn as_text(&self) -> &str {
        match self {
            RenderedContent::Visible(text) => text,
            RenderedContent::Redacted => REDACTED_TEXT,
            RenderedContent::Tombstone => TOMBSTONE_TEXT,
        }
    }
}

/// Local record of a sent or received message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: Address,
    pub receiver: Address,
    /// Plaintext; `None` once tombstoned
    pub content: Option<String>,
    pub timestamp: Timestamp,
    pub status: DeliveryStatus,
    pub encrypted: bool,
    /// Base64 ciphertext and nonce, kept when the envelope went to the fallback store
    pub ciphertext: Option<String>,
    pub nonce: Option<String>,
    pub signature: Option<String>,
    /// Content address returned by the fallback store
    pub stored_at: Option<String>,
    pub options: SendOptions,
    pub read: bool,
    pub read_at: Option<Timestamp>,
    pub tombstoned: bool,
    pub last_error: Option<String>,
}

impl Message {
    /// A message this participant is about to send
    pub fn outgoing(
        id: MessageId,
        sender: Address,
        receiver: Address,
        content: String,
        encrypted: bool,
        options: SendOptions,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id,
            sender,
            receiver,
            content: Some(content),
            timestamp,
            status: DeliveryStatus::Sending,
            encrypted,
            ciphertext: None,
            nonce: None,
            signature: None,
            stored_at: None,
            options,
            read: true,
            read_at: None,
            tombstoned: false,
            last_error: None,
        }
    }

    /// A message received in `envelope`, already opened to `plaintext`
    pub fn incoming(envelope: &MessageEnvelope, plaintext: String) -> Self {
        Self {
            id: envelope.id,
            sender: envelope.sender.clone(),
            receiver: envelope.receiver.clone(),
            content: Some(plaintext),
            timestamp: envelope.timestamp,
            status: DeliveryStatus::Delivered,
            encrypted: envelope.encrypted,
            ciphertext: envelope.encrypted.then(|| envelope.content.clone()),
            nonce: envelope.nonce.clone(),
            signature: Some(envelope.signature.clone()),
            stored_at: None,
            options: SendOptions {
                disappear_after: envelope.disappear_after_ms.map(Duration::from_millis),
                burn_after_reading: envelope.burn_after_reading,
            },
            read: false,
            read_at: None,
            tombstoned: false,
            last_error: None,
        }
    }

    /// The participant on the other side of this message from `viewer`
    pub fn counterparty(&self, viewer: &Address) -> &Address {
        if &self.sender == viewer {
            &self.receiver
        } else {
            &self.sender
        }
    }

    pub fn involves(&self, a: &Address, b: &Address) -> bool {
        (&self.sender == a && &self.receiver == b) || (&self.sender == b && &self.receiver == a)
    }

    // ------------------------------------------------------------------------
    // Status transitions
    // ------------------------------------------------------------------------

    fn transition(
        &mut self,
        allowed_from: &[DeliveryStatus],
        to: DeliveryStatus,
        event: &str,
    ) -> Result<(), StateTransitionError> {
        if !allowed_from.contains(&self.status) {
            return Err(StateTransitionError::InvalidTransition {
                from_state: self.status.to_string(),
                event: event.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn mark_sent(&mut self) -> Result<(), StateTransitionError> {
        self.transition(&[DeliveryStatus::Sending], DeliveryStatus::Sent, "sent")?;
        self.last_error = None;
        Ok(())
    }

    pub fn mark_failed(&mut self, error: String) -> Result<(), StateTransitionError> {
        self.transition(&[DeliveryStatus::Sending], DeliveryStatus::Failed, "failed")?;
        self.last_error = Some(error);
        Ok(())
    }

    /// Acknowledged by the receiver
    pub fn mark_delivered(&mut self) -> Result<(), StateTransitionError> {
        self.transition(&[DeliveryStatus::Sent], DeliveryStatus::Delivered, "receipt")
    }

    /// Re-enter the send pipeline; only failed messages can be retried
    pub fn begin_retry(&mut self) -> Result<(), StateTransitionError> {
        self.transition(&[DeliveryStatus::Failed], DeliveryStatus::Sending, "retry")
    }

    // ------------------------------------------------------------------------
    // Privacy policies
    // ------------------------------------------------------------------------

    /// Moment the disappearing policy removes this message
    pub fn expires_at(&self) -> Option<Timestamp> {
        self.options.disappear_after.map(|after| self.timestamp + after)
    }

    /// Moment the burn-after-reading policy removes this message
    pub fn burns_at(&self, burn_delay: Duration) -> Option<Timestamp> {
        if !self.options.burn_after_reading {
            return None;
        }
        self.read_at.map(|read_at| read_at + burn_delay)
    }

    pub fn is_expired(&self, now: Timestamp, burn_delay: Duration) -> bool {
        let disappeared = self.expires_at().is_some_and(|at| now > at);
        let burned = self.burns_at(burn_delay).is_some_and(|at| now >= at);
        disappeared || burned
    }

    /// Drop the plaintext for good. Returns whether anything changed.
    pub fn tombstone(&mut self) -> bool {
        if self.tombstoned {
            return false;
        }
        self.tombstoned = true;
        self.content = None;
        self.ciphertext = None;
        self.nonce = None;
        true
    }

    /// Tombstone if a policy says the message is gone. Returns whether anything changed.
    pub fn enforce_policies(&mut self, now: Timestamp, burn_delay: Duration) -> bool {
        if !self.tombstoned && self.is_expired(now, burn_delay) {
            self.tombstone()
        } else {
            false
        }
    }

    /// Record that the local participant opened the message
    pub fn mark_read(&mut self, now: Timestamp) -> bool {
        if self.read && self.read_at.is_some() {
            return false;
        }
        self.read = true;
        self.read_at.get_or_insert(now);
        true
    }

    /// What `viewer` should see
    pub fn render(&self, viewer: &Address) -> RenderedContent {
        match &self.content {
            None => RenderedContent::Tombstone,
            Some(_) if self.tombstoned => RenderedContent::Tombstone,
            Some(_) if self.options.burn_after_reading
                && &self.receiver == viewer
                && self.read_at.is_none() =>
            {
                RenderedContent::Redacted
            }
            Some(text) => RenderedContent::Visible(text.clone()),
        }
    }

    /// Presentation snapshot for `viewer`
    pub fn view(&self, viewer: &Address) -> MessageView {
        MessageView {
            id: self.id,
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
            content: self.render(viewer),
            timestamp: self.timestamp,
            status: self.status,
            encrypted: self.encrypted,
            read: self.read,
            burn_after_reading: self.options.burn_after_reading,
            expires_at: self.expires_at(),
        }
    }
}

/// Read-only presentation of a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: MessageId,
    pub sender: Address,
    pub receiver: Address,
    pub content: RenderedContent,
    pub timestamp: Timestamp,
    pub status: DeliveryStatus,
    pub encrypted: bool,
    pub read: bool,
    pub burn_after_reading: bool,
    pub expires_at: Option<Timestamp>,
}

/// Order a thread by timestamp, breaking ties by id
pub fn sort_thread(messages: &mut [MessageView]) {
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;

    const BURN_DELAY: Duration = Duration::from_secs(1);

    fn alice() -> Address {
        Address::new("0xa11ce")
    }

    fn bob() -> Address {
        Address::new("0xb0b")
    }

    fn outgoing(options: SendOptions) -> Message {
        Message::outgoing(
            MessageId::new(),
            alice(),
            bob(),
            "hi".into(),
            true,
            options,
            Timestamp::new(100_000),
        )
    }

    #[test]
    fn test_status_lifecycle() {
        let mut message = outgoing(SendOptions::default());
        assert_eq!(message.status, DeliveryStatus::Sending);

        message.mark_sent().unwrap();
        message.mark_delivered().unwrap();
        assert_eq!(message.status, DeliveryStatus::Delivered);

        assert!(message.mark_sent().is_err());
        assert!(message.begin_retry().is_err());
    }

    #[test]
    fn test_retry_only_from_failed() {
        let mut message = outgoing(SendOptions::default());
        assert!(message.begin_retry().is_err());

        message.mark_failed("both paths failed".into()).unwrap();
        assert_eq!(message.last_error.as_deref(), Some("both paths failed"));

        message.begin_retry().unwrap();
        assert_eq!(message.status, DeliveryStatus::Sending);
        message.mark_sent().unwrap();
        assert_eq!(message.last_error, None);
    }

    #[test]
    fn test_receipt_requires_sent() {
        let mut message = outgoing(SendOptions::default());
        assert!(message.mark_delivered().is_err());
        assert_eq!(message.status, DeliveryStatus::Sending);
    }

    #[test]
    fn test_disappearing_message_expiry() {
        let mut message = outgoing(SendOptions::disappearing(Duration::from_secs(60)));
        let sent = message.timestamp;

        assert!(!message.enforce_policies(sent + Duration::from_secs(59), BURN_DELAY));
        assert_eq!(message.render(&alice()), RenderedContent::Visible("hi".into()));

        assert!(message.enforce_policies(sent + Duration::from_secs(61), BURN_DELAY));
        assert_eq!(message.render(&alice()), RenderedContent::Tombstone);
        assert_eq!(message.content, None);

        // Irreversible
        assert!(!message.enforce_policies(sent, BURN_DELAY));
        assert_eq!(message.render(&bob()), RenderedContent::Tombstone);
    }

    #[test]
    fn test_burn_after_reading_lifecycle() {
        let mut envelope = MessageEnvelope::plaintext(
            MessageId::new(),
            alice(),
            bob(),
            "burn me",
            Timestamp::new(5_000),
        );
        envelope.burn_after_reading = true;
        let mut message = Message::incoming(&envelope, "burn me".into());

        assert_eq!(message.render(&bob()), RenderedContent::Redacted);
        assert_eq!(message.render(&alice()), RenderedContent::Visible("burn me".into()));

        let read_at = Timestamp::new(10_000);
        assert!(message.mark_read(read_at));
        assert_eq!(message.render(&bob()), RenderedContent::Visible("burn me".into()));
        assert!(!message.enforce_policies(Timestamp::new(10_500), BURN_DELAY));

        assert!(message.enforce_policies(Timestamp::new(11_000), BURN_DELAY));
        assert_eq!(message.render(&bob()), RenderedContent::Tombstone);
    }

    #[test]
    fn test_incoming_copies_policies() {
        let envelope = MessageEnvelope::plaintext(
            MessageId::new(),
            alice(),
            bob(),
            "x",
            Timestamp::new(1),
        )
        .with_policies(Some(30_000), false);
        let message = Message::incoming(&envelope, "x".into());

        assert_eq!(message.status, DeliveryStatus::Delivered);
        assert_eq!(message.expires_at(), Some(Timestamp::new(30_001)));
        assert!(!message.read);
        assert_eq!(message.counterparty(&bob()), &alice());
    }

    #[test]
    fn test_thread_ordering_breaks_ties_by_id() {
        let first = outgoing(SendOptions::default());
        let mut second = outgoing(SendOptions::default());
        second.timestamp = first.timestamp;
        let mut third = outgoing(SendOptions::default());
        third.timestamp = Timestamp::new(1);

        let mut views = vec![first.view(&alice()), second.view(&alice()), third.view(&alice())];
        sort_thread(&mut views);

        assert_eq!(views[0].id, third.id);
        assert!(views[1].id < views[2].id);
    }
}

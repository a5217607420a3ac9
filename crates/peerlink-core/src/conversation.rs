//! Conversation aggregation
//!
//! Conversations are never stored; they are derived from the message log on
//! demand, one per unordered participant pair.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::message::{Message, MessageView};
use crate::types::{Address, Timestamp};

/// Unordered participant pair, stored sorted so both sides produce the same key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationKey(Address, Address);

impl ConversationKey {
    pub fn new(a: &Address, b: &Address) -> Self {
        if a <= b {
            Self(a.clone(), b.clone())
        } else {
            Self(b.clone(), a.clone())
        }
    }

    pub fn participants(&self) -> (&Address, &Address) {
        (&self.0, &self.1)
    }
}

/// Summary of all messages exchanged with one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub key: ConversationKey,
    /// The other participant, from the viewer's side
    pub peer: Address,
    pub last_message: MessageView,
    pub message_count: usize,
    pub unread_count: usize,
}

impl Conversation {
    pub fn last_activity(&self) -> Timestamp {
        self.last_message.timestamp
    }
}

/// Group `messages` into conversations as seen by `viewer`, newest first
pub fn aggregate<'a, I>(messages: I, viewer: &Address) -> Vec<Conversation>
where
    I: IntoIterator<Item = &'a Message>,
{
    let mut grouped: HashMap<ConversationKey, Conversation> = HashMap::new();

    for message in messages {
        let key = ConversationKey::new(&message.sender, &message.receiver);
        let unread = usize::from(&message.receiver == viewer && !message.read);

        match grouped.get_mut(&key) {
            Some(conversation) => {
                conversation.message_count += 1;
                conversation.unread_count += unread;
                let newer = (message.timestamp, message.id)
                    > (conversation.last_message.timestamp, conversation.last_message.id);
                if newer {
                    conversation.last_message = message.view(viewer);
                }
            }
            None => {
                grouped.insert(
                    key.clone(),
                    Conversation {
                        key,
                        peer: message.counterparty(viewer).clone(),
                        last_message: message.view(viewer),
                        message_count: 1,
                        unread_count: unread,
                    },
                );
            }
        }
    }

    let mut conversations: Vec<Conversation> = grouped.into_values().collect();
    conversations.sort_by(|a, b| {
        b.last_activity()
            .cmp(&a.last_activity())
            .then_with(|| a.key.cmp(&b.key))
    });
    conversations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{RenderedContent, SendOptions};
    use crate::types::MessageId;

    fn message(from: &str, to: &str, text: &str, at: u64) -> Message {
        Message::outgoing(
            MessageId::new(),
            Address::new(from),
            Address::new(to),
            text.into(),
            false,
            SendOptions::default(),
            Timestamp::new(at),
        )
    }

    #[test]
    fn test_key_is_order_independent() {
        let a = Address::new("0xaaa");
        let b = Address::new("0xbbb");
        assert_eq!(ConversationKey::new(&a, &b), ConversationKey::new(&b, &a));
    }

    #[test]
    fn test_last_message_is_newest() {
        let me = "0xaaa";
        let messages = vec![
            message(me, "0xbbb", "first", 1_000),
            message("0xbbb", me, "second", 2_000),
            message(me, "0xccc", "other", 1_500),
        ];

        let conversations = aggregate(&messages, &Address::new(me));
        assert_eq!(conversations.len(), 2);

        let with_b = &conversations[0];
        assert_eq!(with_b.peer, Address::new("0xbbb"));
        assert_eq!(
            with_b.last_message.content,
            RenderedContent::Visible("second".into())
        );
        assert_eq!(with_b.message_count, 2);
        assert_eq!(with_b.unread_count, 0);

        assert_eq!(conversations[1].peer, Address::new("0xccc"));
    }

    #[test]
    fn test_unread_counts_incoming_only() {
        let me = Address::new("0xaaa");
        let mut incoming = message("0xbbb", "0xaaa", "ping", 10);
        incoming.read = false;
        let outgoing = message("0xaaa", "0xbbb", "pong", 20);

        let conversations = aggregate([&incoming, &outgoing], &me);
        assert_eq!(conversations[0].unread_count, 1);
    }

    #[test]
    fn test_empty_log() {
        assert!(aggregate(&Vec::<Message>::new(), &Address::new("0x1")).is_empty());
    }
}

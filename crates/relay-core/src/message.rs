//! Message types for Relay.

use std::sync::Arc;
use uuid::Uuid;

/// A unique message identifier.
pub type MessageId = Uuid;

/// A published message waiting in a topic queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// Opaque payload supplied by the publisher.
    pub content: String,
    /// Ordering key; lower values are delivered first.
    pub priority: i64,
    /// Enqueue counter used to keep equal priorities in FIFO order.
    pub sequence: u64,
}

impl Message {
    /// Create a new message with a fresh identifier.
    #[must_use]
    pub fn new(content: impl Into<String>, priority: i64, sequence: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
            priority,
            sequence,
        }
    }
}

/// A message handed to a subscriber's outbox.
///
/// One `Delivery` is allocated per dequeued message and shared between all
/// subscribers of the topic.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Topic the message was published to.
    pub topic: Arc<str>,
    /// The delivered message.
    pub message: Message,
}

impl Delivery {
    /// Create a new delivery.
    #[must_use]
    pub fn new(topic: Arc<str>, message: Message) -> Self {
        Self { topic, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = Message::new("hello", 3, 7);
        assert_eq!(msg.content, "hello");
        assert_eq!(msg.priority, 3);
        assert_eq!(msg.sequence, 7);
    }

    #[test]
    fn test_unique_message_ids() {
        let a = Message::new("a", 0, 0);
        let b = Message::new("a", 0, 0);
        assert_ne!(a.id, b.id);
    }
}

//! Internal message type routed by the hub.

use crate::id::{RoomId, UserId};
use roomcast_protocol::ChatMessage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A unique message identifier.
pub type MessageId = u64;

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    timestamp.wrapping_add(counter)
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A chat message inside the router.
///
/// `sender` and `room` always come from the session that received the
/// message, never from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// Authenticated sender.
    pub sender: UserId,
    /// Single recipient, or `None` for a room broadcast.
    pub recipient: Option<UserId>,
    /// Room the message is routed in.
    pub room: RoomId,
    /// Opaque body.
    pub content: String,
    /// Ingress time in milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Message {
    /// Create a broadcast message.
    #[must_use]
    pub fn new(sender: UserId, room: RoomId, content: impl Into<String>) -> Self {
        Self {
            id: generate_message_id(),
            sender,
            recipient: None,
            room,
            content: content.into(),
            timestamp: now_millis(),
        }
    }

    /// Address the message to a single user.
    #[must_use]
    pub fn with_recipient(mut self, recipient: UserId) -> Self {
        self.recipient = Some(recipient);
        self
    }

    /// Build a message from a decoded wire frame, stamping the session's
    /// identity over whatever the client claimed.
    #[must_use]
    pub fn from_wire(wire: ChatMessage, sender: &UserId, room: &RoomId) -> Self {
        let recipient = wire.recipient().map(UserId::from);
        Self {
            id: generate_message_id(),
            sender: sender.clone(),
            recipient,
            room: room.clone(),
            content: wire.content,
            timestamp: now_millis(),
        }
    }

    /// Convert to wire form for delivery.
    #[must_use]
    pub fn to_wire(&self) -> ChatMessage {
        ChatMessage {
            sender_id: self.sender.to_string(),
            recipient_id: self.recipient.as_ref().map(ToString::to_string),
            room_id: self.room.to_string(),
            content: self.content.clone(),
            timestamp: Some(self.timestamp),
        }
    }

    /// Whether the message goes to the whole room.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.recipient.is_none()
    }
}

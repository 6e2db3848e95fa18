//! The chat message as it appears on the wire.

use serde::{Deserialize, Serialize};

/// A chat message in wire form.
///
/// Inbound frames may omit `sender_id` and `room_id`; the server stamps both
/// from the session's authenticated identity before routing, so whatever a
/// client puts there is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// User that sent the message.
    #[serde(default)]
    pub sender_id: String,
    /// Single recipient; absent or empty means broadcast to the room.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    /// Room the message belongs to.
    #[serde(default)]
    pub room_id: String,
    /// Opaque message body.
    pub content: String,
    /// Server ingress time in milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl ChatMessage {
    /// Create a broadcast message.
    #[must_use]
    pub fn broadcast(
        sender_id: impl Into<String>,
        room_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            recipient_id: None,
            room_id: room_id.into(),
            content: content.into(),
            timestamp: None,
        }
    }

    /// Create a message addressed to a single user in the room.
    #[must_use]
    pub fn direct(
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        room_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            recipient_id: Some(recipient_id.into()),
            ..Self::broadcast(sender_id, room_id, content)
        }
    }

    /// The recipient, treating an empty string the same as no recipient.
    #[must_use]
    pub fn recipient(&self) -> Option<&str> {
        self.recipient_id.as_deref().filter(|r| !r.is_empty())
    }
}

//! Frame types exchanged over a connection.
//!
//! A frame is the unit a transport sends and receives. Chat messages ride in
//! `Text` (JSON) or `Binary` (MessagePack) frames; liveness pings and the
//! close handshake have their own frame types.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Text,
    Binary,
    Ping,
    Pong,
    Close,
}

/// A transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 payload, carries JSON-encoded messages.
    Text(String),
    /// Binary payload, carries MessagePack-encoded messages.
    Binary(Bytes),
    /// Liveness ping.
    Ping(Bytes),
    /// Liveness ping reply.
    Pong(Bytes),
    /// Close handshake.
    Close,
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Text(_) => FrameType::Text,
            Frame::Binary(_) => FrameType::Binary,
            Frame::Ping(_) => FrameType::Ping,
            Frame::Pong(_) => FrameType::Pong,
            Frame::Close => FrameType::Close,
        }
    }

    /// Create an empty ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping(Bytes::new())
    }

    /// Create a pong frame echoing the ping payload.
    #[must_use]
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Frame::Pong(payload.into())
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) | Frame::Ping(data) | Frame::Pong(data) => data.len(),
            Frame::Close => 0,
        }
    }

    /// Whether the frame carries no payload.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this frame is a liveness ping or its reply.
    #[must_use]
    pub fn is_liveness(&self) -> bool {
        matches!(self, Frame::Ping(_) | Frame::Pong(_))
    }
}

/// Encoding used for messages written to a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// JSON in text frames.
    #[default]
    Json,
    /// MessagePack in binary frames.
    #[serde(alias = "messagepack")]
    Msgpack,
}

impl WireFormat {
    /// Parse a format name as given in a query string.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "json" => Some(WireFormat::Json),
            "msgpack" | "messagepack" => Some(WireFormat::Msgpack),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type() {
        assert_eq!(Frame::Text("{}".into()).frame_type(), FrameType::Text);
        assert_eq!(Frame::ping().frame_type(), FrameType::Ping);
        assert_eq!(Frame::Close.frame_type(), FrameType::Close);
    }

    #[test]
    fn test_liveness_frames() {
        assert!(Frame::ping().is_liveness());
        assert!(Frame::pong(Bytes::from_static(b"x")).is_liveness());
        assert!(!Frame::Binary(Bytes::new()).is_liveness());
        assert!(Frame::Close.is_empty());
    }

    #[test]
    fn test_wire_format_from_name() {
        assert_eq!(WireFormat::from_name("JSON"), Some(WireFormat::Json));
        assert_eq!(WireFormat::from_name("msgpack"), Some(WireFormat::Msgpack));
        assert_eq!(WireFormat::from_name("xml"), None);
    }
}

//! Codec for chat messages.
//!
//! Text frames carry JSON, binary frames carry MessagePack. Several messages
//! may share one frame: JSON messages are separated by `\n`, MessagePack
//! values are simply concatenated since each value is self-delimiting.

use std::io::Cursor;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::{Frame, WireFormat};
use crate::message::ChatMessage;

/// Default maximum inbound frame size in bytes.
pub const MAX_MESSAGE_SIZE: usize = 512;

/// Separator between JSON messages coalesced into one text frame.
const JSON_SEPARATOR: u8 = b'\n';

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds the maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

impl ProtocolError {
    /// Whether the error should end the session rather than drop one frame.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::FrameTooLarge { .. })
    }
}

/// Decode a single inbound chat message.
///
/// Returns `Ok(None)` for frames that are not chat messages (liveness pings
/// and close). Text frames are parsed as JSON and binary frames as
/// MessagePack, independent of the connection's outbound format.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] if the payload exceeds
/// `max_size`, or a decode error if the payload is malformed.
pub fn decode(frame: &Frame, max_size: usize) -> Result<Option<ChatMessage>, ProtocolError> {
    if frame.len() > max_size {
        return Err(ProtocolError::FrameTooLarge {
            size: frame.len(),
            max: max_size,
        });
    }

    match frame {
        Frame::Text(text) => Ok(Some(serde_json::from_str(text)?)),
        Frame::Binary(data) => Ok(Some(rmp_serde::from_slice(data)?)),
        Frame::Ping(_) | Frame::Pong(_) | Frame::Close => Ok(None),
    }
}

/// Encode one or more messages into a single frame.
///
/// # Errors
///
/// Returns an error if `messages` is empty or serialization fails.
pub fn encode_batch(format: WireFormat, messages: &[ChatMessage]) -> Result<Frame, ProtocolError> {
    if messages.is_empty() {
        return Err(ProtocolError::Invalid("empty batch".into()));
    }

    match format {
        WireFormat::Json => {
            let mut buf = Vec::with_capacity(messages.len() * 96);
            for (i, message) in messages.iter().enumerate() {
                if i > 0 {
                    buf.push(JSON_SEPARATOR);
                }
                serde_json::to_writer(&mut buf, message)?;
            }
            let text = String::from_utf8(buf).map_err(|e| ProtocolError::Invalid(e.to_string()))?;
            Ok(Frame::Text(text))
        }
        WireFormat::Msgpack => {
            let mut buf = BytesMut::with_capacity(messages.len() * 64);
            for message in messages {
                buf.put_slice(&rmp_serde::to_vec_named(message)?);
            }
            Ok(Frame::Binary(buf.freeze()))
        }
    }
}

/// Decode every message in a frame produced by [`encode_batch`].
///
/// Liveness and close frames decode to an empty list.
///
/// # Errors
///
/// Returns an error if any message in the frame is malformed.
pub fn decode_batch(frame: &Frame) -> Result<Vec<ChatMessage>, ProtocolError> {
    match frame {
        Frame::Text(text) => text
            .split(JSON_SEPARATOR as char)
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(ProtocolError::from))
            .collect(),
        Frame::Binary(data) => decode_msgpack_stream(data),
        Frame::Ping(_) | Frame::Pong(_) | Frame::Close => Ok(Vec::new()),
    }
}

fn decode_msgpack_stream(data: &Bytes) -> Result<Vec<ChatMessage>, ProtocolError> {
    let mut cursor = Cursor::new(data.as_ref());
    let mut messages = Vec::new();
    while (cursor.position() as usize) < data.len() {
        messages.push(rmp_serde::from_read(&mut cursor)?);
    }
    Ok(messages)
}

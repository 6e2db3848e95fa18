//! # roomcast-protocol
//!
//! Wire definitions for the Roomcast chat router.
//!
//! A connection carries two kinds of traffic:
//!
//! - **Chat messages** - `{sender_id, recipient_id?, room_id, content}` encoded
//!   as JSON in text frames or MessagePack in binary frames
//! - **Liveness pings** - ping/pong frames outside the message schema
//!
//! ## Example
//!
//! ```rust
//! use roomcast_protocol::{codec, ChatMessage, WireFormat};
//!
//! let message = ChatMessage::broadcast("alice", "lobby", "hello");
//!
//! let frame = codec::encode_batch(WireFormat::Json, &[message.clone()]).unwrap();
//! let decoded = codec::decode(&frame, 512).unwrap();
//! assert_eq!(decoded, Some(message));
//! ```

pub mod codec;
pub mod frames;
pub mod message;

pub use codec::{decode, decode_batch, encode_batch, ProtocolError, MAX_MESSAGE_SIZE};
pub use frames::{Frame, FrameType, WireFormat};
pub use message::ChatMessage;

//! Connection adapter traits for Roomcast.
//!
//! A connection is split into an outbound [`FrameSink`] and an inbound
//! [`FrameStream`] so the two halves can be driven by independent tasks
//! without sharing a lock.

use async_trait::async_trait;
use roomcast_protocol::Frame;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let n = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}", n))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// The inbound half of a connection.
#[async_trait]
pub trait FrameStream: Send {
    /// Receive the next frame.
    ///
    /// Returns `Ok(None)` if the connection was closed cleanly.
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;
}

/// The outbound half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Send a frame. Sending [`Frame::Close`] performs the close handshake.
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Close the connection. Closing an already closed sink is a no-op.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Check if the sink can still send.
    fn is_open(&self) -> bool;
}

/// A physical duplex connection handed over by the transport layer.
pub trait Connection: Send {
    /// Get the connection's unique identifier.
    fn id(&self) -> &ConnectionId;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Split into independently owned outbound and inbound halves.
    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameStream>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_connection_id_from_string() {
        let id: ConnectionId = "test-id".into();
        assert_eq!(id.as_str(), "test-id");
        assert_eq!(id.to_string(), "test-id");
    }

    #[test]
    fn test_transport_error_messages() {
        assert_eq!(TransportError::ConnectionClosed.to_string(), "Connection closed");
        assert_eq!(
            TransportError::SendFailed("peer dropped".into()).to_string(),
            "Send failed: peer dropped"
        );
        assert_eq!(
            TransportError::ReceiveFailed("reset".into()).to_string(),
            "Receive failed: reset"
        );
    }
}

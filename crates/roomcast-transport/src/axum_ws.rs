//! Adapter for WebSockets upgraded through axum.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use roomcast_protocol::Frame;
use tracing::{debug, warn};

use crate::traits::{Connection, ConnectionId, FrameSink, FrameStream, TransportError};

/// A WebSocket accepted by an axum `WebSocketUpgrade`.
pub struct AxumConnection {
    id: ConnectionId,
    socket: WebSocket,
    remote_addr: Option<String>,
}

impl AxumConnection {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(socket: WebSocket) -> Self {
        Self {
            id: ConnectionId::generate(),
            socket,
            remote_addr: None,
        }
    }

    /// Record the peer address for logging.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }
}

impl Connection for AxumConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameStream>) {
        let (sink, stream) = self.socket.split();
        (
            Box::new(AxumSink {
                id: self.id.clone(),
                sink,
                open: true,
            }),
            Box::new(AxumFrames {
                id: self.id,
                stream,
            }),
        )
    }
}

struct AxumSink {
    id: ConnectionId,
    sink: SplitSink<WebSocket, Message>,
    open: bool,
}

#[async_trait]
impl FrameSink for AxumSink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::ConnectionClosed);
        }

        let message = match frame {
            Frame::Close => return self.close().await,
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data.to_vec()),
            Frame::Ping(data) => Message::Ping(data.to_vec()),
            Frame::Pong(data) => Message::Pong(data.to_vec()),
        };

        if let Err(e) = self.sink.send(message).await {
            self.open = false;
            return Err(TransportError::SendFailed(e.to_string()));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !std::mem::replace(&mut self.open, false) {
            return Ok(());
        }

        debug!(connection = %self.id, "Closing WebSocket");
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

struct AxumFrames {
    id: ConnectionId,
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameStream for AxumFrames {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        match self.stream.next().await {
            Some(Ok(Message::Text(text))) => Ok(Some(Frame::Text(text))),
            Some(Ok(Message::Binary(data))) => Ok(Some(Frame::Binary(Bytes::from(data)))),
            Some(Ok(Message::Ping(data))) => Ok(Some(Frame::Ping(Bytes::from(data)))),
            Some(Ok(Message::Pong(data))) => Ok(Some(Frame::Pong(Bytes::from(data)))),
            Some(Ok(Message::Close(_))) => {
                debug!(connection = %self.id, "Received close frame");
                Ok(None)
            }
            Some(Err(e)) => {
                warn!(connection = %self.id, error = %e, "WebSocket error");
                Err(TransportError::ReceiveFailed(e.to_string()))
            }
            None => {
                debug!(connection = %self.id, "WebSocket stream ended");
                Ok(None)
            }
        }
    }
}

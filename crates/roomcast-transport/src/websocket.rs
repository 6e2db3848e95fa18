//! WebSocket adapter over tokio-tungstenite.
//!
//! Wraps any established [`WebSocketStream`], client or server side.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use roomcast_protocol::Frame;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{
    tungstenite::{Error as WsError, Message},
    WebSocketStream,
};
use tracing::{debug, warn};

use crate::traits::{Connection, ConnectionId, FrameSink, FrameStream, TransportError};

/// A tokio-tungstenite WebSocket connection.
pub struct WebSocketConnection<S> {
    id: ConnectionId,
    stream: WebSocketStream<S>,
    remote_addr: Option<String>,
}

impl<S> WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an established WebSocket stream.
    #[must_use]
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self {
            id: ConnectionId::generate(),
            stream,
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

impl<S> Connection for WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameStream>) {
        let (sink, stream) = self.stream.split();
        let sink = WebSocketSink {
            id: self.id.clone(),
            sink,
            open: true,
        };
        let stream = WebSocketFrames { id: self.id, stream };
        (Box::new(sink), Box::new(stream))
    }
}

/// Outbound half of a [`WebSocketConnection`].
pub struct WebSocketSink<S> {
    id: ConnectionId,
    sink: SplitSink<WebSocketStream<S>, Message>,
    open: bool,
}

#[async_trait]
impl<S> FrameSink for WebSocketSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
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
        match self.sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::Other(format!("Failed to close: {}", e))),
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// Inbound half of a [`WebSocketConnection`].
pub struct WebSocketFrames<S> {
    id: ConnectionId,
    stream: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> FrameStream for WebSocketFrames<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(Frame::Text(text))),
                Some(Ok(Message::Binary(data))) => return Ok(Some(Frame::Binary(Bytes::from(data)))),
                Some(Ok(Message::Ping(data))) => return Ok(Some(Frame::Ping(Bytes::from(data)))),
                Some(Ok(Message::Pong(data))) => return Ok(Some(Frame::Pong(Bytes::from(data)))),
                Some(Ok(Message::Close(_))) => {
                    debug!(connection = %self.id, "Received close frame");
                    return Ok(None);
                }
                Some(Ok(Message::Frame(_))) => {
                    // Raw frame, ignore
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    debug!(connection = %self.id, "WebSocket stream ended");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    warn!(connection = %self.id, error = %e, "WebSocket error");
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }
}

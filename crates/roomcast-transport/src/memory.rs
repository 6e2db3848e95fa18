//! In-process connection backed by channels.
//!
//! [`MemoryConnection`] is the server side handed to a session;
//! [`MemoryPeer`] plays the remote client. Closing either side ends the
//! other side's receive, like a dropped socket would.

use async_trait::async_trait;
use roomcast_protocol::Frame;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::traits::{Connection, ConnectionId, FrameSink, FrameStream, TransportError};

/// Default number of frames buffered in each direction.
pub const DEFAULT_BUFFER: usize = 1024;

type Inbound = Result<Frame, TransportError>;

#[derive(Debug)]
struct Shared {
    closed: watch::Sender<bool>,
    server_closes: AtomicUsize,
}

impl Shared {
    /// Mark the link closed, returning `true` on the first transition.
    fn close(&self) -> bool {
        !self.closed.send_replace(true)
    }
}

/// Create a connected server/peer pair.
#[must_use]
pub fn pair() -> (MemoryConnection, MemoryPeer) {
    pair_with_buffer(DEFAULT_BUFFER)
}

/// Create a connected pair whose server-to-peer direction holds at most
/// `buffer` unread frames; further sends wait for the peer to read.
#[must_use]
pub fn pair_with_buffer(buffer: usize) -> (MemoryConnection, MemoryPeer) {
    let (to_peer, peer_rx) = mpsc::channel(buffer.max(1));
    let (peer_tx, from_peer) = mpsc::channel(DEFAULT_BUFFER);
    let (closed, _) = watch::channel(false);
    let shared = Arc::new(Shared {
        closed,
        server_closes: AtomicUsize::new(0),
    });

    let conn = MemoryConnection {
        id: ConnectionId::generate(),
        to_peer,
        from_peer,
        shared: Arc::clone(&shared),
    };
    let peer = MemoryPeer {
        tx: peer_tx,
        rx: peer_rx,
        shared,
    };
    (conn, peer)
}

/// Server side of an in-memory link.
pub struct MemoryConnection {
    id: ConnectionId,
    to_peer: mpsc::Sender<Frame>,
    from_peer: mpsc::Receiver<Inbound>,
    shared: Arc<Shared>,
}

impl Connection for MemoryConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameStream>) {
        let sink = MemorySink {
            id: self.id.clone(),
            tx: Some(self.to_peer),
            shared: Arc::clone(&self.shared),
        };
        let stream = MemoryFrames {
            rx: self.from_peer,
            closed: self.shared.closed.subscribe(),
        };
        (Box::new(sink), Box::new(stream))
    }
}

struct MemorySink {
    id: ConnectionId,
    tx: Option<mpsc::Sender<Frame>>,
    shared: Arc<Shared>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if matches!(frame, Frame::Close) {
            if let Some(tx) = &self.tx {
                // Best effort: a peer that stopped reading still gets closed.
                let _ = tx.try_send(Frame::Close);
            }
            return self.close().await;
        }

        let closed = *self.shared.closed.borrow();
        let tx = match &self.tx {
            Some(tx) if !closed => tx,
            _ => return Err(TransportError::ConnectionClosed),
        };
        tx.send(frame)
            .await
            .map_err(|_| TransportError::SendFailed("peer dropped".into()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.tx.take().is_some() {
            self.shared.server_closes.fetch_add(1, Ordering::SeqCst);
            self.shared.close();
            debug!(connection = %self.id, "Memory connection closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.tx.is_some() && !*self.shared.closed.borrow()
    }
}

struct MemoryFrames {
    rx: mpsc::Receiver<Inbound>,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl FrameStream for MemoryFrames {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        tokio::select! {
            biased;
            () = wait_closed(&mut self.closed) => Ok(None),
            item = self.rx.recv() => match item {
                Some(Ok(frame)) => Ok(Some(frame)),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            },
        }
    }
}

/// Remote end of an in-memory link.
pub struct MemoryPeer {
    tx: mpsc::Sender<Inbound>,
    rx: mpsc::Receiver<Frame>,
    shared: Arc<Shared>,
}

impl MemoryPeer {
    /// Send a frame to the server side.
    ///
    /// # Errors
    ///
    /// Returns an error if the link is closed.
    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        self.tx
            .send(Ok(frame))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Send a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the link is closed.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.send(Frame::Text(text.into())).await
    }

    /// Make the server side's next receive fail with a transport error.
    ///
    /// # Errors
    ///
    /// Returns an error if the server side is gone.
    pub async fn fail(&self, reason: impl Into<String>) -> Result<(), TransportError> {
        self.tx
            .send(Err(TransportError::ReceiveFailed(reason.into())))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Receive the next frame written by the server side.
    ///
    /// Returns `None` once the server side has closed and every buffered
    /// frame has been read.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Receive a frame if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    /// Close the link from the peer side.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Whether either side has closed the link.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// How many times the server side performed a close.
    #[must_use]
    pub fn server_close_count(&self) -> usize {
        self.shared.server_closes.load(Ordering::SeqCst)
    }

    /// Wait until the link is closed.
    pub async fn closed(&self) {
        wait_closed(&mut self.shared.closed.subscribe()).await;
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    loop {
        let is_closed = *closed.borrow_and_update();
        if is_closed || closed.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (conn, mut peer) = pair();
        let (mut sink, mut stream) = Box::new(conn).split();

        peer.send_text("hi").await.unwrap();
        assert_eq!(stream.recv().await.unwrap(), Some(Frame::Text("hi".into())));

        sink.send(Frame::ping()).await.unwrap();
        assert_eq!(peer.recv().await, Some(Frame::ping()));
    }

    #[tokio::test]
    async fn test_server_close_ends_both_directions() {
        let (conn, mut peer) = pair();
        let (mut sink, mut stream) = Box::new(conn).split();

        sink.send(Frame::Close).await.unwrap();
        sink.close().await.unwrap();

        assert!(peer.is_closed());
        assert_eq!(peer.server_close_count(), 1);
        assert_eq!(peer.recv().await, Some(Frame::Close));
        assert_eq!(peer.recv().await, None);
        assert_eq!(stream.recv().await.unwrap(), None);
        assert!(!sink.is_open());
    }

    #[tokio::test]
    async fn test_peer_close_ends_server_recv() {
        let (conn, peer) = pair();
        let (mut sink, mut stream) = Box::new(conn).split();

        peer.close();
        assert_eq!(stream.recv().await.unwrap(), None);
        assert!(matches!(
            sink.send(Frame::ping()).await,
            Err(TransportError::ConnectionClosed)
        ));
        assert_eq!(peer.server_close_count(), 0);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let (conn, peer) = pair();
        let (_sink, mut stream) = Box::new(conn).split();

        peer.fail("reset by peer").await.unwrap();
        assert!(matches!(
            stream.recv().await,
            Err(TransportError::ReceiveFailed(_))
        ));
    }
}

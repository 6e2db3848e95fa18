//! # roomcast-transport
//!
//! Connection adapters for the Roomcast chat router.
//!
//! The router never sees sockets directly. It is handed a [`Connection`],
//! splits it into a [`FrameSink`] and a [`FrameStream`], and drives each half
//! from its own task:
//!
//! - **axum** - sockets accepted through `WebSocketUpgrade` (server side)
//! - **WebSocket** - any tokio-tungstenite `WebSocketStream`
//! - **Memory** - channel-backed pairs for tests and benchmarks
//!
//! ```rust,ignore
//! use roomcast_transport::{Connection, FrameStream};
//!
//! async fn drain(conn: Box<dyn Connection>) {
//!     let (_sink, mut stream) = conn.split();
//!     while let Ok(Some(frame)) = stream.recv().await {
//!         // Process frame
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "axum")]
pub mod axum_ws;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{MemoryConnection, MemoryPeer};
pub use traits::{Connection, ConnectionId, FrameSink, FrameStream, TransportError};

#[cfg(feature = "axum")]
pub use axum_ws::AxumConnection;

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnection;

//! # roomcast-core
//!
//! Room-scoped message routing for Roomcast.
//!
//! - **Hub** - single task owning the registry of live sessions
//! - **Registry** - room -> user -> session map and its routing rules
//! - **ClientSession** - the inbound and outbound pumps of one connection
//! - **Gate** - room membership check performed before registration
//!
//! ## Architecture
//!
//! ```text
//!                 register / unregister / route
//! ┌───────────────┐          ┌─────────────┐
//! │ InboundPump   │─────────▶│     Hub     │
//! └───────────────┘          └─────────────┘
//!         ▲                         │ try_send
//!         │ frames                  ▼
//! ┌───────────────┐  frames  ┌─────────────┐
//! │  Connection   │◀─────────│ OutboundPump│◀── mailbox
//! └───────────────┘          └─────────────┘
//! ```

pub mod gate;
pub mod hub;
pub mod id;
pub mod message;
pub mod metrics;
pub mod registry;
pub mod session;

pub use gate::{admit, Admission, AdmissionError, GateError, RoomGate, StaticGate};
pub use hub::{Hub, HubConfig, HubError, HubHandle, HubStats};
pub use id::{IdError, RoomId, SessionId, SessionKey, UserId};
pub use message::Message;
pub use registry::{EvictReason, Registry, RouteOutcome, SessionHandle};
pub use session::{ClientSession, SessionConfig, SessionError, SessionOutcome, SessionTasks};

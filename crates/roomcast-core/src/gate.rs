//! Room authorization gate.
//!
//! Before a connection may join a room the gate is asked whether the user
//! belongs to it. A positive answer is captured in an [`Admission`], which is
//! the only way to obtain the right to register a session with the hub.

use crate::id::{RoomId, UserId};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::debug;

/// Failure while consulting a gate.
#[derive(Debug, Error)]
#[error("Gate failure: {0}")]
pub struct GateError(pub String);

impl GateError {
    /// Create a gate error.
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Admission errors.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// The user is not a member of the room.
    #[error("User {user} is not a member of room {room}")]
    NotMember {
        /// Requested room.
        room: RoomId,
        /// Requesting user.
        user: UserId,
    },

    /// The gate could not answer.
    #[error(transparent)]
    Gate(#[from] GateError),
}

/// Decides room membership.
#[async_trait]
pub trait RoomGate: Send + Sync {
    /// Whether `user` may join `room`.
    async fn is_member(&self, room: &RoomId, user: &UserId) -> Result<bool, GateError>;
}

/// Proof that a gate admitted a user into a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    room: RoomId,
    user: UserId,
}

impl Admission {
    /// Admitted room.
    #[must_use]
    pub fn room(&self) -> &RoomId {
        &self.room
    }

    /// Admitted user.
    #[must_use]
    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub(crate) fn into_parts(self) -> (RoomId, UserId) {
        (self.room, self.user)
    }
}

/// Ask `gate` whether `user` may join `room`.
///
/// # Errors
///
/// Returns [`AdmissionError::NotMember`] on a negative answer and
/// [`AdmissionError::Gate`] if the gate fails.
pub async fn admit<G>(gate: &G, room: RoomId, user: UserId) -> Result<Admission, AdmissionError>
where
    G: RoomGate + ?Sized,
{
    if gate.is_member(&room, &user).await? {
        debug!(room = %room, user = %user, "Admitted");
        Ok(Admission { room, user })
    } else {
        debug!(room = %room, user = %user, "Admission refused");
        Err(AdmissionError::NotMember { room, user })
    }
}

/// A gate backed by fixed membership lists.
#[derive(Debug, Clone, Default)]
pub struct StaticGate {
    rooms: HashMap<RoomId, HashSet<UserId>>,
    open: bool,
}

impl StaticGate {
    /// Create a gate that admits nobody.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a gate that admits everybody everywhere.
    #[must_use]
    pub fn open() -> Self {
        Self {
            rooms: HashMap::new(),
            open: true,
        }
    }

    /// Add a room with its members.
    #[must_use]
    pub fn with_room<I, U>(mut self, room: impl Into<RoomId>, members: I) -> Self
    where
        I: IntoIterator<Item = U>,
        U: Into<UserId>,
    {
        self.rooms
            .entry(room.into())
            .or_default()
            .extend(members.into_iter().map(Into::into));
        self
    }

    /// Number of configured rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[async_trait]
impl RoomGate for StaticGate {
    async fn is_member(&self, room: &RoomId, user: &UserId) -> Result<bool, GateError> {
        if self.open {
            return Ok(true);
        }
        Ok(self
            .rooms
            .get(room)
            .is_some_and(|members| members.contains(user)))
    }
}

//! Room, user and session identifiers.
//!
//! Room and user ids are opaque strings. They are validated for shape only;
//! whether a room exists or a user belongs to it is the gate's business.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Maximum id length in bytes.
pub const MAX_ID_LENGTH: usize = 256;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Identifier validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    /// Invalid room id.
    #[error("Invalid room id: {0}")]
    Room(&'static str),

    /// Invalid user id.
    #[error("Invalid user id: {0}")]
    User(&'static str),
}

/// Validate an id string.
///
/// # Errors
///
/// Returns an error message if the id is invalid.
pub fn validate_id(value: &str) -> Result<(), &'static str> {
    if value.is_empty() {
        return Err("cannot be empty");
    }
    if value.len() > MAX_ID_LENGTH {
        return Err("too long");
    }
    if value.starts_with('$') {
        return Err("ids starting with '$' are reserved");
    }
    if !value.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("contains invalid characters");
    }
    Ok(())
}

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident, $err:path) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a string without validation.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Validate and wrap a string.
            ///
            /// # Errors
            ///
            /// Returns an error if the id is empty, too long or not printable ASCII.
            pub fn parse(id: impl Into<String>) -> Result<Self, IdError> {
                let id = id.into();
                validate_id(&id).map_err($err)?;
                Ok(Self(id))
            }

            /// Get the id as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

opaque_id!(
    /// Identifies a room. Used purely as a partition key.
    RoomId,
    IdError::Room
);

opaque_id!(
    /// Identifies an authenticated user.
    UserId,
    IdError::User
);

/// Process-unique identifier of one admitted connection.
///
/// Two sessions of the same user in the same room always differ here, which
/// is how the hub tells a stale unregister from a current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate the next session id.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw value.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// The registry key of a session: which room, which user, which connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// Session identity.
    pub id: SessionId,
    /// Authenticated user.
    pub user: UserId,
    /// Room the session is bound to for its lifetime.
    pub room: RoomId,
}

impl SessionKey {
    /// Create a key with a freshly allocated session id.
    #[must_use]
    pub fn new(room: RoomId, user: UserId) -> Self {
        Self {
            id: SessionId::next(),
            user,
            room,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.user, self.room, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_validation() {
        assert!(RoomId::parse("3f2b6c1e-room").is_ok());
        assert_eq!(RoomId::parse(""), Err(IdError::Room("cannot be empty")));
        assert!(UserId::parse("$admin").is_err());
        assert!(UserId::parse("tab\tuser").is_err());

        let long = "a".repeat(MAX_ID_LENGTH + 1);
        assert!(matches!(UserId::parse(long), Err(IdError::User(_))));
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionKey::new("r".into(), "u".into());
        let b = SessionKey::new("r".into(), "u".into());
        assert_ne!(a.id, b.id);
        assert_ne!(a, b);
    }

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let json = serde_json::to_string(&UserId::new("alice")).unwrap();
        assert_eq!(json, "\"alice\"");
    }
}

//! The room registry and its routing rules.
//!
//! [`Registry`] is plain synchronous state. It is owned by the hub task and
//! never shared, so none of its operations lock or wait.

use crate::id::{RoomId, SessionId, SessionKey, UserId};
use crate::message::Message;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Sending half of a session's mailbox.
pub type MailboxSender = mpsc::Sender<Arc<Message>>;

/// Receiving half of a session's mailbox.
pub type MailboxReceiver = mpsc::Receiver<Arc<Message>>;

/// Create a bounded mailbox.
#[must_use]
pub fn mailbox(capacity: usize) -> (MailboxSender, MailboxReceiver) {
    mpsc::channel(capacity.max(1))
}

/// The hub's reference to a live session.
///
/// Dropping the handle closes the session's mailbox and fires its retire
/// signal, which is how the hub tells the session's outbound pump to stop.
#[derive(Debug)]
pub struct SessionHandle {
    key: SessionKey,
    mailbox: MailboxSender,
    _retire: Option<oneshot::Sender<()>>,
}

impl SessionHandle {
    /// Create a handle from a key and the sending half of its mailbox.
    #[must_use]
    pub fn new(key: SessionKey, mailbox: MailboxSender) -> Self {
        Self {
            key,
            mailbox,
            _retire: None,
        }
    }

    /// Attach a signal whose receiver resolves as soon as this handle is
    /// dropped, without waiting for the mailbox backlog to drain.
    #[must_use]
    pub fn with_retire_signal(mut self, retire: oneshot::Sender<()>) -> Self {
        self._retire = Some(retire);
        self
    }

    /// The session's registry key.
    #[must_use]
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Number of messages queued and not yet taken by the outbound pump.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.mailbox.max_capacity() - self.mailbox.capacity()
    }
}

/// Why a session was dropped during routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    /// The mailbox was at capacity.
    MailboxFull,
    /// The outbound pump had already gone away.
    MailboxClosed,
}

impl EvictReason {
    /// Label for logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EvictReason::MailboxFull => "mailbox_full",
            EvictReason::MailboxClosed => "mailbox_closed",
        }
    }
}

/// A session removed from the registry while routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    /// The evicted session.
    pub key: SessionKey,
    /// Why it was evicted.
    pub reason: EvictReason,
}

/// Result of routing one message.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RouteOutcome {
    /// Mailboxes the message was enqueued on.
    pub delivered: usize,
    /// Sessions evicted while fanning out.
    pub evicted: Vec<Eviction>,
    /// A directed message's recipient was not registered in the room.
    pub recipient_missing: bool,
}

/// Room-scoped registry: room -> user -> session.
///
/// A user holds at most one session per room.
#[derive(Debug)]
pub struct Registry {
    rooms: HashMap<RoomId, HashMap<UserId, SessionHandle>>,
    auto_delete_empty_rooms: bool,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(auto_delete_empty_rooms: bool) -> Self {
        Self {
            rooms: HashMap::new(),
            auto_delete_empty_rooms,
        }
    }

    /// Insert a session, returning the session it replaced, if any.
    ///
    /// The returned handle should be dropped to retire the old session.
    pub fn register(&mut self, handle: SessionHandle) -> Option<SessionHandle> {
        let key = handle.key.clone();
        let room = self.rooms.entry(key.room.clone()).or_insert_with(|| {
            debug!(room = %key.room, "Creating room");
            HashMap::new()
        });
        let previous = room.insert(key.user.clone(), handle);

        debug!(
            room = %key.room,
            user = %key.user,
            session = %key.id,
            replaced = previous.is_some(),
            members = room.len(),
            "Registered session"
        );
        previous
    }

    /// Remove a session if it is still the one registered for its room and
    /// user. Returns the removed handle.
    pub fn unregister(&mut self, key: &SessionKey) -> Option<SessionHandle> {
        let room = self.rooms.get_mut(&key.room)?;
        if room.get(&key.user).map(|h| h.key.id) != Some(key.id) {
            trace!(session = %key, "Stale unregister ignored");
            return None;
        }

        let removed = room.remove(&key.user);
        debug!(
            room = %key.room,
            user = %key.user,
            session = %key.id,
            members = room.len(),
            "Unregistered session"
        );
        self.prune(&key.room);
        removed
    }

    /// Fan a message out to its audience with non-blocking enqueues.
    ///
    /// A session whose mailbox is full or closed is removed on the spot and
    /// fan-out continues with the remaining recipients.
    pub fn route(&mut self, message: &Arc<Message>) -> RouteOutcome {
        let mut outcome = RouteOutcome::default();
        let Some(room) = self.rooms.get_mut(&message.room) else {
            outcome.recipient_missing = message.recipient.is_some();
            return outcome;
        };

        match &message.recipient {
            Some(recipient) => match room.get(recipient) {
                Some(handle) => match offer(handle, message) {
                    Ok(()) => outcome.delivered = 1,
                    Err(reason) => {
                        if let Some(handle) = room.remove(recipient) {
                            outcome.evicted.push(Eviction {
                                key: handle.key,
                                reason,
                            });
                        }
                    }
                },
                None => outcome.recipient_missing = true,
            },
            None => room.retain(|_, handle| match offer(handle, message) {
                Ok(()) => {
                    outcome.delivered += 1;
                    true
                }
                Err(reason) => {
                    outcome.evicted.push(Eviction {
                        key: handle.key.clone(),
                        reason,
                    });
                    false
                }
            }),
        }

        if !outcome.evicted.is_empty() {
            let room_id = message.room.clone();
            self.prune(&room_id);
        }
        outcome
    }

    /// The session id registered for a user in a room.
    #[must_use]
    pub fn session_of(&self, room: &RoomId, user: &UserId) -> Option<SessionId> {
        self.rooms.get(room)?.get(user).map(|h| h.key.id)
    }

    /// Users registered in a room with their session ids, sorted by user.
    #[must_use]
    pub fn members(&self, room: &RoomId) -> Vec<(UserId, SessionId)> {
        let mut members: Vec<_> = self
            .rooms
            .get(room)
            .map(|r| r.iter().map(|(u, h)| (u.clone(), h.key.id)).collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Number of rooms with an entry.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Number of registered sessions across all rooms.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.rooms.values().map(HashMap::len).sum()
    }

    fn prune(&mut self, room: &RoomId) {
        if self.auto_delete_empty_rooms && self.rooms.get(room).is_some_and(HashMap::is_empty) {
            self.rooms.remove(room);
            debug!(room = %room, "Deleted empty room");
        }
    }
}

fn offer(handle: &SessionHandle, message: &Arc<Message>) -> Result<(), EvictReason> {
    match handle.mailbox.try_send(Arc::clone(message)) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) => Err(EvictReason::MailboxFull),
        Err(TrySendError::Closed(_)) => Err(EvictReason::MailboxClosed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(room: &str, user: &str, capacity: usize) -> (SessionHandle, MailboxReceiver) {
        let (tx, rx) = mailbox(capacity);
        let key = SessionKey::new(room.into(), user.into());
        (SessionHandle::new(key, tx), rx)
    }

    fn broadcast(room: &str, from: &str) -> Arc<Message> {
        Arc::new(Message::new(from.into(), room.into(), "hello"))
    }

    #[test]
    fn test_second_registration_replaces_first() {
        let mut registry = Registry::new(true);
        let (first, mut first_rx) = session("r", "alice", 4);
        let (second, _second_rx) = session("r", "alice", 4);
        let (bob, _bob_rx) = session("r", "bob", 4);
        let first_id = first.key().id;
        let second_id = second.key().id;

        assert!(registry.register(first).is_none());
        registry.register(bob);
        let replaced = registry.register(second).unwrap();
        assert_eq!(replaced.key().id, first_id);
        drop(replaced);

        // The retired session sees its mailbox closed.
        assert!(matches!(
            first_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert_eq!(registry.session_of(&"r".into(), &"alice".into()), Some(second_id));
        assert_eq!(registry.members(&"r".into()).len(), 2);
    }

    #[test]
    fn test_uniqueness_over_many_registrations() {
        let mut registry = Registry::new(true);
        let mut receivers = Vec::new();
        for round in 0..5 {
            for user in ["a", "b", "c"] {
                let (handle, rx) = session("r", user, 1);
                receivers.push(rx);
                let replaced = registry.register(handle);
                assert_eq!(replaced.is_some(), round > 0);
            }
        }
        assert_eq!(registry.session_count(), 3);
        let users: Vec<_> = registry
            .members(&"r".into())
            .into_iter()
            .map(|(u, _)| u)
            .collect();
        assert_eq!(users, vec![UserId::new("a"), UserId::new("b"), UserId::new("c")]);
    }

    #[test]
    fn test_stale_unregister_is_ignored() {
        let mut registry = Registry::new(true);
        let (old, _old_rx) = session("r", "alice", 4);
        let old_key = old.key().clone();
        let (new, mut new_rx) = session("r", "alice", 4);
        let new_key = new.key().clone();

        registry.register(old);
        registry.register(new);

        assert!(registry.unregister(&old_key).is_none());
        assert_eq!(registry.session_of(&"r".into(), &"alice".into()), Some(new_key.id));

        let removed = registry.unregister(&new_key).unwrap();
        drop(removed);
        assert!(registry.unregister(&new_key).is_none());
        assert!(matches!(
            new_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn test_broadcast_reaches_every_member_of_the_room_only() {
        let mut registry = Registry::new(true);
        let mut in_room = Vec::new();
        for user in ["a", "b", "c", "d"] {
            let (handle, rx) = session("r1", user, 4);
            registry.register(handle);
            in_room.push(rx);
        }
        let (other, mut other_rx) = session("r2", "a", 4);
        registry.register(other);

        let outcome = registry.route(&broadcast("r1", "a"));
        assert_eq!(outcome.delivered, 4);
        assert!(outcome.evicted.is_empty());
        assert!(!outcome.recipient_missing);

        for rx in &mut in_room {
            assert_eq!(rx.try_recv().unwrap().content, "hello");
            assert!(rx.try_recv().is_err());
        }
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn test_directed_delivery() {
        let mut registry = Registry::new(true);
        let (alice, mut alice_rx) = session("r", "alice", 4);
        let (bob, mut bob_rx) = session("r", "bob", 4);
        let (bob_elsewhere, mut bob_elsewhere_rx) = session("r2", "bob", 4);
        registry.register(alice);
        registry.register(bob);
        registry.register(bob_elsewhere);

        let message = Message::new("alice".into(), "r".into(), "psst").with_recipient("bob".into());
        let outcome = registry.route(&Arc::new(message));
        assert_eq!(outcome.delivered, 1);
        assert_eq!(bob_rx.try_recv().unwrap().content, "psst");
        assert!(alice_rx.try_recv().is_err());
        assert!(bob_elsewhere_rx.try_recv().is_err());
    }

    #[test]
    fn test_directed_to_missing_recipient() {
        let mut registry = Registry::new(true);
        let (alice, mut alice_rx) = session("r", "alice", 4);
        registry.register(alice);

        let message = Message::new("alice".into(), "r".into(), "hi").with_recipient("carol".into());
        let outcome = registry.route(&Arc::new(message));
        assert_eq!(outcome.delivered, 0);
        assert!(outcome.recipient_missing);
        assert!(alice_rx.try_recv().is_err());

        let nowhere = Message::new("alice".into(), "empty".into(), "hi").with_recipient("bob".into());
        assert!(registry.route(&Arc::new(nowhere)).recipient_missing);
    }

    #[test]
    fn test_full_mailbox_is_evicted_mid_broadcast() {
        let mut registry = Registry::new(true);
        let (slow, mut slow_rx) = session("r", "slow", 2);
        let slow_key = slow.key().clone();
        registry.register(slow);

        let mut others = Vec::new();
        for user in ["a", "b", "c"] {
            let (handle, rx) = session("r", user, 8);
            registry.register(handle);
            others.push(rx);
        }

        // Fill the slow session's mailbox to capacity.
        for _ in 0..2 {
            assert_eq!(registry.route(&broadcast("r", "a")).delivered, 4);
        }

        let outcome = registry.route(&broadcast("r", "a"));
        assert_eq!(outcome.delivered, 3);
        assert_eq!(
            outcome.evicted,
            vec![Eviction {
                key: slow_key.clone(),
                reason: EvictReason::MailboxFull,
            }]
        );
        assert_eq!(registry.session_of(&"r".into(), &"slow".into()), None);

        // Queued messages drain, then the mailbox reports closed.
        assert!(slow_rx.try_recv().is_ok());
        assert!(slow_rx.try_recv().is_ok());
        assert!(matches!(
            slow_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        for rx in &mut others {
            for _ in 0..3 {
                assert!(rx.try_recv().is_ok());
            }
        }
    }

    #[test]
    fn test_eviction_fires_retire_signal_with_backlog_queued() {
        let mut registry = Registry::new(true);
        let (tx, mut rx) = mailbox(1);
        let (retire, mut retired) = oneshot::channel();
        let key = SessionKey::new("r".into(), "slow".into());
        registry.register(SessionHandle::new(key, tx).with_retire_signal(retire));

        registry.route(&broadcast("r", "a"));
        assert!(matches!(retired.try_recv(), Err(oneshot::error::TryRecvError::Empty)));

        let outcome = registry.route(&broadcast("r", "a"));
        assert_eq!(outcome.evicted.len(), 1);
        // Retirement is visible while the backlog is still unread.
        assert!(matches!(retired.try_recv(), Err(oneshot::error::TryRecvError::Closed)));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_closed_mailbox_is_evicted() {
        let mut registry = Registry::new(false);
        let (gone, gone_rx) = session("r", "gone", 4);
        registry.register(gone);
        drop(gone_rx);

        let outcome = registry.route(&broadcast("r", "x"));
        assert_eq!(outcome.delivered, 0);
        assert_eq!(outcome.evicted[0].reason, EvictReason::MailboxClosed);
        // Empty rooms are kept when auto-delete is off.
        assert_eq!(registry.room_count(), 1);
        assert_eq!(registry.session_count(), 0);
    }

    #[test]
    fn test_queued_count() {
        let (handle, _rx) = session("r", "u", 4);
        let mut registry = Registry::new(true);
        registry.register(handle);
        registry.route(&broadcast("r", "u"));
        let queued = registry.rooms[&RoomId::new("r")][&UserId::new("u")].queued();
        assert_eq!(queued, 1);
    }
}

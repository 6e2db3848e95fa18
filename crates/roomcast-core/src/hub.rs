//! The hub: single owner of the room registry.
//!
//! Registration, unregistration and routing each arrive on their own intake
//! queue and are processed one at a time by [`Hub::run`]. Nothing else ever
//! touches the registry, so no locking is needed and every command observes
//! the effects of all commands processed before it.

use crate::id::{RoomId, SessionId, SessionKey, UserId};
use crate::message::Message;
use crate::metrics;
use crate::registry::{Registry, RouteOutcome, SessionHandle};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// The hub task has stopped.
    #[error("Hub is not running")]
    Closed,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of each intake queue.
    pub intake_capacity: usize,
    /// Whether to drop a room's entry once its last session leaves.
    pub auto_delete_empty_rooms: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            intake_capacity: 1024,
            auto_delete_empty_rooms: true,
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Rooms with at least one registry entry.
    pub rooms: usize,
    /// Registered sessions.
    pub sessions: usize,
    /// Messages routed.
    pub routed: u64,
    /// Mailbox enqueues.
    pub delivered: u64,
    /// Directed messages whose recipient was not registered.
    pub not_found: u64,
    /// Sessions evicted for a full or closed mailbox.
    pub evicted: u64,
    /// Sessions replaced by a newer session of the same user.
    pub replaced: u64,
    /// Unregistrations that removed a session.
    pub unregistered: u64,
    /// Unregistrations ignored because the session was already replaced,
    /// evicted or removed.
    pub stale_unregisters: u64,
}

struct Registration {
    handle: SessionHandle,
    ack: oneshot::Sender<()>,
}

enum Query {
    Stats(oneshot::Sender<HubStats>),
    Members(RoomId, oneshot::Sender<Vec<(UserId, SessionId)>>),
}

/// Cloneable handle for submitting commands to a running hub.
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<SessionKey>,
    route_tx: mpsc::Sender<Arc<Message>>,
    query_tx: mpsc::Sender<Query>,
}

impl HubHandle {
    /// Admit a session into the registry, replacing any session the same
    /// user holds in the same room.
    ///
    /// Resolves once the hub has applied the registration.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub is not running.
    pub async fn register(&self, handle: SessionHandle) -> Result<(), HubError> {
        let (ack, done) = oneshot::channel();
        self.register_tx
            .send(Registration { handle, ack })
            .await
            .map_err(|_| HubError::Closed)?;
        done.await.map_err(|_| HubError::Closed)
    }

    /// Remove a session if it is still the registered one. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub is not running.
    pub async fn unregister(&self, key: SessionKey) -> Result<(), HubError> {
        self.unregister_tx
            .send(key)
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Submit a message for fan-out.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub is not running.
    pub async fn route(&self, message: Message) -> Result<(), HubError> {
        self.route_tx
            .send(Arc::new(message))
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Get a statistics snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub is not running.
    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (reply, response) = oneshot::channel();
        self.query(Query::Stats(reply)).await?;
        response.await.map_err(|_| HubError::Closed)
    }

    /// List the users registered in a room with their session ids.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub is not running.
    pub async fn members(&self, room: &RoomId) -> Result<Vec<(UserId, SessionId)>, HubError> {
        let (reply, response) = oneshot::channel();
        self.query(Query::Members(room.clone(), reply)).await?;
        response.await.map_err(|_| HubError::Closed)
    }

    async fn query(&self, query: Query) -> Result<(), HubError> {
        self.query_tx
            .send(query)
            .await
            .map_err(|_| HubError::Closed)
    }
}

/// The router authority.
///
/// Created with [`Hub::new`]; hand out [`Hub::handle`]s, then start the
/// command loop with [`Hub::run`] or [`Hub::spawn`]. Both consume the hub, so
/// it can only ever run once. The loop ends when every handle is dropped.
pub struct Hub {
    registry: Registry,
    stats: HubStats,
    handle: HubHandle,
    register_rx: mpsc::Receiver<Registration>,
    unregister_rx: mpsc::Receiver<SessionKey>,
    route_rx: mpsc::Receiver<Arc<Message>>,
    query_rx: mpsc::Receiver<Query>,
}

impl Hub {
    /// Create a hub with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HubConfig::default())
    }

    /// Create a hub with custom configuration.
    #[must_use]
    pub fn with_config(config: HubConfig) -> Self {
        info!("Creating hub with config: {:?}", config);
        let capacity = config.intake_capacity.max(1);
        let (register_tx, register_rx) = mpsc::channel(capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(capacity);
        let (route_tx, route_rx) = mpsc::channel(capacity);
        let (query_tx, query_rx) = mpsc::channel(16);

        Self {
            registry: Registry::new(config.auto_delete_empty_rooms),
            stats: HubStats::default(),
            handle: HubHandle {
                register_tx,
                unregister_tx,
                route_tx,
                query_tx,
            },
            register_rx,
            unregister_rx,
            route_rx,
            query_rx,
        }
    }

    /// Get a handle for submitting commands.
    #[must_use]
    pub fn handle(&self) -> HubHandle {
        self.handle.clone()
    }

    /// Spawn the command loop on the current runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run the command loop until every handle is dropped.
    ///
    /// Intake queues are polled in priority order: registrations, then
    /// unregistrations, then routing. A session's registration is always
    /// acknowledged before its pumps start, so its unregister can never be
    /// processed ahead of it.
    pub async fn run(self) {
        let Hub {
            mut registry,
            mut stats,
            handle,
            mut register_rx,
            mut unregister_rx,
            mut route_rx,
            mut query_rx,
        } = self;
        drop(handle);

        info!("Hub running");
        loop {
            tokio::select! {
                biased;

                Some(Registration { handle, ack }) = register_rx.recv() => {
                    if let Some(previous) = registry.register(handle) {
                        info!(session = %previous.key(), "Session replaced by a newer login");
                        stats.replaced += 1;
                        metrics::record_replacement();
                        // Dropping the old handle closes its mailbox.
                        drop(previous);
                    }
                    let _ = ack.send(());
                    publish_size(&registry);
                }

                Some(key) = unregister_rx.recv() => {
                    if registry.unregister(&key).is_some() {
                        stats.unregistered += 1;
                        publish_size(&registry);
                    } else {
                        stats.stale_unregisters += 1;
                    }
                }

                Some(message) = route_rx.recv() => {
                    let outcome = registry.route(&message);
                    record_route(&message, &outcome, &mut stats);
                    if !outcome.evicted.is_empty() {
                        publish_size(&registry);
                    }
                }

                Some(query) = query_rx.recv() => match query {
                    Query::Stats(reply) => {
                        let snapshot = HubStats {
                            rooms: registry.room_count(),
                            sessions: registry.session_count(),
                            ..stats.clone()
                        };
                        let _ = reply.send(snapshot);
                    }
                    Query::Members(room, reply) => {
                        let _ = reply.send(registry.members(&room));
                    }
                },

                else => break,
            }
        }
        info!("Hub stopped");
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

fn record_route(message: &Message, outcome: &RouteOutcome, stats: &mut HubStats) {
    stats.routed += 1;
    stats.delivered += outcome.delivered as u64;
    metrics::record_delivered(outcome.delivered);

    if outcome.recipient_missing {
        stats.not_found += 1;
        metrics::record_route_miss();
        debug!(
            room = %message.room,
            recipient = ?message.recipient.as_ref().map(UserId::as_str),
            "Recipient not found"
        );
    }

    for eviction in &outcome.evicted {
        stats.evicted += 1;
        metrics::record_eviction(eviction.reason.as_str());
        warn!(
            session = %eviction.key,
            reason = eviction.reason.as_str(),
            "Evicted unresponsive session"
        );
    }
}

fn publish_size(registry: &Registry) {
    metrics::set_registry_size(registry.room_count(), registry.session_count());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::mailbox;

    fn handle_for(room: &str, user: &str, capacity: usize) -> (SessionHandle, crate::registry::MailboxReceiver) {
        let (tx, rx) = mailbox(capacity);
        (SessionHandle::new(SessionKey::new(room.into(), user.into()), tx), rx)
    }

    #[tokio::test]
    async fn test_register_route_unregister() {
        let hub = Hub::new();
        let handle = hub.handle();
        let task = hub.spawn();

        let (alice, mut alice_rx) = handle_for("r", "alice", 8);
        let alice_key = alice.key().clone();
        let (bob, mut bob_rx) = handle_for("r", "bob", 8);
        handle.register(alice).await.unwrap();
        handle.register(bob).await.unwrap();

        handle
            .route(Message::new("alice".into(), "r".into(), "hi all"))
            .await
            .unwrap();
        assert_eq!(alice_rx.recv().await.unwrap().content, "hi all");
        assert_eq!(bob_rx.recv().await.unwrap().content, "hi all");

        handle.unregister(alice_key.clone()).await.unwrap();
        handle.unregister(alice_key).await.unwrap();
        assert!(alice_rx.recv().await.is_none());

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.routed, 1);
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.unregistered, 1);
        assert_eq!(stats.stale_unregisters, 1);

        drop(handle);
        drop(bob_rx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_second_login_evicts_first() {
        let hub = Hub::new();
        let handle = hub.handle();
        hub.spawn();

        let (first, mut first_rx) = handle_for("r", "alice", 8);
        let (second, _second_rx) = handle_for("r", "alice", 8);
        let second_id = second.key().id;
        handle.register(first).await.unwrap();
        handle.register(second).await.unwrap();

        assert!(first_rx.recv().await.is_none());
        let members = handle.members(&"r".into()).await.unwrap();
        assert_eq!(members, vec![(UserId::new("alice"), second_id)]);
        assert_eq!(handle.stats().await.unwrap().replaced, 1);
    }

    #[tokio::test]
    async fn test_missing_recipient_is_counted() {
        let hub = Hub::new();
        let handle = hub.handle();
        hub.spawn();

        let (alice, mut alice_rx) = handle_for("r", "alice", 8);
        handle.register(alice).await.unwrap();
        handle
            .route(Message::new("alice".into(), "r".into(), "hi").with_recipient("ghost".into()))
            .await
            .unwrap();

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.not_found, 1);
        assert_eq!(stats.delivered, 0);
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_consumer_is_evicted_without_blocking_hub() {
        let hub = Hub::new();
        let handle = hub.handle();
        hub.spawn();

        let (slow, mut slow_rx) = handle_for("r", "slow", 1);
        let (fast, mut fast_rx) = handle_for("r", "fast", 8);
        handle.register(slow).await.unwrap();
        handle.register(fast).await.unwrap();

        for i in 0..3 {
            handle
                .route(Message::new("fast".into(), "r".into(), format!("m{i}")))
                .await
                .unwrap();
        }

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.evicted, 1);
        assert_eq!(stats.sessions, 1);
        for i in 0..3 {
            assert_eq!(fast_rx.recv().await.unwrap().content, format!("m{i}"));
        }
        assert_eq!(slow_rx.recv().await.unwrap().content, "m0");
        assert!(slow_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_handle_errors_after_hub_stops() {
        let hub = Hub::new();
        let handle = hub.handle();
        drop(hub);

        assert!(matches!(handle.stats().await, Err(HubError::Closed)));
        let (session, _rx) = handle_for("r", "u", 1);
        assert!(matches!(handle.register(session).await, Err(HubError::Closed)));
    }
}

//! Fixtures shared by the Roomcast benchmarks.

use roomcast_core::registry::{mailbox, MailboxReceiver};
use roomcast_core::{
    admit, ClientSession, HubHandle, Registry, SessionConfig, SessionHandle, SessionKey,
    SessionTasks, StaticGate,
};
use roomcast_transport::memory::{self, MemoryPeer};

/// A registry holding `members` sessions in `room`, with their mailboxes.
#[must_use]
pub fn populated_registry(
    room: &str,
    members: usize,
    mailbox_capacity: usize,
) -> (Registry, Vec<MailboxReceiver>) {
    let mut registry = Registry::new(true);
    let receivers = (0..members)
        .map(|i| {
            let (tx, rx) = mailbox(mailbox_capacity);
            let key = SessionKey::new(room.into(), format!("user-{i}").into());
            registry.register(SessionHandle::new(key, tx));
            rx
        })
        .collect();
    (registry, receivers)
}

/// Drop everything queued on the given mailboxes.
pub fn drain(receivers: &mut [MailboxReceiver]) {
    for rx in receivers {
        while rx.try_recv().is_ok() {}
    }
}

/// Connect `members` in-memory clients to `room` and start serving them.
///
/// # Panics
///
/// Panics if the hub is not running.
pub async fn join_room(
    hub: &HubHandle,
    room: &str,
    members: usize,
) -> Vec<(SessionTasks, MemoryPeer)> {
    let gate = StaticGate::open();
    let mut clients = Vec::with_capacity(members);
    for i in 0..members {
        let (conn, peer) = memory::pair();
        let admission = admit(&gate, room.into(), format!("user-{i}").into())
            .await
            .expect("open gate admits everyone");
        let session =
            ClientSession::register(hub.clone(), Box::new(conn), admission, SessionConfig::default())
                .await
                .expect("hub is running");
        clients.push((session.serve(), peer));
    }
    clients
}

/// A chat message body of roughly `size` bytes as a JSON text frame.
#[must_use]
pub fn chat_json(size: usize) -> String {
    serde_json::json!({ "content": "x".repeat(size) }).to_string()
}

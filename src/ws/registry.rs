//! Connection registry: identity <-> live socket and session fan-out.
//!
//! Both maps are purely in-process and rebuilt from empty on restart;
//! durable `connected` flags are reset at startup as the safety net.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::util::time::unix_millis;
use crate::ws::protocol::ServerMsg;

/// Frames the writer task understands
#[derive(Debug)]
pub enum OutboundFrame {
    Msg(ServerMsg),
    Ping,
    Close,
}

/// Handle to one live socket's writer task
#[derive(Clone)]
pub struct ConnectionHandle {
    pub conn_id: Uuid,
    tx: mpsc::UnboundedSender<OutboundFrame>,
    last_seen: Arc<AtomicU64>,
}

impl ConnectionHandle {
    pub fn new(conn_id: Uuid, tx: mpsc::UnboundedSender<OutboundFrame>) -> Self {
        Self {
            conn_id,
            tx,
            last_seen: Arc::new(AtomicU64::new(unix_millis())),
        }
    }

    fn send(&self, frame: OutboundFrame) -> bool {
        self.tx.send(frame).is_ok()
    }

    pub fn touch(&self) {
        self.last_seen.store(unix_millis(), Ordering::Relaxed);
    }

    fn idle_millis(&self) -> u64 {
        unix_millis().saturating_sub(self.last_seen.load(Ordering::Relaxed))
    }
}

/// Identity -> socket and session -> subscriber maps with fan-out
pub struct ConnectionRegistry {
    connections: DashMap<Uuid, ConnectionHandle>,
    subscriptions: DashMap<Uuid, HashSet<Uuid>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            subscriptions: DashMap::new(),
        }
    }

    /// Register a socket for an identity. At most one live socket per
    /// identity: a previous socket gets a superseded notice and is
    /// forcibly closed before the mapping is replaced.
    pub fn register(&self, user_id: Uuid, handle: ConnectionHandle) {
        if let Some(old) = self.connections.insert(user_id, handle) {
            info!(user_id = %user_id, "Duplicate login, superseding old socket");
            old.send(OutboundFrame::Msg(ServerMsg::Superseded));
            old.send(OutboundFrame::Close);
        }
    }

    /// Remove the mapping, but only if it still belongs to this
    /// connection (a superseding login may have replaced it already).
    /// Returns true when this connection was the current one.
    pub fn unregister(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        self.connections
            .remove_if(&user_id, |_, handle| handle.conn_id == conn_id)
            .is_some()
    }

    /// Record inbound activity for the liveness probe
    pub fn touch(&self, user_id: Uuid) {
        if let Some(handle) = self.connections.get(&user_id) {
            handle.touch();
        }
    }

    pub fn is_connected(&self, user_id: Uuid) -> bool {
        self.connections.contains_key(&user_id)
    }

    pub fn connected_count(&self) -> usize {
        self.connections.len()
    }

    pub fn subscribe(&self, session_id: Uuid, user_id: Uuid) {
        self.subscriptions
            .entry(session_id)
            .or_default()
            .insert(user_id);
    }

    /// Unsubscribing the last member removes the set
    pub fn unsubscribe(&self, session_id: Uuid, user_id: Uuid) {
        let emptied = match self.subscriptions.get_mut(&session_id) {
            Some(mut set) => {
                set.remove(&user_id);
                set.is_empty()
            }
            None => false,
        };
        if emptied {
            self.subscriptions
                .remove_if(&session_id, |_, set| set.is_empty());
        }
    }

    pub fn has_subscribers(&self, session_id: Uuid) -> bool {
        self.subscriptions.contains_key(&session_id)
    }

    /// Drop a session's whole subscriber set (the session wound down)
    pub fn remove_session(&self, session_id: Uuid) {
        self.subscriptions.remove(&session_id);
    }

    /// Send to one identity; a no-op if it has no live socket
    pub fn unicast(&self, user_id: Uuid, msg: ServerMsg) {
        if let Some(handle) = self.connections.get(&user_id) {
            if !handle.send(OutboundFrame::Msg(msg)) {
                debug!(user_id = %user_id, "Dropping unicast to closing socket");
            }
        }
    }

    /// Send to every subscribed, currently-open socket. Closed sockets
    /// are skipped silently - disconnects are transient, not errors.
    pub fn broadcast(&self, session_id: Uuid, msg: &ServerMsg, exclude: Option<Uuid>) {
        let targets: Vec<Uuid> = match self.subscriptions.get(&session_id) {
            Some(set) => set.iter().copied().collect(),
            None => return,
        };

        for user_id in targets {
            if exclude == Some(user_id) {
                continue;
            }
            if let Some(handle) = self.connections.get(&user_id) {
                if !handle.send(OutboundFrame::Msg(msg.clone())) {
                    debug!(user_id = %user_id, "Skipping closed socket in broadcast");
                }
            }
        }
    }

    /// Periodic liveness probe: ping every socket, force-close any that
    /// has stayed silent past the timeout window. The forced close ends
    /// the socket tasks, which run the normal disconnect cleanup.
    pub async fn run_heartbeat(self: Arc<Self>, interval: Duration, timeout: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;

            let mut dead: Vec<Uuid> = Vec::new();
            for entry in self.connections.iter() {
                if entry.value().idle_millis() > timeout.as_millis() as u64 {
                    dead.push(*entry.key());
                } else {
                    entry.value().send(OutboundFrame::Ping);
                }
            }

            for user_id in dead {
                if let Some(handle) = self.connections.get(&user_id) {
                    info!(user_id = %user_id, "Heartbeat timeout, closing socket");
                    handle.send(OutboundFrame::Close);
                }
            }
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(registry: &ConnectionRegistry, user_id: Uuid) -> (Uuid, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = Uuid::new_v4();
        registry.register(user_id, ConnectionHandle::new(conn_id, tx));
        (conn_id, rx)
    }

    #[test]
    fn duplicate_login_supersedes_old_socket() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();

        let (old_conn, mut old_rx) = connect(&registry, user);
        let (_new_conn, _new_rx) = connect(&registry, user);

        match old_rx.try_recv().unwrap() {
            OutboundFrame::Msg(ServerMsg::Superseded) => {}
            other => panic!("expected superseded notice, got {:?}", other),
        }
        assert!(matches!(old_rx.try_recv().unwrap(), OutboundFrame::Close));

        // Old socket's late cleanup must not evict the new mapping
        assert!(!registry.unregister(user, old_conn));
        assert!(registry.is_connected(user));
    }

    #[test]
    fn broadcast_skips_closed_and_excluded() {
        let registry = ConnectionRegistry::new();
        let session = Uuid::new_v4();
        let (alice, bob, carol) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let (_, mut alice_rx) = connect(&registry, alice);
        let (_, bob_rx) = connect(&registry, bob);
        for user in [alice, bob, carol] {
            registry.subscribe(session, user);
        }
        // Bob's socket is gone; carol never had one
        drop(bob_rx);

        registry.broadcast(session, &ServerMsg::NewRound { round: 2 }, Some(alice));
        assert!(alice_rx.try_recv().is_err());

        registry.broadcast(session, &ServerMsg::NewRound { round: 2 }, None);
        assert!(matches!(
            alice_rx.try_recv().unwrap(),
            OutboundFrame::Msg(ServerMsg::NewRound { round: 2 })
        ));
    }

    #[test]
    fn unsubscribing_last_member_removes_set() {
        let registry = ConnectionRegistry::new();
        let session = Uuid::new_v4();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

        registry.subscribe(session, alice);
        registry.subscribe(session, bob);
        registry.unsubscribe(session, alice);
        assert!(registry.has_subscribers(session));
        registry.unsubscribe(session, bob);
        assert!(!registry.has_subscribers(session));
    }

    #[test]
    fn unicast_without_socket_is_noop() {
        let registry = ConnectionRegistry::new();
        registry.unicast(Uuid::new_v4(), ServerMsg::NewRound { round: 1 });
    }
}

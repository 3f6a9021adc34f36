//! Live connection registry and fan-out delivery.
//!
//! The registry tracks every live connection (multiple devices per user),
//! which users are subscribed to which conversations, and delivers outbound
//! envelopes. All three maps are guarded by one mutex so that concurrent
//! connect/disconnect/subscribe and send-iteration never race each other; no
//! await happens while the lock is held (outbound queues are unbounded).

use confab_protocol::ServerEnvelope;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::{ConversationId, UserId};

/// Unique identifier for a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a fresh connection id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0.simple())
    }
}

/// Sending half of a connection's outbound queue.
pub type OutboundSender = mpsc::UnboundedSender<ServerEnvelope>;

struct ConnectionEntry {
    user: UserId,
    tx: OutboundSender,
}

#[derive(Default)]
struct Inner {
    /// connection -> owning user + send capability.
    connections: HashMap<ConnectionId, ConnectionEntry>,
    /// user -> live connections. A key exists iff the user has >= 1.
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
    /// conversation -> subscribed users. Empty sets are removed.
    subscriptions: HashMap<ConversationId, HashSet<UserId>>,
}

impl Inner {
    /// Remove one connection, cascading subscription cleanup when it was the
    /// user's last. Returns the owning user id.
    fn remove_connection(&mut self, conn: ConnectionId) -> Option<UserId> {
        let entry = self.connections.remove(&conn)?;
        let user = entry.user;

        if let Some(conns) = self.by_user.get_mut(&user) {
            conns.remove(&conn);
            if conns.is_empty() {
                self.by_user.remove(&user);
                self.subscriptions.retain(|_, users| {
                    users.remove(&user);
                    !users.is_empty()
                });
            }
        }

        Some(user)
    }

    fn deliver(
        &mut self,
        targets: &[UserId],
        exclude: &[UserId],
        envelope: &ServerEnvelope,
    ) -> Vec<UserId> {
        let mut reached = Vec::new();
        let mut dead = Vec::new();

        for &user in targets {
            if exclude.contains(&user) {
                continue;
            }
            let Some(conns) = self.by_user.get(&user) else {
                continue;
            };
            // Snapshot: sends must not observe removals made mid-iteration.
            let conns: Vec<ConnectionId> = conns.iter().copied().collect();
            let mut delivered = false;
            for conn in conns {
                if let Some(entry) = self.connections.get(&conn) {
                    if entry.tx.send(envelope.clone()).is_ok() {
                        delivered = true;
                    } else {
                        dead.push(conn);
                    }
                }
            }
            if delivered {
                reached.push(user);
            }
        }

        // A failed write is terminal for that connection only.
        for conn in dead {
            warn!(connection = %conn, "Dropping connection after failed send");
            self.remove_connection(conn);
        }

        reached
    }
}

/// Registry of live connections, subscriptions, and delivery fan-out.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for a user.
    pub fn register(&self, conn: ConnectionId, user: UserId, tx: OutboundSender) {
        let mut inner = self.lock();
        inner.connections.insert(conn, ConnectionEntry { user, tx });
        let count = {
            let conns = inner.by_user.entry(user).or_default();
            conns.insert(conn);
            conns.len()
        };
        info!(user = %user, connection = %conn, connections = count, "Connection registered");
    }

    /// Remove a connection, returning the user it belonged to.
    ///
    /// Removing a user's last connection drops it from every conversation's
    /// subscriber set.
    pub fn unregister(&self, conn: ConnectionId) -> Option<UserId> {
        let mut inner = self.lock();
        let user = inner.remove_connection(conn)?;
        let remaining = inner.by_user.get(&user).map_or(0, HashSet::len);
        info!(user = %user, connection = %conn, remaining, "Connection unregistered");
        Some(user)
    }

    /// Subscribe a user to conversation fan-out.
    ///
    /// Subscribing while offline is legal; it yields no deliverable
    /// connection until the user reconnects.
    pub fn subscribe(&self, user: UserId, conversation: ConversationId) {
        let mut inner = self.lock();
        inner.subscriptions.entry(conversation).or_default().insert(user);
        debug!(user = %user, conversation = %conversation, "Subscribed");
    }

    /// Unsubscribe a user from conversation fan-out; unconditional.
    pub fn unsubscribe(&self, user: UserId, conversation: ConversationId) {
        let mut inner = self.lock();
        if let Some(users) = inner.subscriptions.get_mut(&conversation) {
            users.remove(&user);
            if users.is_empty() {
                inner.subscriptions.remove(&conversation);
            }
            debug!(user = %user, conversation = %conversation, "Unsubscribed");
        }
    }

    /// Whether the user has at least one live connection.
    #[must_use]
    pub fn is_online(&self, user: UserId) -> bool {
        self.lock().by_user.contains_key(&user)
    }

    /// Send an envelope to every connection of one user.
    ///
    /// Returns `true` if at least one connection accepted it.
    pub fn send_to_user(&self, user: UserId, envelope: &ServerEnvelope) -> bool {
        !self.lock().deliver(&[user], &[], envelope).is_empty()
    }

    /// Send an envelope to every subscriber of a conversation.
    ///
    /// Returns the users that received it.
    pub fn send_to_subscribers(
        &self,
        conversation: ConversationId,
        envelope: &ServerEnvelope,
        exclude: &[UserId],
    ) -> Vec<UserId> {
        let mut inner = self.lock();
        let Some(users) = inner.subscriptions.get(&conversation) else {
            return Vec::new();
        };
        let targets: Vec<UserId> = users.iter().copied().collect();
        inner.deliver(&targets, exclude, envelope)
    }

    /// Send an envelope to the given participants whether or not they have
    /// subscribed.
    ///
    /// Used for created-message events so the very first message in a
    /// conversation reaches participants that have not issued a subscribe
    /// yet. Returns the users that received it.
    pub fn broadcast_to_participants(
        &self,
        envelope: &ServerEnvelope,
        participants: &[UserId],
        exclude: &[UserId],
    ) -> Vec<UserId> {
        self.lock().deliver(participants, exclude, envelope)
    }

    /// Total number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Nothing panics while holding the lock; a poisoned mutex here means
        // the process is already going down.
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confab_protocol::ErrorCode;

    fn envelope() -> ServerEnvelope {
        ServerEnvelope::error(ErrorCode::InternalError, "test")
    }

    fn channel() -> (OutboundSender, mpsc::UnboundedReceiver<ServerEnvelope>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn test_online_iff_registered() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let (c1, c2) = (ConnectionId::generate(), ConnectionId::generate());
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();

        assert!(!registry.is_online(user));

        registry.register(c1, user, tx1);
        registry.register(c2, user, tx2);
        assert!(registry.is_online(user));
        assert_eq!(registry.connection_count(), 2);

        assert_eq!(registry.unregister(c1), Some(user));
        assert!(registry.is_online(user));

        assert_eq!(registry.unregister(c2), Some(user));
        assert!(!registry.is_online(user));
        assert_eq!(registry.unregister(c2), None);
    }

    #[test]
    fn test_last_connection_cascades_subscriptions() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let conv = Uuid::new_v4();
        let conn = ConnectionId::generate();
        let (tx, mut rx) = channel();

        registry.register(conn, user, tx);
        registry.subscribe(user, conv);

        assert_eq!(registry.send_to_subscribers(conv, &envelope(), &[]), vec![user]);
        assert!(rx.try_recv().is_ok());

        registry.unregister(conn);
        assert!(registry.send_to_subscribers(conv, &envelope(), &[]).is_empty());
    }

    #[test]
    fn test_subscribe_while_offline() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let conv = Uuid::new_v4();

        registry.subscribe(user, conv);
        assert!(registry.send_to_subscribers(conv, &envelope(), &[]).is_empty());

        let conn = ConnectionId::generate();
        let (tx, mut rx) = channel();
        registry.register(conn, user, tx);
        assert_eq!(registry.send_to_subscribers(conv, &envelope(), &[]), vec![user]);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_failed_send_drops_only_that_connection() {
        let registry = ConnectionRegistry::new();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let (ca, cb) = (ConnectionId::generate(), ConnectionId::generate());
        let (tx_a, rx_a) = channel();
        let (tx_b, mut rx_b) = channel();

        registry.register(ca, alice, tx_a);
        registry.register(cb, bob, tx_b);
        drop(rx_a); // Alice's socket writer died.

        let reached = registry.broadcast_to_participants(&envelope(), &[alice, bob], &[]);
        assert_eq!(reached, vec![bob]);
        assert!(rx_b.try_recv().is_ok());

        // The dead connection was unregistered in place.
        assert!(!registry.is_online(alice));
        assert!(registry.is_online(bob));
    }

    #[test]
    fn test_broadcast_excludes() {
        let registry = ConnectionRegistry::new();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let (ca, cb) = (ConnectionId::generate(), ConnectionId::generate());
        let (tx_a, mut rx_a) = channel();
        let (tx_b, mut rx_b) = channel();

        registry.register(ca, alice, tx_a);
        registry.register(cb, bob, tx_b);

        let reached = registry.broadcast_to_participants(&envelope(), &[alice, bob], &[alice]);
        assert_eq!(reached, vec![bob]);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn test_multi_device_fanout() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let (c1, c2) = (ConnectionId::generate(), ConnectionId::generate());
        let (tx1, mut rx1) = channel();
        let (tx2, mut rx2) = channel();

        registry.register(c1, user, tx1);
        registry.register(c2, user, tx2);

        assert!(registry.send_to_user(user, &envelope()));
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }
}

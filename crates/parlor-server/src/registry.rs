//! Connection registry.
//!
//! Tracks which live connections belong to which user, which rooms each
//! connection has joined, and the outbound queue of every connection. All
//! operations are synchronous and hold the lock only for map updates; events
//! are handed to per-connection queues with `try_send`, so a broadcast never
//! waits on a slow client.
//!
//! A connection whose queue is full has lost an event. It is flagged as
//! overflowed, receives nothing further, and is handed back through
//! [`ConnectionRegistry::take_overflowed`] so the hub can tear it down.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use parlor_shared::{ConnectionId, Room, UserId};

use crate::protocol::ServerEvent;

struct ConnectionEntry {
    user_id: UserId,
    rooms: HashSet<Room>,
    sender: mpsc::Sender<ServerEvent>,
    /// Set once an event could not be queued.
    overflowed: AtomicBool,
    connected_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    rooms: HashMap<Room, HashSet<ConnectionId>>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
}

impl Inner {
    fn add_to_room(&mut self, conn: ConnectionId, room: Room) -> bool {
        let Some(entry) = self.connections.get_mut(&conn) else {
            return false;
        };
        entry.rooms.insert(room);
        self.rooms.entry(room).or_default().insert(conn);
        true
    }

    fn remove_from_room(&mut self, conn: ConnectionId, room: Room) -> bool {
        let Some(entry) = self.connections.get_mut(&conn) else {
            return false;
        };
        let was_member = entry.rooms.remove(&room);
        if let Some(members) = self.rooms.get_mut(&room) {
            members.remove(&conn);
            if members.is_empty() {
                self.rooms.remove(&room);
            }
        }
        was_member
    }
}

/// Result of removing a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unregistered {
    pub user_id: UserId,
    /// `true` when this was the user's last live connection.
    pub was_last: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub connections: usize,
    pub users: usize,
    pub rooms: usize,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
    overflowed: Mutex<Vec<ConnectionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection and join it to its user's identity room.
    ///
    /// Returns `true` if this is the user's first live connection.
    pub fn register(
        &self,
        conn: ConnectionId,
        user_id: UserId,
        sender: mpsc::Sender<ServerEvent>,
    ) -> bool {
        let mut inner = self.write();
        inner.connections.insert(
            conn,
            ConnectionEntry {
                user_id,
                rooms: HashSet::new(),
                sender,
                overflowed: AtomicBool::new(false),
                connected_at: Utc::now(),
            },
        );
        inner.add_to_room(conn, Room::User(user_id));

        let conns = inner.by_user.entry(user_id).or_default();
        conns.insert(conn);
        let first = conns.len() == 1;
        debug!(connection = %conn, user = %user_id, first, "connection registered");
        first
    }

    /// Remove a connection from every room. A second call for the same id
    /// returns `None`.
    pub fn unregister(&self, conn: ConnectionId) -> Option<Unregistered> {
        let mut inner = self.write();
        let entry = inner.connections.remove(&conn)?;

        for room in &entry.rooms {
            if let Some(members) = inner.rooms.get_mut(room) {
                members.remove(&conn);
                if members.is_empty() {
                    inner.rooms.remove(room);
                }
            }
        }

        let mut was_last = true;
        if let Some(conns) = inner.by_user.get_mut(&entry.user_id) {
            conns.remove(&conn);
            was_last = conns.is_empty();
            if was_last {
                inner.by_user.remove(&entry.user_id);
            }
        }

        debug!(
            connection = %conn,
            user = %entry.user_id,
            was_last,
            connected_for_secs = (Utc::now() - entry.connected_at).num_seconds(),
            "connection unregistered"
        );
        Some(Unregistered {
            user_id: entry.user_id,
            was_last,
        })
    }

    /// Returns `false` if the connection is unknown.
    pub fn join_room(&self, conn: ConnectionId, room: Room) -> bool {
        self.write().add_to_room(conn, room)
    }

    /// Returns `true` if the connection was in the room.
    pub fn leave_room(&self, conn: ConnectionId, room: Room) -> bool {
        self.write().remove_from_room(conn, room)
    }

    /// Drop every connection of `user` from `room`.
    pub fn evict_user(&self, user: UserId, room: Room) {
        let mut inner = self.write();
        let conns: Vec<ConnectionId> = inner
            .by_user
            .get(&user)
            .map(|c| c.iter().copied().collect())
            .unwrap_or_default();
        for conn in conns {
            inner.remove_from_room(conn, room);
        }
    }

    pub fn members_of(&self, room: Room) -> HashSet<ConnectionId> {
        self.read().rooms.get(&room).cloned().unwrap_or_default()
    }

    pub fn connections_of(&self, user: UserId) -> HashSet<ConnectionId> {
        self.read().by_user.get(&user).cloned().unwrap_or_default()
    }

    pub fn user_of(&self, conn: ConnectionId) -> Option<UserId> {
        self.read().connections.get(&conn).map(|e| e.user_id)
    }

    pub fn is_connected(&self, user: UserId) -> bool {
        self.read().by_user.contains_key(&user)
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.read().connections.keys().copied().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.read().connections.len()
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.read();
        RegistryStats {
            connections: inner.connections.len(),
            users: inner.by_user.len(),
            rooms: inner.rooms.len(),
        }
    }

    /// Queue `event` for one connection.
    pub fn send_to(&self, conn: ConnectionId, event: ServerEvent) -> bool {
        let inner = self.read();
        match inner.connections.get(&conn) {
            Some(entry) => self.deliver(conn, entry, event),
            None => false,
        }
    }

    /// Queue `event` for every connection in `room`, skipping connections
    /// owned by `except`. Returns how many connections accepted it.
    pub fn send_to_room(&self, room: Room, event: &ServerEvent, except: Option<UserId>) -> usize {
        let inner = self.read();
        let Some(members) = inner.rooms.get(&room) else {
            return 0;
        };

        let mut delivered = 0;
        for conn in members {
            let Some(entry) = inner.connections.get(conn) else {
                continue;
            };
            if except == Some(entry.user_id) {
                continue;
            }
            if self.deliver(*conn, entry, event.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Connections that lost an event since the last call. Each id is
    /// returned once.
    pub fn take_overflowed(&self) -> Vec<ConnectionId> {
        std::mem::take(&mut *self.overflowed.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn deliver(&self, conn: ConnectionId, entry: &ConnectionEntry, event: ServerEvent) -> bool {
        if entry.overflowed.load(Ordering::Acquire) {
            return false;
        }
        match entry.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                if !entry.overflowed.swap(true, Ordering::AcqRel) {
                    warn!(
                        connection = %conn,
                        user = %entry.user_id,
                        event = event.name(),
                        "outbound queue full, dropping connection"
                    );
                    self.overflowed
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(conn);
                }
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parlor_shared::ConversationId;

    fn channel() -> (mpsc::Sender<ServerEvent>, mpsc::Receiver<ServerEvent>) {
        mpsc::channel(8)
    }

    #[test]
    fn test_register_reports_first_connection() {
        let registry = ConnectionRegistry::new();
        let user = UserId::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        let (c1, c2) = (ConnectionId::new(), ConnectionId::new());

        assert!(registry.register(c1, user, tx1));
        assert!(!registry.register(c2, user, tx2));
        assert_eq!(registry.connections_of(user).len(), 2);
        assert_eq!(registry.members_of(Room::User(user)).len(), 2);
        assert!(registry.is_connected(user));
    }

    #[test]
    fn test_unregister_is_idempotent_and_counts_down() {
        let registry = ConnectionRegistry::new();
        let user = UserId::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        let (c1, c2) = (ConnectionId::new(), ConnectionId::new());
        registry.register(c1, user, tx1);
        registry.register(c2, user, tx2);

        assert_eq!(
            registry.unregister(c1),
            Some(Unregistered { user_id: user, was_last: false })
        );
        assert_eq!(registry.unregister(c1), None);
        assert_eq!(
            registry.unregister(c2),
            Some(Unregistered { user_id: user, was_last: true })
        );
        assert!(!registry.is_connected(user));
        assert_eq!(registry.stats(), RegistryStats::default());
    }

    #[test]
    fn test_rooms_track_membership() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();
        let conn = ConnectionId::new();
        let room = Room::Conversation(ConversationId::new());
        registry.register(conn, UserId::new(), tx);

        assert!(registry.join_room(conn, room));
        assert!(registry.members_of(room).contains(&conn));
        assert!(registry.leave_room(conn, room));
        assert!(!registry.leave_room(conn, room));
        assert!(registry.members_of(room).is_empty());

        // Unknown connections cannot join anything.
        assert!(!registry.join_room(ConnectionId::new(), room));
    }

    #[tokio::test]
    async fn test_send_to_room_skips_excluded_user() {
        let registry = ConnectionRegistry::new();
        let room = Room::Conversation(ConversationId::new());
        let (alice, bob) = (UserId::new(), UserId::new());
        let (tx_a, mut rx_a) = channel();
        let (tx_b, mut rx_b) = channel();
        let (ca, cb) = (ConnectionId::new(), ConnectionId::new());
        registry.register(ca, alice, tx_a);
        registry.register(cb, bob, tx_b);
        registry.join_room(ca, room);
        registry.join_room(cb, room);

        let event = ServerEvent::UserOnline { user_id: alice };
        assert_eq!(registry.send_to_room(room, &event, Some(alice)), 1);
        assert_eq!(rx_b.recv().await, Some(event));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_queue_flags_connection_once() {
        let registry = ConnectionRegistry::new();
        let user = UserId::new();
        let (tx, mut rx) = mpsc::channel(1);
        let conn = ConnectionId::new();
        registry.register(conn, user, tx);

        let first = ServerEvent::UserOnline { user_id: user };
        let second = ServerEvent::UserOffline { user_id: user };
        assert!(registry.send_to(conn, first.clone()));
        assert!(!registry.send_to(conn, second.clone()));
        assert_eq!(registry.take_overflowed(), vec![conn]);

        // Room space frees up, but nothing more is queued after the gap.
        assert_eq!(rx.recv().await, Some(first));
        assert!(!registry.send_to(conn, second.clone()));
        assert_eq!(registry.send_to_room(Room::User(user), &second, None), 0);
        assert!(rx.try_recv().is_err());
        assert!(registry.take_overflowed().is_empty());
    }

    #[test]
    fn test_evict_user_from_room() {
        let registry = ConnectionRegistry::new();
        let user = UserId::new();
        let room = Room::Conversation(ConversationId::new());
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        let (c1, c2) = (ConnectionId::new(), ConnectionId::new());
        registry.register(c1, user, tx1);
        registry.register(c2, user, tx2);
        registry.join_room(c1, room);
        registry.join_room(c2, room);

        registry.evict_user(user, room);
        assert!(registry.members_of(room).is_empty());
        // Identity room is untouched.
        assert_eq!(registry.members_of(Room::User(user)).len(), 2);
    }
}

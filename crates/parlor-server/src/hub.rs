//! Realtime hub.
//!
//! The hub owns the connection lifecycle: it authenticates a socket, turns
//! it into an active [`Connection`], dispatches inbound events, and tears it
//! down exactly once. Conversation mutations are persisted through the store
//! and then fanned out to rooms while the conversation's lock is held, so
//! broadcast order in a room matches persistence order. Presence transitions
//! are linearised per user the same way.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use parlor_shared::session::SessionKeys;
use parlor_shared::{ConnectionId, ConversationId, MessageId, Room, TokenError, UserId};
use parlor_store::{Attachment, Conversation, Message, ReadReceipt};

use crate::error::HubError;
use crate::locks::KeyedLocks;
use crate::presence::PresenceTracker;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::registry::{ConnectionRegistry, RegistryStats};
use crate::store::Store;

#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    /// Capacity of each connection's outbound queue.
    pub outbound_queue: usize,
    /// 0 means unlimited.
    pub max_connections: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_queue: 256,
            max_connections: 0,
        }
    }
}

/// An authenticated, registered connection. Only obtainable from
/// [`Hub::connect`], so unauthenticated sockets cannot dispatch anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub id: ConnectionId,
    pub user_id: UserId,
}

/// A freshly authenticated connection and the queue of events addressed to it.
pub struct Session {
    pub connection: Connection,
    pub events: mpsc::Receiver<ServerEvent>,
}

/// What the socket loop should do after an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// One friend's presence as reported by the status snapshot.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FriendStatus {
    pub user_id: UserId,
    pub username: String,
    pub online: bool,
    pub last_seen: chrono::DateTime<chrono::Utc>,
}

pub struct Hub {
    store: Store,
    sessions: SessionKeys,
    presence: PresenceTracker,
    registry: ConnectionRegistry,
    user_locks: KeyedLocks<UserId>,
    conversation_locks: KeyedLocks<ConversationId>,
    config: HubConfig,
}

impl Hub {
    pub fn new(
        store: Store,
        sessions: SessionKeys,
        presence: PresenceTracker,
        registry: ConnectionRegistry,
        config: HubConfig,
    ) -> Self {
        Self {
            store,
            sessions,
            presence,
            registry,
            user_locks: KeyedLocks::new(),
            conversation_locks: KeyedLocks::new(),
            config,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn sessions(&self) -> &SessionKeys {
        &self.sessions
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Authenticate a new socket and register it.
    ///
    /// On the user's first live connection, online friends receive
    /// `userOnline`.
    pub async fn connect(&self, token: Option<&str>) -> Result<Session, HubError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(HubError::Auth(TokenError::Missing))?;
        let claims = self.sessions.verify(token)?;
        let user_id = claims.user_id;

        if !self.store.call(move |db| db.user_exists(user_id)).await? {
            return Err(HubError::UnknownUser);
        }
        if self.config.max_connections > 0
            && self.registry.connection_count() >= self.config.max_connections
        {
            warn!(user = %user_id, limit = self.config.max_connections, "connection limit reached");
            return Err(HubError::Capacity);
        }

        let (tx, rx) = mpsc::channel(self.config.outbound_queue.max(1));
        let connection = Connection {
            id: ConnectionId::new(),
            user_id,
        };

        let guard = self.user_locks.lock(user_id).await;
        let first = self.registry.register(connection.id, user_id, tx);
        self.presence.mark_online(user_id);
        if first {
            self.announce_presence(user_id, true).await;
        }
        drop(guard);
        self.reap_overflowed().await;

        info!(connection = %connection.id, user = %user_id, first, "connection active");
        Ok(Session {
            connection,
            events: rx,
        })
    }

    /// Tear down a connection. Safe to call more than once; only the first
    /// call has any effect. Returns whether this call did the teardown.
    pub async fn disconnect(&self, conn: ConnectionId) -> bool {
        let done = self.teardown(conn).await;
        self.reap_overflowed().await;
        done
    }

    /// Tear down every connection that lost an event to a full queue. The
    /// client reconnects and refetches what it missed.
    pub async fn reap_overflowed(&self) {
        loop {
            let lagging = self.registry.take_overflowed();
            if lagging.is_empty() {
                return;
            }
            for conn in lagging {
                if self.teardown(conn).await {
                    warn!(connection = %conn, "slow connection closed");
                }
            }
        }
    }

    async fn teardown(&self, conn: ConnectionId) -> bool {
        let Some(user_id) = self.registry.user_of(conn) else {
            return false;
        };

        let _guard = self.user_locks.lock(user_id).await;
        let Some(gone) = self.registry.unregister(conn) else {
            return false;
        };
        if gone.was_last {
            self.presence.mark_offline(user_id);
            self.announce_presence(user_id, false).await;
        }

        info!(connection = %conn, user = %user_id, offline = gone.was_last, "connection closed");
        true
    }

    /// Tear down every live connection through the normal path.
    pub async fn shutdown(&self) {
        let ids = self.registry.connection_ids();
        info!(connections = ids.len(), "shutting down hub");
        for id in ids {
            self.disconnect(id).await;
        }
    }

    /// Tell every online friend of `user` about a presence transition.
    async fn announce_presence(&self, user: UserId, online: bool) {
        let friends = match self.store.call(move |db| db.friends_of(user)).await {
            Ok(friends) => friends,
            Err(e) => {
                warn!(user = %user, error = %e, "could not load friends for presence fan-out");
                return;
            }
        };

        let event = if online {
            ServerEvent::UserOnline { user_id: user }
        } else {
            ServerEvent::UserOffline { user_id: user }
        };
        let online_friends: Vec<UserId> = friends
            .into_iter()
            .filter(|f| *f != user && self.presence.is_online(*f))
            .collect();
        let delivered = self.broadcast_to_users(&online_friends, &event);
        debug!(user = %user, online, delivered, "presence announced");
    }

    // ------------------------------------------------------------------
    // Inbound events
    // ------------------------------------------------------------------

    /// Handle one inbound event. Failures are reported to this connection
    /// only.
    pub async fn dispatch(&self, conn: &Connection, event: ClientEvent) -> Flow {
        // Torn down elsewhere (shutdown, slow consumer): nothing more to do.
        if self.registry.user_of(conn.id).is_none() {
            return Flow::Close;
        }

        let result = match event {
            ClientEvent::JoinConversationRoom { conversation_id } => {
                self.registry.join_room(conn.id, Room::Conversation(conversation_id));
                Ok(())
            }
            ClientEvent::LeaveConversationRoom { conversation_id } => {
                self.registry.leave_room(conn.id, Room::Conversation(conversation_id));
                Ok(())
            }
            ClientEvent::SendMessage {
                conversation_id,
                text,
                attachments,
            } => self
                .send_message(conn.user_id, conversation_id, text, attachments)
                .await
                .map(|_| ()),
            ClientEvent::TypingStart {
                conversation_id,
                display_name,
            } => {
                self.typing(conn.user_id, conversation_id, Some(display_name));
                Ok(())
            }
            ClientEvent::TypingStop { conversation_id } => {
                self.typing(conn.user_id, conversation_id, None);
                Ok(())
            }
            ClientEvent::MarkRead { message_id } => {
                self.mark_read(conn.user_id, message_id).await.map(|_| ())
            }
            ClientEvent::Logout => return Flow::Close,
        };

        if let Err(e) = result {
            self.reject(conn, &e);
        }
        self.reap_overflowed().await;
        Flow::Continue
    }

    /// Send an `error` event to one connection.
    pub fn reject(&self, conn: &Connection, error: &HubError) {
        debug!(connection = %conn.id, code = error.code(), error = %error, "request failed");
        self.registry.send_to(conn.id, ServerEvent::Error(error.to_event()));
    }

    fn typing(&self, user: UserId, conversation_id: ConversationId, display_name: Option<String>) {
        let event = match display_name {
            Some(display_name) => ServerEvent::UserTyping {
                user_id: user,
                conversation_id,
                display_name,
            },
            None => ServerEvent::UserStopTyping {
                user_id: user,
                conversation_id,
            },
        };
        self.registry
            .send_to_room(Room::Conversation(conversation_id), &event, Some(user));
    }

    // ------------------------------------------------------------------
    // Mutations shared by the socket and REST paths
    // ------------------------------------------------------------------

    /// Persist a message and deliver `newMessage` to the conversation room.
    pub async fn send_message(
        &self,
        sender: UserId,
        conversation_id: ConversationId,
        text: Option<String>,
        attachments: Vec<Attachment>,
    ) -> Result<Message, HubError> {
        let guard = self.conversation_locks.lock(conversation_id).await;
        let message = self
            .store
            .call(move |db| db.append_message(conversation_id, sender, text, attachments))
            .await?;

        let delivered = self.broadcast_to_room(
            Room::Conversation(conversation_id),
            &ServerEvent::NewMessage {
                message: message.clone(),
            },
        );
        drop(guard);
        self.reap_overflowed().await;

        debug!(conversation = %conversation_id, message = %message.id, delivered, "message delivered");
        Ok(message)
    }

    /// Mark a message read; `messageRead` goes out only if nothing was
    /// recorded before.
    pub async fn mark_read(&self, user: UserId, message_id: MessageId) -> Result<ReadReceipt, HubError> {
        let conversation_id = self
            .store
            .call(move |db| db.message_conversation(message_id))
            .await?;

        let guard = self.conversation_locks.lock(conversation_id).await;
        let receipt = self.store.call(move |db| db.mark_read(message_id, user)).await?;
        if receipt.changed {
            self.broadcast_to_room(
                Room::Conversation(receipt.conversation_id),
                &ServerEvent::MessageRead {
                    message_id,
                    user_id: user,
                },
            );
        }
        drop(guard);
        self.reap_overflowed().await;
        Ok(receipt)
    }

    /// Create a group and push `newChat` to every participant.
    pub async fn create_group(
        &self,
        creator: UserId,
        name: String,
        participant_ids: Vec<UserId>,
    ) -> Result<Conversation, HubError> {
        let conversation = self
            .store
            .call(move |db| db.create_group(creator, &name, &participant_ids))
            .await?;

        let participants: Vec<UserId> = conversation.participants.iter().copied().collect();
        self.broadcast_to_users(
            &participants,
            &ServerEvent::NewChat {
                conversation: conversation.clone(),
            },
        );
        self.reap_overflowed().await;
        info!(conversation = %conversation.id, creator = %creator, "group created");
        Ok(conversation)
    }

    /// Add users to a group: `chatUpdated` to the room, `newChat` to each
    /// added user.
    pub async fn add_participants(
        &self,
        conversation_id: ConversationId,
        requester: UserId,
        new_ids: Vec<UserId>,
    ) -> Result<Conversation, HubError> {
        let guard = self.conversation_locks.lock(conversation_id).await;
        let (conversation, added) = self
            .store
            .call(move |db| db.add_participants(conversation_id, requester, &new_ids))
            .await?;

        self.broadcast_to_room(
            Room::Conversation(conversation_id),
            &ServerEvent::ChatUpdated {
                conversation: conversation.clone(),
            },
        );
        self.broadcast_to_users(
            &added,
            &ServerEvent::NewChat {
                conversation: conversation.clone(),
            },
        );
        drop(guard);
        self.reap_overflowed().await;
        Ok(conversation)
    }

    /// Remove a user from a group and stop delivering the room to them.
    ///
    /// The target is evicted from the room first, so every one of their
    /// connections hears `chatUpdated` and `userRemoved` exactly once,
    /// through their identity room.
    pub async fn remove_participant(
        &self,
        conversation_id: ConversationId,
        requester: UserId,
        target: UserId,
    ) -> Result<Conversation, HubError> {
        let guard = self.conversation_locks.lock(conversation_id).await;
        let conversation = self
            .store
            .call(move |db| db.remove_participant(conversation_id, requester, target))
            .await?;

        let room = Room::Conversation(conversation_id);
        self.registry.evict_user(target, room);

        let updated = ServerEvent::ChatUpdated {
            conversation: conversation.clone(),
        };
        let removed = ServerEvent::UserRemoved {
            conversation_id,
            user_id: target,
        };
        for audience in [room, Room::User(target)] {
            self.broadcast_to_room(audience, &updated);
            self.broadcast_to_room(audience, &removed);
        }
        drop(guard);
        self.reap_overflowed().await;
        Ok(conversation)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Presence of every friend of `user`: live tracker entries first, the
    /// persisted mirror for anyone the tracker has not seen.
    pub async fn friend_statuses(&self, user: UserId) -> Result<Vec<FriendStatus>, HubError> {
        let records = self
            .store
            .call(move |db| {
                let friends = db.friends_of(user)?;
                db.presence_of(&friends)
            })
            .await?;

        let ids: Vec<UserId> = records.iter().map(|r| r.user_id).collect();
        let live = self.presence.snapshot(&ids);

        let mut statuses: Vec<FriendStatus> = records
            .into_iter()
            .map(|record| {
                let (online, last_seen) = match live.get(&record.user_id) {
                    Some(entry) => (entry.online, entry.last_seen),
                    None => (record.online, record.last_seen),
                };
                FriendStatus {
                    user_id: record.user_id,
                    username: record.username,
                    online,
                    last_seen,
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(statuses)
    }

    // ------------------------------------------------------------------
    // Broadcast primitives
    // ------------------------------------------------------------------

    /// Deliver `event` to every connection in `room`. Returns how many
    /// connections accepted it.
    pub fn broadcast_to_room(&self, room: Room, event: &ServerEvent) -> usize {
        self.registry.send_to_room(room, event, None)
    }

    /// Deliver `event` to the identity room of each user.
    pub fn broadcast_to_users(&self, users: &[UserId], event: &ServerEvent) -> usize {
        users
            .iter()
            .map(|user| self.registry.send_to_room(Room::User(*user), event, None))
            .sum()
    }
}

//! Domain model structs persisted in the SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` with camelCase field
//! names so it can be handed directly to clients over REST and WebSocket.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use parlor_shared::{ConversationId, MessageId, UserId};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A registered account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    /// Persisted presence mirror. Authoritative only for cold starts.
    pub online: bool,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// The public face of a user: friend lists, suggestions, conversation
/// members and message senders.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: UserId,
    pub username: String,
    pub email: String,
}

/// Persisted presence fields for one user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub username: String,
    pub online: bool,
    pub last_seen: DateTime<Utc>,
}

/// Everything the friends screen needs in one read.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FriendOverview {
    pub friends: Vec<UserSummary>,
    /// Requests other users sent to this user.
    pub incoming: Vec<UserSummary>,
    /// Requests this user sent that are still pending.
    pub outgoing: Vec<UserSummary>,
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// A private (two-person) or group conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub is_group: bool,
    /// Present iff `is_group`.
    pub name: Option<String>,
    pub participants: BTreeSet<UserId>,
    /// Non-empty iff `is_group`; always a subset of `participants`.
    pub admins: BTreeSet<UserId>,
    /// Profile of every participant, ordered by username.
    pub members: Vec<UserSummary>,
    pub last_message_id: Option<MessageId>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn has_participant(&self, user: &UserId) -> bool {
        self.participants.contains(user)
    }

    pub fn is_admin(&self, user: &UserId) -> bool {
        self.admins.contains(user)
    }

    pub fn member(&self, user: &UserId) -> Option<&UserSummary> {
        self.members.iter().find(|m| m.id == *user)
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Video,
    File,
}

/// An already-uploaded blob referenced by a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub url: String,
    pub kind: AttachmentKind,
}

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: UserSummary,
    pub text: Option<String>,
    pub attachments: Vec<Attachment>,
    /// Append-only.
    pub read_by: BTreeSet<UserId>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of marking a message as read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadReceipt {
    pub conversation_id: ConversationId,
    /// `false` when the user had already read the message.
    pub changed: bool,
}

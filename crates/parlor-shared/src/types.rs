use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Registered user account.
    UserId
);
uuid_id!(
    /// Private or group conversation.
    ConversationId
);
uuid_id!(MessageId);
uuid_id!(
    /// One live WebSocket. A user may hold several at once (tabs, devices).
    ConnectionId
);

/// A named broadcast group that live connections join and leave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Room {
    /// Identity room: every connection of one user.
    User(UserId),
    /// Everyone currently viewing a conversation.
    Conversation(ConversationId),
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Room::User(id) => write!(f, "user:{}", id),
            Room::Conversation(id) => write!(f, "chat:{}", id),
        }
    }
}

impl From<UserId> for Room {
    fn from(id: UserId) -> Self {
        Room::User(id)
    }
}

impl From<ConversationId> for Room {
    fn from(id: ConversationId) -> Self {
        Room::Conversation(id)
    }
}

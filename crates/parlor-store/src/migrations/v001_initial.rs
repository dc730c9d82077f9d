//! v001 -- Initial schema creation.
//!
//! Users and the friend graph, conversations with their membership rows,
//! messages, and read markers.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id         TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    username   TEXT NOT NULL UNIQUE,
    email      TEXT NOT NULL UNIQUE,        -- lowercased
    is_online  INTEGER NOT NULL DEFAULT 0,  -- persisted presence mirror
    last_seen  TEXT NOT NULL,               -- RFC-3339, microseconds
    created_at TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Friend graph. Friendships hold both directions.
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS friendships (
    user_id    TEXT NOT NULL,
    friend_id  TEXT NOT NULL,
    created_at TEXT NOT NULL,

    PRIMARY KEY (user_id, friend_id),
    FOREIGN KEY (user_id)   REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (friend_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS friend_requests (
    sender_id   TEXT NOT NULL,
    receiver_id TEXT NOT NULL,
    created_at  TEXT NOT NULL,

    PRIMARY KEY (sender_id, receiver_id),
    FOREIGN KEY (sender_id)   REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (receiver_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_friend_requests_receiver ON friend_requests(receiver_id);

-- ----------------------------------------------------------------
-- Conversations
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id              TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    is_group        INTEGER NOT NULL,
    name            TEXT,                       -- required for groups
    pair_key        TEXT UNIQUE,                -- "<min>:<max>" for private chats
    last_message_id TEXT,
    last_message_at TEXT,
    last_seq        INTEGER NOT NULL DEFAULT 0, -- highest message seq
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS conversation_members (
    conversation_id TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    is_admin        INTEGER NOT NULL DEFAULT 0,
    joined_at       TEXT NOT NULL,

    PRIMARY KEY (conversation_id, user_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE,
    FOREIGN KEY (user_id)         REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_members_user ON conversation_members(user_id);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    conversation_id TEXT NOT NULL,
    sender_id       TEXT NOT NULL,
    seq             INTEGER NOT NULL,           -- per-conversation order
    text            TEXT,
    attachments     TEXT NOT NULL DEFAULT '[]', -- JSON [{url, kind}]
    created_at      TEXT NOT NULL,

    UNIQUE (conversation_id, seq),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE,
    FOREIGN KEY (sender_id)       REFERENCES users(id)
);

CREATE TABLE IF NOT EXISTS message_reads (
    message_id TEXT NOT NULL,
    user_id    TEXT NOT NULL,
    read_at    TEXT NOT NULL,

    PRIMARY KEY (message_id, user_id),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE,
    FOREIGN KEY (user_id)    REFERENCES users(id) ON DELETE CASCADE
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}

//! CRUD operations for [`User`] records and their persisted presence mirror.

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter};

use parlor_shared::UserId;

use crate::database::Database;
use crate::error::{or_not_found, Result, StoreError};
use crate::models::{PresenceRecord, User, UserSummary};
use crate::sql::{self, parse_ts, parse_uuid, placeholders};

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Register a new account. Usernames are trimmed, emails trimmed and
    /// lowercased; both must be unique.
    pub fn create_user(&self, username: &str, email: &str) -> Result<User> {
        let username = username.trim();
        let email = email.trim().to_lowercase();
        if username.is_empty() {
            return Err(StoreError::Validation("username is required".into()));
        }
        if email.is_empty() || !email.contains('@') {
            return Err(StoreError::Validation("a valid email is required".into()));
        }

        let taken: bool = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE username = ?1 OR email = ?2)",
            params![username, email],
            |row| row.get(0),
        )?;
        if taken {
            return Err(StoreError::Conflict("username or email already taken".into()));
        }

        let now = sql::now();
        let user = User {
            id: UserId::new(),
            username: username.to_string(),
            email,
            online: false,
            last_seen: now,
            created_at: now,
        };

        self.conn().execute(
            "INSERT INTO users (id, username, email, is_online, last_seen, created_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?5)",
            params![
                user.id.to_string(),
                user.username,
                user.email,
                sql::ts(&user.last_seen),
                sql::ts(&user.created_at),
            ],
        )?;

        tracing::debug!(user = %user.id, username = %user.username, "created user");
        Ok(user)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_user(&self, id: UserId) -> Result<User> {
        self.conn()
            .query_row(
                "SELECT id, username, email, is_online, last_seen, created_at
                 FROM users WHERE id = ?1",
                params![id.to_string()],
                row_to_user,
            )
            .map_err(or_not_found("user"))
    }

    pub fn user_summary(&self, id: UserId) -> Result<UserSummary> {
        self.conn()
            .query_row(
                "SELECT id, username, email FROM users WHERE id = ?1",
                params![id.to_string()],
                |row| summary_at(row, 0),
            )
            .map_err(or_not_found("user"))
    }

    pub fn user_exists(&self, id: UserId) -> Result<bool> {
        let exists = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Fail with `NotFound` unless every id resolves to a user.
    pub(crate) fn ensure_users_exist(&self, ids: &[UserId]) -> Result<()> {
        for id in ids {
            if !self.user_exists(*id)? {
                return Err(StoreError::NotFound(format!("user {id}")));
            }
        }
        Ok(())
    }

    /// Persisted presence for the given users, in no particular order.
    /// Unknown ids are skipped.
    pub fn presence_of(&self, ids: &[UserId]) -> Result<Vec<PresenceRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let query = format!(
            "SELECT id, username, is_online, last_seen FROM users WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut stmt = self.conn().prepare(&query)?;
        let rows = stmt.query_map(params_from_iter(ids.iter().map(|id| id.to_string())), |row| {
            let id: String = row.get(0)?;
            let last_seen: String = row.get(3)?;
            Ok(PresenceRecord {
                user_id: UserId(parse_uuid(0, &id)?),
                username: row.get(1)?,
                online: row.get(2)?,
                last_seen: parse_ts(3, &last_seen)?,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    // ------------------------------------------------------------------
    // Presence mirror
    // ------------------------------------------------------------------

    /// Write the presence mirror unless a newer value is already stored.
    ///
    /// Write-through tasks may land out of order. A write applies only if
    /// its `(last_seen, seq)` pair is strictly greater than the stored one,
    /// so an old "online" never overwrites a later "offline" even when both
    /// carry the same timestamp. Returns `false` when the write was skipped
    /// as stale.
    pub fn set_presence(
        &self,
        id: UserId,
        online: bool,
        last_seen: DateTime<Utc>,
        seq: u64,
    ) -> Result<bool> {
        let stamp = sql::ts(&last_seen);
        let seq = i64::try_from(seq).unwrap_or(i64::MAX);
        let affected = self.conn().execute(
            "UPDATE users SET is_online = ?1, last_seen = ?2, presence_seq = ?3
             WHERE id = ?4
               AND (last_seen < ?2 OR (last_seen = ?2 AND presence_seq < ?3))",
            params![online, stamp, seq, id.to_string()],
        )?;
        if affected == 0 && !self.user_exists(id)? {
            return Err(StoreError::NotFound(format!("user {id}")));
        }
        Ok(affected > 0)
    }

    /// Mark every user offline. Run once at startup: nobody can be
    /// connected to a process that just started.
    pub fn reset_presence(&self) -> Result<usize> {
        let affected = self
            .conn()
            .execute("UPDATE users SET is_online = 0 WHERE is_online = 1", [])?;
        Ok(affected)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` to a [`User`].
fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let id: String = row.get(0)?;
    let last_seen: String = row.get(4)?;
    let created_at: String = row.get(5)?;

    Ok(User {
        id: UserId(parse_uuid(0, &id)?),
        username: row.get(1)?,
        email: row.get(2)?,
        online: row.get(3)?,
        last_seen: parse_ts(4, &last_seen)?,
        created_at: parse_ts(5, &created_at)?,
    })
}

/// Read `id, username, email` starting at column `start`.
pub(crate) fn summary_at(row: &rusqlite::Row<'_>, start: usize) -> rusqlite::Result<UserSummary> {
    let id: String = row.get(start)?;
    Ok(UserSummary {
        id: UserId(parse_uuid(start, &id)?),
        username: row.get(start + 1)?,
        email: row.get(start + 2)?,
    })
}

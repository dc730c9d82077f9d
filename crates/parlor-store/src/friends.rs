//! Friend graph operations.
//!
//! Requests live in `friend_requests` until accepted or rejected; an
//! accepted request becomes two rows in `friendships`. The pair invariant
//! (no crossing requests, no request between friends) is checked before
//! every insert.

use rusqlite::params;

use parlor_shared::UserId;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{FriendOverview, UserSummary};
use crate::sql::{self, parse_uuid};
use crate::users::summary_at;

impl Database {
    /// Send a friend request from `from` to `to`.
    pub fn send_friend_request(&self, from: UserId, to: UserId) -> Result<()> {
        if from == to {
            return Err(StoreError::Validation("cannot befriend yourself".into()));
        }
        self.ensure_users_exist(&[from, to])?;

        if self.are_friends(from, to)? {
            return Err(StoreError::Conflict("already friends".into()));
        }
        if self.request_exists(from, to)? || self.request_exists(to, from)? {
            return Err(StoreError::Conflict("request already pending".into()));
        }

        self.conn().execute(
            "INSERT INTO friend_requests (sender_id, receiver_id, created_at)
             VALUES (?1, ?2, ?3)",
            params![from.to_string(), to.to_string(), sql::ts(&sql::now())],
        )?;
        tracing::debug!(from = %from, to = %to, "friend request sent");
        Ok(())
    }

    /// `receiver` accepts the pending request sent by `sender`.
    pub fn accept_friend_request(&self, receiver: UserId, sender: UserId) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;

        let removed = tx.execute(
            "DELETE FROM friend_requests WHERE sender_id = ?1 AND receiver_id = ?2",
            params![sender.to_string(), receiver.to_string()],
        )?;
        if removed == 0 {
            return Err(StoreError::Validation("no such friend request".into()));
        }

        let now = sql::ts(&sql::now());
        for (a, b) in [(receiver, sender), (sender, receiver)] {
            tx.execute(
                "INSERT OR IGNORE INTO friendships (user_id, friend_id, created_at)
                 VALUES (?1, ?2, ?3)",
                params![a.to_string(), b.to_string(), now],
            )?;
        }

        tx.commit()?;
        tracing::debug!(receiver = %receiver, sender = %sender, "friend request accepted");
        Ok(())
    }

    /// `receiver` declines the request from `sender`. Returns whether a
    /// pending request was actually removed.
    pub fn reject_friend_request(&self, receiver: UserId, sender: UserId) -> Result<bool> {
        let removed = self.conn().execute(
            "DELETE FROM friend_requests WHERE sender_id = ?1 AND receiver_id = ?2",
            params![sender.to_string(), receiver.to_string()],
        )?;
        Ok(removed > 0)
    }

    pub fn are_friends(&self, a: UserId, b: UserId) -> Result<bool> {
        let yes = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM friendships WHERE user_id = ?1 AND friend_id = ?2)",
            params![a.to_string(), b.to_string()],
            |row| row.get(0),
        )?;
        Ok(yes)
    }

    fn request_exists(&self, sender: UserId, receiver: UserId) -> Result<bool> {
        let yes = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM friend_requests WHERE sender_id = ?1 AND receiver_id = ?2)",
            params![sender.to_string(), receiver.to_string()],
            |row| row.get(0),
        )?;
        Ok(yes)
    }

    /// Ids of every friend of `user`.
    pub fn friends_of(&self, user: UserId) -> Result<Vec<UserId>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT friend_id FROM friendships WHERE user_id = ?1")?;
        let rows = stmt.query_map(params![user.to_string()], |row| {
            let id: String = row.get(0)?;
            Ok(UserId(parse_uuid(0, &id)?))
        })?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    pub fn friend_overview(&self, user: UserId) -> Result<FriendOverview> {
        let key = user.to_string();
        Ok(FriendOverview {
            friends: self.summaries(
                "SELECT u.id, u.username, u.email FROM friendships f
                 JOIN users u ON u.id = f.friend_id
                 WHERE f.user_id = ?1 ORDER BY u.username ASC",
                &key,
            )?,
            incoming: self.summaries(
                "SELECT u.id, u.username, u.email FROM friend_requests r
                 JOIN users u ON u.id = r.sender_id
                 WHERE r.receiver_id = ?1 ORDER BY r.created_at ASC",
                &key,
            )?,
            outgoing: self.summaries(
                "SELECT u.id, u.username, u.email FROM friend_requests r
                 JOIN users u ON u.id = r.receiver_id
                 WHERE r.sender_id = ?1 ORDER BY r.created_at ASC",
                &key,
            )?,
        })
    }

    /// Users with no relation to `user` at all, capped at `limit`.
    pub fn friend_suggestions(&self, user: UserId, limit: usize) -> Result<Vec<UserSummary>> {
        let mut stmt = self.conn().prepare(
            "SELECT u.id, u.username, u.email FROM users u
             WHERE u.id != ?1
               AND u.id NOT IN (SELECT friend_id FROM friendships WHERE user_id = ?1)
               AND u.id NOT IN (SELECT sender_id FROM friend_requests WHERE receiver_id = ?1)
               AND u.id NOT IN (SELECT receiver_id FROM friend_requests WHERE sender_id = ?1)
             ORDER BY u.username ASC
             LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![user.to_string(), limit], |row| summary_at(row, 0))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn summaries(&self, query: &str, key: &str) -> Result<Vec<UserSummary>> {
        let mut stmt = self.conn().prepare(query)?;
        let rows = stmt.query_map(params![key], |row| summary_at(row, 0))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;

    fn setup() -> (Database, User, User, User) {
        let db = Database::open_in_memory().unwrap();
        let a = db.create_user("alice", "alice@example.com").unwrap();
        let b = db.create_user("bob", "bob@example.com").unwrap();
        let c = db.create_user("carol", "carol@example.com").unwrap();
        (db, a, b, c)
    }

    #[test]
    fn test_request_accept_makes_mutual_friends() {
        let (db, a, b, _) = setup();
        db.send_friend_request(a.id, b.id).unwrap();

        let overview = db.friend_overview(b.id).unwrap();
        assert_eq!(overview.incoming.len(), 1);
        assert_eq!(overview.incoming[0].id, a.id);
        assert_eq!(db.friend_overview(a.id).unwrap().outgoing[0].id, b.id);

        db.accept_friend_request(b.id, a.id).unwrap();
        assert_eq!(db.friends_of(a.id).unwrap(), vec![b.id]);
        assert_eq!(db.friends_of(b.id).unwrap(), vec![a.id]);

        // Pending request is gone once accepted.
        let overview = db.friend_overview(b.id).unwrap();
        assert!(overview.incoming.is_empty());
        assert_eq!(overview.friends.len(), 1);
    }

    #[test]
    fn test_crossing_requests_rejected() {
        let (db, a, b, _) = setup();
        db.send_friend_request(a.id, b.id).unwrap();

        assert!(matches!(
            db.send_friend_request(b.id, a.id),
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            db.send_friend_request(a.id, b.id),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn test_no_request_between_friends() {
        let (db, a, b, _) = setup();
        db.send_friend_request(a.id, b.id).unwrap();
        db.accept_friend_request(b.id, a.id).unwrap();

        assert!(matches!(
            db.send_friend_request(b.id, a.id),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn test_self_and_unknown_targets() {
        let (db, a, _, _) = setup();
        assert!(matches!(
            db.send_friend_request(a.id, a.id),
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            db.send_friend_request(a.id, UserId::new()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_accept_without_request_fails() {
        let (db, a, b, _) = setup();
        assert!(matches!(
            db.accept_friend_request(b.id, a.id),
            Err(StoreError::Validation(_))
        ));
        assert!(db.friends_of(a.id).unwrap().is_empty());
    }

    #[test]
    fn test_reject_removes_request() {
        let (db, a, b, _) = setup();
        db.send_friend_request(a.id, b.id).unwrap();

        assert!(db.reject_friend_request(b.id, a.id).unwrap());
        assert!(!db.reject_friend_request(b.id, a.id).unwrap());
        assert!(db.friend_overview(a.id).unwrap().outgoing.is_empty());
        assert!(db.friends_of(b.id).unwrap().is_empty());
    }

    #[test]
    fn test_suggestions_exclude_related_users() {
        let (db, a, b, c) = setup();
        db.send_friend_request(a.id, b.id).unwrap();

        let suggestions = db.friend_suggestions(a.id, 10).unwrap();
        let ids: Vec<_> = suggestions.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![c.id]);

        assert!(db.friend_suggestions(c.id, 1).unwrap().len() == 1);
    }
}

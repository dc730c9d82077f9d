//! Conversations and their membership.
//!
//! A private conversation is keyed by the sorted pair of its participants
//! (`pair_key`), which makes "one private chat per pair" a unique index
//! instead of a check-then-insert race. Group admins are the members whose
//! `is_admin` flag is set; the store refuses any change that would leave a
//! group without one.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use parlor_shared::constants::MAX_GROUP_NAME_CHARS;
use parlor_shared::{ConversationId, MessageId, UserId};

use crate::database::Database;
use crate::error::{or_not_found, Result, StoreError};
use crate::models::{Conversation, UserSummary};
use crate::sql::{self, parse_ts, parse_uuid};
use crate::users::summary_at;

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Return the private conversation between `a` and `b`, creating it on
    /// first use.
    pub fn create_private(&self, a: UserId, b: UserId) -> Result<Conversation> {
        self.open_private(a, b).map(|(conversation, _)| conversation)
    }

    /// Like [`Database::create_private`], also reporting whether this call
    /// created the conversation.
    pub fn open_private(&self, a: UserId, b: UserId) -> Result<(Conversation, bool)> {
        if a == b {
            return Err(StoreError::Validation(
                "a private chat needs two different users".into(),
            ));
        }
        self.ensure_users_exist(&[a, b])?;

        let key = pair_key(a, b);
        if let Some(id) = self.private_by_pair(&key)? {
            return Ok((self.get_conversation(id)?, false));
        }

        let id = ConversationId::new();
        let now = sql::ts(&sql::now());
        let tx = self.conn().unchecked_transaction()?;
        // A concurrent creator may have won between the lookup and here.
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO conversations (id, is_group, name, pair_key, created_at, updated_at)
             VALUES (?1, 0, NULL, ?2, ?3, ?3)",
            params![id.to_string(), key, now],
        )?;
        if inserted == 0 {
            drop(tx);
            let existing = self
                .private_by_pair(&key)?
                .ok_or_else(|| StoreError::NotFound("conversation".into()))?;
            return Ok((self.get_conversation(existing)?, false));
        }
        for user in [a, b] {
            tx.execute(
                "INSERT INTO conversation_members (conversation_id, user_id, is_admin, joined_at)
                 VALUES (?1, ?2, 0, ?3)",
                params![id.to_string(), user.to_string(), now],
            )?;
        }
        tx.commit()?;

        tracing::debug!(conversation = %id, "created private conversation");
        Ok((self.get_conversation(id)?, true))
    }

    /// Create a group administered by `creator`.
    pub fn create_group(
        &self,
        creator: UserId,
        name: &str,
        participant_ids: &[UserId],
    ) -> Result<Conversation> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::Validation("group name is required".into()));
        }
        if name.chars().count() > MAX_GROUP_NAME_CHARS {
            return Err(StoreError::Validation(format!(
                "group name is longer than {MAX_GROUP_NAME_CHARS} characters"
            )));
        }

        let others: BTreeSet<UserId> = participant_ids
            .iter()
            .copied()
            .filter(|id| *id != creator)
            .collect();
        if others.is_empty() {
            return Err(StoreError::Validation(
                "at least one participant is required".into(),
            ));
        }

        self.ensure_users_exist(&[creator])?;
        let others: Vec<UserId> = others.into_iter().collect();
        self.ensure_users_exist(&others)?;

        let duplicate: bool = self.conn().query_row(
            "SELECT EXISTS(
                SELECT 1 FROM conversations c
                JOIN conversation_members m ON m.conversation_id = c.id
                WHERE c.is_group = 1 AND c.name = ?1 AND m.user_id = ?2 AND m.is_admin = 1)",
            params![name, creator.to_string()],
            |row| row.get(0),
        )?;
        if duplicate {
            return Err(StoreError::Conflict(
                "you already have a group with this name".into(),
            ));
        }

        let id = ConversationId::new();
        let now = sql::ts(&sql::now());
        let tx = self.conn().unchecked_transaction()?;
        tx.execute(
            "INSERT INTO conversations (id, is_group, name, pair_key, created_at, updated_at)
             VALUES (?1, 1, ?2, NULL, ?3, ?3)",
            params![id.to_string(), name, now],
        )?;
        tx.execute(
            "INSERT INTO conversation_members (conversation_id, user_id, is_admin, joined_at)
             VALUES (?1, ?2, 1, ?3)",
            params![id.to_string(), creator.to_string(), now],
        )?;
        for user in &others {
            tx.execute(
                "INSERT INTO conversation_members (conversation_id, user_id, is_admin, joined_at)
                 VALUES (?1, ?2, 0, ?3)",
                params![id.to_string(), user.to_string(), now],
            )?;
        }
        tx.commit()?;

        tracing::debug!(conversation = %id, name, members = others.len() + 1, "created group");
        self.get_conversation(id)
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Add users to a group. Returns the updated conversation together with
    /// the ids that were actually added (already present ids are skipped).
    pub fn add_participants(
        &self,
        conversation_id: ConversationId,
        requester: UserId,
        new_ids: &[UserId],
    ) -> Result<(Conversation, Vec<UserId>)> {
        let conversation = self.get_conversation(conversation_id)?;
        if !conversation.is_group {
            return Err(StoreError::Validation(
                "cannot add participants to a private chat".into(),
            ));
        }
        if !conversation.is_admin(&requester) {
            return Err(StoreError::Permission(
                "only admins can add participants".into(),
            ));
        }

        let to_add: Vec<UserId> = new_ids
            .iter()
            .copied()
            .filter(|id| !conversation.has_participant(id))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if to_add.is_empty() {
            return Err(StoreError::Validation(
                "all users are already in the group".into(),
            ));
        }
        self.ensure_users_exist(&to_add)?;

        let now = sql::ts(&sql::now());
        let tx = self.conn().unchecked_transaction()?;
        for user in &to_add {
            tx.execute(
                "INSERT OR IGNORE INTO conversation_members (conversation_id, user_id, is_admin, joined_at)
                 VALUES (?1, ?2, 0, ?3)",
                params![conversation_id.to_string(), user.to_string(), now],
            )?;
        }
        touch(&tx, conversation_id, &now)?;
        tx.commit()?;

        tracing::debug!(conversation = %conversation_id, added = to_add.len(), "participants added");
        Ok((self.get_conversation(conversation_id)?, to_add))
    }

    /// Remove `target` from a group. Admins may remove anyone; everyone may
    /// remove themselves. The last admin can never leave.
    pub fn remove_participant(
        &self,
        conversation_id: ConversationId,
        requester: UserId,
        target: UserId,
    ) -> Result<Conversation> {
        let conversation = self.get_conversation(conversation_id)?;
        if !conversation.is_group {
            return Err(StoreError::Validation(
                "cannot remove participants from a private chat".into(),
            ));
        }
        if !conversation.is_admin(&requester) && requester != target {
            return Err(StoreError::Permission("not authorized".into()));
        }
        if !conversation.has_participant(&target) {
            return Err(StoreError::Validation("user is not in this group".into()));
        }
        if conversation.is_admin(&target) && conversation.admins.len() == 1 {
            return Err(StoreError::Validation("cannot remove the only admin".into()));
        }

        let now = sql::ts(&sql::now());
        let tx = self.conn().unchecked_transaction()?;
        tx.execute(
            "DELETE FROM conversation_members WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation_id.to_string(), target.to_string()],
        )?;
        touch(&tx, conversation_id, &now)?;
        tx.commit()?;

        tracing::debug!(conversation = %conversation_id, user = %target, "participant removed");
        self.get_conversation(conversation_id)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_conversation(&self, id: ConversationId) -> Result<Conversation> {
        let row = self
            .conn()
            .query_row(
                "SELECT id, is_group, name, last_message_id, last_message_at, created_at, updated_at
                 FROM conversations WHERE id = ?1",
                params![id.to_string()],
                row_to_conversation,
            )
            .map_err(or_not_found("conversation"))?;

        let members = self.members_of(id)?;
        Ok(Conversation {
            participants: members.participants,
            admins: members.admins,
            members: members.profiles,
            ..row
        })
    }

    /// Like [`get_conversation`](Self::get_conversation) but only for a
    /// participant.
    pub fn get_conversation_for(&self, id: ConversationId, viewer: UserId) -> Result<Conversation> {
        let conversation = self.get_conversation(id)?;
        if !conversation.has_participant(&viewer) {
            return Err(StoreError::Permission("access denied".into()));
        }
        Ok(conversation)
    }

    /// Every conversation `user` belongs to, most recently active first.
    pub fn list_conversations_for(&self, user: UserId) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn().prepare(
            "SELECT c.id FROM conversations c
             JOIN conversation_members m ON m.conversation_id = c.id
             WHERE m.user_id = ?1
             ORDER BY COALESCE(c.last_message_at, c.updated_at) DESC",
        )?;
        let rows = stmt.query_map(params![user.to_string()], |row| {
            let id: String = row.get(0)?;
            Ok(ConversationId(parse_uuid(0, &id)?))
        })?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }

        let mut conversations = Vec::with_capacity(ids.len());
        for id in ids {
            conversations.push(self.get_conversation(id)?);
        }
        Ok(conversations)
    }

    pub fn is_participant(&self, conversation_id: ConversationId, user: UserId) -> Result<bool> {
        let yes = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM conversation_members
                           WHERE conversation_id = ?1 AND user_id = ?2)",
            params![conversation_id.to_string(), user.to_string()],
            |row| row.get(0),
        )?;
        Ok(yes)
    }

    fn private_by_pair(&self, key: &str) -> Result<Option<ConversationId>> {
        let id: Option<String> = self
            .conn()
            .query_row(
                "SELECT id FROM conversations WHERE pair_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        id.map(|s| parse_uuid(0, &s).map(ConversationId))
            .transpose()
            .map_err(StoreError::from)
    }

    fn members_of(&self, id: ConversationId) -> Result<Members> {
        let mut stmt = self.conn().prepare(
            "SELECT u.id, u.username, u.email, m.is_admin
             FROM conversation_members m
             JOIN users u ON u.id = m.user_id
             WHERE m.conversation_id = ?1
             ORDER BY u.username ASC",
        )?;
        let rows = stmt.query_map(params![id.to_string()], |row| {
            Ok((summary_at(row, 0)?, row.get::<_, bool>(3)?))
        })?;

        let mut members = Members::default();
        for row in rows {
            let (user, is_admin) = row?;
            members.participants.insert(user.id);
            if is_admin {
                members.admins.insert(user.id);
            }
            members.profiles.push(user);
        }
        Ok(members)
    }
}

#[derive(Default)]
struct Members {
    participants: BTreeSet<UserId>,
    admins: BTreeSet<UserId>,
    profiles: Vec<UserSummary>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Order-independent key for the private conversation of a pair.
fn pair_key(a: UserId, b: UserId) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}:{hi}")
}

fn touch(conn: &rusqlite::Connection, id: ConversationId, now: &str) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
        params![now, id.to_string()],
    )
}

/// Map a `rusqlite::Row` to a [`Conversation`] with empty member sets.
fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let id: String = row.get(0)?;
    let last_message_id: Option<String> = row.get(3)?;
    let last_message_at: Option<String> = row.get(4)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;

    let last_message_at: Option<DateTime<Utc>> =
        last_message_at.map(|s| parse_ts(4, &s)).transpose()?;

    Ok(Conversation {
        id: ConversationId(parse_uuid(0, &id)?),
        is_group: row.get(1)?,
        name: row.get(2)?,
        participants: BTreeSet::new(),
        admins: BTreeSet::new(),
        members: Vec::new(),
        last_message_id: last_message_id
            .map(|s| parse_uuid(3, &s).map(MessageId))
            .transpose()?,
        last_message_at,
        created_at: parse_ts(5, &created_at)?,
        updated_at: parse_ts(6, &updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;

    struct Fixture {
        db: Database,
        a: User,
        b: User,
        c: User,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let a = db.create_user("alice", "alice@example.com").unwrap();
        let b = db.create_user("bob", "bob@example.com").unwrap();
        let c = db.create_user("carol", "carol@example.com").unwrap();
        Fixture { db, a, b, c }
    }

    #[test]
    fn test_private_chat_is_idempotent_in_both_directions() {
        let f = fixture();
        let first = f.db.create_private(f.a.id, f.b.id).unwrap();
        let second = f.db.create_private(f.a.id, f.b.id).unwrap();
        let reversed = f.db.create_private(f.b.id, f.a.id).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.id, reversed.id);
        assert!(!first.is_group);
        assert!(first.admins.is_empty());
        assert_eq!(first.participants, BTreeSet::from([f.a.id, f.b.id]));
    }

    #[test]
    fn test_open_private_reports_creation() {
        let f = fixture();
        let (chat, created) = f.db.open_private(f.a.id, f.c.id).unwrap();
        assert!(created);
        let (again, created) = f.db.open_private(f.c.id, f.a.id).unwrap();
        assert!(!created);
        assert_eq!(chat.id, again.id);
    }

    #[test]
    fn test_members_carry_profiles() {
        let f = fixture();
        let group = f.db.create_group(f.b.id, "Readers", &[f.c.id, f.a.id]).unwrap();

        let names: Vec<&str> = group.members.iter().map(|m| m.username.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob", "carol"]);
        let admin = group.member(&f.b.id).unwrap();
        assert_eq!(admin.email, "bob@example.com");
        assert!(group.is_admin(&admin.id));

        let updated = f.db.remove_participant(group.id, f.c.id, f.c.id).unwrap();
        assert!(updated.member(&f.c.id).is_none());
        assert_eq!(updated.members.len(), updated.participants.len());
    }

    #[test]
    fn test_private_chat_rejects_self_and_unknown() {
        let f = fixture();
        assert!(matches!(
            f.db.create_private(f.a.id, f.a.id),
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            f.db.create_private(f.a.id, UserId::new()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_create_group_adds_creator_as_admin() {
        let f = fixture();
        let group = f.db.create_group(f.a.id, "  Team ", &[f.b.id, f.c.id]).unwrap();

        assert!(group.is_group);
        assert_eq!(group.name.as_deref(), Some("Team"));
        assert_eq!(group.participants, BTreeSet::from([f.a.id, f.b.id, f.c.id]));
        assert_eq!(group.admins, BTreeSet::from([f.a.id]));
    }

    #[test]
    fn test_create_group_validation() {
        let f = fixture();
        assert!(matches!(
            f.db.create_group(f.a.id, "   ", &[f.b.id]),
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            f.db.create_group(f.a.id, "Team", &[]),
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            f.db.create_group(f.a.id, "Team", &[f.a.id]),
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            f.db.create_group(f.a.id, "Team", &[f.b.id, UserId::new()]),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_group_name_unique_per_admin() {
        let f = fixture();
        f.db.create_group(f.a.id, "Team", &[f.b.id]).unwrap();

        assert!(matches!(
            f.db.create_group(f.a.id, "Team", &[f.c.id]),
            Err(StoreError::Conflict(_))
        ));
        // Another admin may reuse the name.
        f.db.create_group(f.b.id, "Team", &[f.c.id]).unwrap();
    }

    #[test]
    fn test_add_participants() {
        let f = fixture();
        let group = f.db.create_group(f.a.id, "Team", &[f.b.id]).unwrap();

        let (updated, added) = f
            .db
            .add_participants(group.id, f.a.id, &[f.b.id, f.c.id, f.c.id])
            .unwrap();
        assert_eq!(added, vec![f.c.id]);
        assert!(updated.has_participant(&f.c.id));

        assert!(matches!(
            f.db.add_participants(group.id, f.a.id, &[f.c.id]),
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            f.db.add_participants(group.id, f.b.id, &[UserId::new()]),
            Err(StoreError::Permission(_))
        ));
        assert!(matches!(
            f.db.add_participants(group.id, f.a.id, &[UserId::new()]),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_add_to_private_chat_rejected() {
        let f = fixture();
        let private = f.db.create_private(f.a.id, f.b.id).unwrap();
        assert!(matches!(
            f.db.add_participants(private.id, f.a.id, &[f.c.id]),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn test_sole_admin_cannot_be_removed() {
        let f = fixture();
        let group = f.db.create_group(f.a.id, "Team", &[f.b.id, f.c.id]).unwrap();

        assert!(matches!(
            f.db.remove_participant(group.id, f.a.id, f.a.id),
            Err(StoreError::Validation(_))
        ));
        let unchanged = f.db.get_conversation(group.id).unwrap();
        assert_eq!(unchanged.admins, BTreeSet::from([f.a.id]));
    }

    #[test]
    fn test_non_sole_admin_removal_shrinks_admins_by_one() {
        let f = fixture();
        let group = f.db.create_group(f.a.id, "Team", &[f.b.id, f.c.id]).unwrap();
        f.db.conn()
            .execute(
                "UPDATE conversation_members SET is_admin = 1 WHERE conversation_id = ?1 AND user_id = ?2",
                params![group.id.to_string(), f.b.id.to_string()],
            )
            .unwrap();
        assert_eq!(f.db.get_conversation(group.id).unwrap().admins.len(), 2);

        let updated = f.db.remove_participant(group.id, f.a.id, f.a.id).unwrap();
        assert_eq!(updated.admins, BTreeSet::from([f.b.id]));
        assert!(!updated.has_participant(&f.a.id));
    }

    #[test]
    fn test_remove_permissions() {
        let f = fixture();
        let group = f.db.create_group(f.a.id, "Team", &[f.b.id, f.c.id]).unwrap();

        assert!(matches!(
            f.db.remove_participant(group.id, f.b.id, f.c.id),
            Err(StoreError::Permission(_))
        ));

        // Members may leave on their own.
        let updated = f.db.remove_participant(group.id, f.c.id, f.c.id).unwrap();
        assert!(!updated.has_participant(&f.c.id));

        assert!(matches!(
            f.db.remove_participant(group.id, f.a.id, f.c.id),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn test_list_and_access_control() {
        let f = fixture();
        let private = f.db.create_private(f.a.id, f.b.id).unwrap();
        let group = f.db.create_group(f.a.id, "Team", &[f.c.id]).unwrap();

        let mine = f.db.list_conversations_for(f.a.id).unwrap();
        assert_eq!(mine.len(), 2);
        let bobs = f.db.list_conversations_for(f.b.id).unwrap();
        assert_eq!(bobs.iter().map(|c| c.id).collect::<Vec<_>>(), vec![private.id]);

        assert!(f.db.get_conversation_for(group.id, f.c.id).is_ok());
        assert!(matches!(
            f.db.get_conversation_for(group.id, f.b.id),
            Err(StoreError::Permission(_))
        ));
        assert!(matches!(
            f.db.get_conversation(ConversationId::new()),
            Err(StoreError::NotFound(_))
        ));
    }
}

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use parlor_shared::constants::{MAX_ATTACHMENTS, MAX_MESSAGE_CHARS};
use parlor_shared::{ConversationId, MessageId, UserId};

use crate::database::Database;
use crate::error::{or_not_found, Result, StoreError};
use crate::models::{Attachment, Message, ReadReceipt};
use crate::sql::{self, parse_ts, parse_uuid};
use crate::users::summary_at;

impl Database {
    /// Persist a message and advance the conversation's last-message
    /// pointer in the same transaction.
    ///
    /// `created_at` never goes backwards within a conversation even if the
    /// wall clock does; the per-conversation `seq` is the real order.
    pub fn append_message(
        &self,
        conversation_id: ConversationId,
        sender: UserId,
        text: Option<String>,
        attachments: Vec<Attachment>,
    ) -> Result<Message> {
        let text = text
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        if text.is_none() && attachments.is_empty() {
            return Err(StoreError::Validation(
                "message needs text or at least one attachment".into(),
            ));
        }
        if text.as_ref().map_or(false, |t| t.chars().count() > MAX_MESSAGE_CHARS) {
            return Err(StoreError::Validation(format!(
                "message is longer than {MAX_MESSAGE_CHARS} characters"
            )));
        }
        if attachments.len() > MAX_ATTACHMENTS {
            return Err(StoreError::Validation(format!(
                "at most {MAX_ATTACHMENTS} attachments per message"
            )));
        }
        if attachments.iter().any(|a| a.url.trim().is_empty()) {
            return Err(StoreError::Validation("attachment url is required".into()));
        }

        let tx = self.conn().unchecked_transaction()?;

        let (last_seq, last_at): (i64, Option<String>) = tx
            .query_row(
                "SELECT last_seq, last_message_at FROM conversations WHERE id = ?1",
                params![conversation_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(or_not_found("conversation"))?;

        let is_member: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM conversation_members
                           WHERE conversation_id = ?1 AND user_id = ?2)",
            params![conversation_id.to_string(), sender.to_string()],
            |row| row.get(0),
        )?;
        if !is_member {
            return Err(StoreError::Permission(
                "sender is not a participant of this conversation".into(),
            ));
        }

        let sender_profile = tx.query_row(
            "SELECT id, username, email FROM users WHERE id = ?1",
            params![sender.to_string()],
            |row| summary_at(row, 0),
        )?;

        let mut created_at = sql::now();
        if let Some(prev) = last_at.as_deref() {
            let prev = parse_ts(0, prev)?;
            if prev > created_at {
                created_at = prev;
            }
        }
        let stamp = sql::ts(&created_at);
        let seq = last_seq + 1;

        let message = Message {
            id: MessageId::new(),
            conversation_id,
            sender: sender_profile,
            text,
            attachments,
            read_by: BTreeSet::new(),
            created_at,
        };

        tx.execute(
            "INSERT INTO messages (id, conversation_id, sender_id, seq, text, attachments, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id.to_string(),
                conversation_id.to_string(),
                sender.to_string(),
                seq,
                message.text,
                serde_json::to_string(&message.attachments)?,
                stamp,
            ],
        )?;
        tx.execute(
            "UPDATE conversations
             SET last_seq = ?1, last_message_id = ?2, last_message_at = ?3, updated_at = ?3
             WHERE id = ?4",
            params![seq, message.id.to_string(), stamp, conversation_id.to_string()],
        )?;
        tx.commit()?;

        tracing::debug!(
            conversation = %conversation_id,
            message = %message.id,
            seq,
            "message stored"
        );
        Ok(message)
    }

    /// Record that `user` read `message_id`. Idempotent: a repeat call
    /// succeeds with `changed == false`.
    pub fn mark_read(&self, message_id: MessageId, user: UserId) -> Result<ReadReceipt> {
        let conversation_id = self.message_conversation(message_id)?;

        if !self.is_participant(conversation_id, user)? {
            return Err(StoreError::Permission(
                "not a participant of this conversation".into(),
            ));
        }

        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at)
             VALUES (?1, ?2, ?3)",
            params![message_id.to_string(), user.to_string(), sql::ts(&sql::now())],
        )?;

        Ok(ReadReceipt {
            conversation_id,
            changed: inserted > 0,
        })
    }

    /// The conversation a message belongs to.
    pub fn message_conversation(&self, message_id: MessageId) -> Result<ConversationId> {
        let conversation: Option<String> = self
            .conn()
            .query_row(
                "SELECT conversation_id FROM messages WHERE id = ?1",
                params![message_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match conversation {
            Some(raw) => Ok(ConversationId(parse_uuid(0, &raw)?)),
            None => Err(StoreError::NotFound("message".into())),
        }
    }

    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        let mut message = self
            .conn()
            .query_row(
                "SELECT m.id, m.conversation_id, m.text, m.attachments, m.created_at,
                        u.id, u.username, u.email
                 FROM messages m
                 JOIN users u ON u.id = m.sender_id
                 WHERE m.id = ?1",
                params![id.to_string()],
                row_to_message,
            )
            .map_err(or_not_found("message"))?;
        message.read_by = self.readers_of(id)?;
        Ok(message)
    }

    /// Full history of a conversation, oldest first. Only participants may
    /// read it.
    pub fn message_history(
        &self,
        conversation_id: ConversationId,
        viewer: UserId,
    ) -> Result<Vec<Message>> {
        self.get_conversation_for(conversation_id, viewer)?;

        let mut stmt = self.conn().prepare(
            "SELECT m.id, m.conversation_id, m.text, m.attachments, m.created_at,
                    u.id, u.username, u.email
             FROM messages m
             JOIN users u ON u.id = m.sender_id
             WHERE m.conversation_id = ?1
             ORDER BY m.seq ASC",
        )?;
        let rows = stmt.query_map(params![conversation_id.to_string()], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        for message in &mut messages {
            message.read_by = self.readers_of(message.id)?;
        }
        Ok(messages)
    }

    fn readers_of(&self, id: MessageId) -> Result<BTreeSet<UserId>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT user_id FROM message_reads WHERE message_id = ?1")?;
        let rows = stmt.query_map(params![id.to_string()], |row| {
            let user: String = row.get(0)?;
            Ok(UserId(parse_uuid(0, &user)?))
        })?;

        let mut readers = BTreeSet::new();
        for row in rows {
            readers.insert(row?);
        }
        Ok(readers)
    }
}

/// Map a `rusqlite::Row` to a [`Message`] with an empty `read_by`. The
/// sender's profile occupies the last three columns.
fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id: String = row.get(0)?;
    let conversation_id: String = row.get(1)?;
    let attachments: String = row.get(3)?;
    let created_at: String = row.get(4)?;

    let attachments: Vec<Attachment> = serde_json::from_str(&attachments).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let created_at: DateTime<Utc> = parse_ts(4, &created_at)?;

    Ok(Message {
        id: MessageId(parse_uuid(0, &id)?),
        conversation_id: ConversationId(parse_uuid(1, &conversation_id)?),
        sender: summary_at(row, 5)?,
        text: row.get(2)?,
        attachments,
        read_by: BTreeSet::new(),
        created_at,
    })
}

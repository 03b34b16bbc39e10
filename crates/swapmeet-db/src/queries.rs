use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;
use uuid::Uuid;

use swapmeet_types::models::{
    Conversation, ConversationPreview, Message, PublicProfile, Team, summarize,
};

use crate::Database;
use crate::error::{StoreError, StoreResult};
use crate::models::{
    ConversationRow, MessageRow, PreviewRow, UserRow, format_ts, now, parse_ts,
};

const CONVERSATION_COLUMNS: &str =
    "id, user1_id, user2_id, last_message_text, last_message_at, created_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, content, created_at, read_at";

impl Database {
    // -- Users --

    pub fn create_user(
        &self,
        id: Uuid,
        username: &str,
        password_hash: &str,
        display_name: Option<&str>,
        team: Option<Team>,
    ) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password, display_name, team, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.to_string(),
                    username,
                    password_hash,
                    display_name,
                    team.map(|t| t.as_str()),
                    format_ts(now()),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> StoreResult<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_profile(&self, user_id: Uuid) -> StoreResult<Option<PublicProfile>> {
        self.with_conn(|conn| query_user(conn, "id", &user_id.to_string()))?
            .map(UserRow::into_profile)
            .transpose()
    }

    // -- Conversations --

    /// Return the conversation between two users, creating it on first use.
    /// The boolean is `true` when this call created it.
    ///
    /// The pair is ordered before the insert so the unique index on
    /// `(user1_id, user2_id)` settles concurrent first calls: the losing insert
    /// is a no-op and both callers read back the same row.
    pub fn get_or_create_conversation(
        &self,
        user_a: Uuid,
        user_b: Uuid,
    ) -> StoreResult<(Conversation, bool)> {
        if user_a == user_b {
            return Err(StoreError::InvalidArgument(
                "cannot start a conversation with yourself".into(),
            ));
        }
        let (low, high) = if user_a < user_b {
            (user_a.to_string(), user_b.to_string())
        } else {
            (user_b.to_string(), user_a.to_string())
        };

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            for user in [&low, &high] {
                if query_user(&tx, "id", user)?.is_none() {
                    return Err(StoreError::NotFound("user"));
                }
            }

            let inserted = tx.execute(
                "INSERT INTO conversations (id, user1_id, user2_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (user1_id, user2_id) DO NOTHING",
                params![Uuid::new_v4().to_string(), low, high, format_ts(now())],
            )?;

            let row = tx
                .query_row(
                    &format!(
                        "SELECT {} FROM conversations WHERE user1_id = ?1 AND user2_id = ?2",
                        CONVERSATION_COLUMNS
                    ),
                    params![low, high],
                    conversation_from_row,
                )
                .optional()?
                .ok_or(StoreError::NotFound("conversation"))?;
            tx.commit()?;

            let conversation = row.into_conversation()?;
            if inserted > 0 {
                debug!("Created conversation {} for {} / {}", conversation.id, low, high);
            }
            Ok((conversation, inserted > 0))
        })
    }

    pub fn get_conversation(&self, id: Uuid) -> StoreResult<Option<Conversation>> {
        self.with_conn(|conn| query_conversation(conn, &id.to_string()))?
            .map(ConversationRow::into_conversation)
            .transpose()
    }

    /// Inbox for `user_id`: newest activity first, conversations without
    /// messages last, each with the number of unread incoming messages.
    pub fn list_conversations_for_user(
        &self,
        user_id: Uuid,
    ) -> StoreResult<Vec<ConversationPreview>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.last_message_text, c.last_message_at,
                        u.id, u.username, u.password, u.display_name, u.avatar_url, u.team, u.created_at,
                        (SELECT COUNT(*) FROM messages m
                          WHERE m.conversation_id = c.id
                            AND m.sender_id <> ?1
                            AND m.read_at IS NULL)
                 FROM conversations c
                 JOIN users u
                   ON u.id = CASE WHEN c.user1_id = ?1 THEN c.user2_id ELSE c.user1_id END
                 WHERE c.user1_id = ?1 OR c.user2_id = ?1
                 ORDER BY c.last_message_at IS NULL, c.last_message_at DESC, c.created_at DESC",
            )?;

            let rows = stmt
                .query_map([user_id.to_string()], |row| {
                    Ok(PreviewRow {
                        id: row.get(0)?,
                        last_message_text: row.get(1)?,
                        last_message_at: row.get(2)?,
                        other: UserRow {
                            id: row.get(3)?,
                            username: row.get(4)?,
                            password: row.get(5)?,
                            display_name: row.get(6)?,
                            avatar_url: row.get(7)?,
                            team: row.get(8)?,
                            created_at: row.get(9)?,
                        },
                        unread_count: row.get(10)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter().map(PreviewRow::into_preview).collect()
    }

    // -- Messages --

    /// Full history of a conversation, oldest first.
    ///
    /// Opening a conversation is also its read receipt: every message from the
    /// other participant that is still unread gets `read_at = now` before the
    /// history is read back. Already-read messages keep their timestamp.
    pub fn list_messages(&self, conversation_id: Uuid, requester: Uuid) -> StoreResult<Vec<Message>> {
        let cid = conversation_id.to_string();
        let rows = self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            authorize(&tx, &cid, requester)?;

            let marked = tx.execute(
                "UPDATE messages SET read_at = ?1
                 WHERE conversation_id = ?2 AND sender_id <> ?3 AND read_at IS NULL",
                params![format_ts(now()), cid, requester.to_string()],
            )?;
            if marked > 0 {
                debug!("Marked {} messages read in {} for {}", marked, cid, requester);
            }

            let rows = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {} FROM messages WHERE conversation_id = ?1
                     ORDER BY created_at ASC, rowid ASC",
                    MESSAGE_COLUMNS
                ))?;
                stmt.query_map([&cid], message_from_row)?
                    .collect::<Result<Vec<_>, _>>()?
            };
            tx.commit()?;
            Ok(rows)
        })?;

        rows.into_iter().map(MessageRow::into_message).collect()
    }

    /// Persist a message and refresh the conversation summary in one transaction.
    ///
    /// The body is stored trimmed. `created_at` never goes backwards within a
    /// conversation, even if the wall clock does.
    pub fn send_message(
        &self,
        conversation_id: Uuid,
        sender: Uuid,
        body: &str,
    ) -> StoreResult<Message> {
        let content = body.trim();
        if content.is_empty() {
            return Err(StoreError::InvalidArgument("message cannot be empty".into()));
        }

        let cid = conversation_id.to_string();
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            authorize(&tx, &cid, sender)?;

            let latest: Option<String> = tx.query_row(
                "SELECT MAX(created_at) FROM messages WHERE conversation_id = ?1",
                [&cid],
                |row| row.get(0),
            )?;
            let mut created_at = now();
            if let Some(latest) = latest {
                created_at = created_at.max(parse_ts(&latest)?);
            }

            let message = Message {
                id: Uuid::new_v4(),
                conversation_id,
                sender_id: sender,
                content: content.to_string(),
                created_at,
                read_at: None,
            };
            let created = format_ts(created_at);

            tx.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    message.id.to_string(),
                    cid,
                    sender.to_string(),
                    message.content,
                    created
                ],
            )?;
            tx.execute(
                "UPDATE conversations SET last_message_text = ?1, last_message_at = ?2 WHERE id = ?3",
                params![summarize(&message.content), created, cid],
            )?;
            tx.commit()?;

            Ok(message)
        })
    }

    pub fn get_message(&self, id: Uuid) -> StoreResult<Option<Message>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
                [id.to_string()],
                message_from_row,
            )
            .optional()
            .map_err(StoreError::from)
        })?
        .map(MessageRow::into_message)
        .transpose()
    }
}

/// NotFound when the conversation is missing, Unauthorized when `user` is not in it.
fn authorize(conn: &Connection, conversation_id: &str, user: Uuid) -> StoreResult<ConversationRow> {
    let row = query_conversation(conn, conversation_id)?.ok_or(StoreError::NotFound("conversation"))?;
    let user = user.to_string();
    if row.user1_id != user && row.user2_id != user {
        return Err(StoreError::Unauthorized);
    }
    Ok(row)
}

fn query_conversation(conn: &Connection, id: &str) -> StoreResult<Option<ConversationRow>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM conversations WHERE id = ?1", CONVERSATION_COLUMNS),
            [id],
            conversation_from_row,
        )
        .optional()?;
    Ok(row)
}

fn query_user(conn: &Connection, column: &str, value: &str) -> StoreResult<Option<UserRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, username, password, display_name, avatar_url, team, created_at
         FROM users WHERE {} = ?1",
        column
    ))?;

    let row = stmt
        .query_row([value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password: row.get(2)?,
                display_name: row.get(3)?,
                avatar_url: row.get(4)?,
                team: row.get(5)?,
                created_at: row.get(6)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        user1_id: row.get(1)?,
        user2_id: row.get(2)?,
        last_message_text: row.get(3)?,
        last_message_at: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        content: row.get(3)?,
        created_at: row.get(4)?,
        read_at: row.get(5)?,
    })
}

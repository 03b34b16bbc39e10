use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id              TEXT PRIMARY KEY,
            username        TEXT NOT NULL UNIQUE,
            password        TEXT NOT NULL,
            display_name    TEXT,
            avatar_url      TEXT,
            team            TEXT,
            created_at      TEXT NOT NULL
        );

        -- Participant pair is stored ordered (user1_id < user2_id) so the
        -- unique index covers both orderings of an unordered pair.
        CREATE TABLE IF NOT EXISTS conversations (
            id                  TEXT PRIMARY KEY,
            user1_id            TEXT NOT NULL REFERENCES users(id),
            user2_id            TEXT NOT NULL REFERENCES users(id),
            last_message_text   TEXT,
            last_message_at     TEXT,
            created_at          TEXT NOT NULL,
            CHECK (user1_id < user2_id),
            UNIQUE (user1_id, user2_id)
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_user2
            ON conversations(user2_id);

        CREATE TABLE IF NOT EXISTS messages (
            id                  TEXT PRIMARY KEY,
            conversation_id     TEXT NOT NULL REFERENCES conversations(id),
            sender_id           TEXT NOT NULL REFERENCES users(id),
            content             TEXT NOT NULL,
            created_at          TEXT NOT NULL,
            read_at             TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at);

        CREATE INDEX IF NOT EXISTS idx_messages_unread
            ON messages(conversation_id, sender_id) WHERE read_at IS NULL;
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}

//! Database row types. These map directly to SQLite rows and are converted
//! into swapmeet-types models at the edge of the crate.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use uuid::Uuid;

use swapmeet_types::models::{Conversation, ConversationPreview, Message, PublicProfile, Team};

use crate::error::{StoreError, StoreResult};

/// Current time at storage precision (microseconds).
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339, so text order in SQLite equals time order.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{}': {}", raw, e)))
}

fn parse_opt_ts(raw: Option<&str>) -> StoreResult<Option<DateTime<Utc>>> {
    raw.map(parse_ts).transpose()
}

pub fn parse_id(raw: &str) -> StoreResult<Uuid> {
    raw.parse()
        .map_err(|e| StoreError::Corrupt(format!("id '{}': {}", raw, e)))
}

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub team: Option<String>,
    pub created_at: String,
}

impl UserRow {
    pub fn into_profile(self) -> StoreResult<PublicProfile> {
        Ok(PublicProfile {
            id: parse_id(&self.id)?,
            username: self.username,
            display_name: self.display_name,
            avatar_url: self.avatar_url,
            team: parse_team(self.team.as_deref()),
        })
    }
}

pub struct ConversationRow {
    pub id: String,
    pub user1_id: String,
    pub user2_id: String,
    pub last_message_text: Option<String>,
    pub last_message_at: Option<String>,
    pub created_at: String,
}

impl ConversationRow {
    pub fn into_conversation(self) -> StoreResult<Conversation> {
        Ok(Conversation {
            id: parse_id(&self.id)?,
            user1_id: parse_id(&self.user1_id)?,
            user2_id: parse_id(&self.user2_id)?,
            last_message_text: self.last_message_text,
            last_message_at: parse_opt_ts(self.last_message_at.as_deref())?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: String,
    pub read_at: Option<String>,
}

impl MessageRow {
    pub fn into_message(self) -> StoreResult<Message> {
        Ok(Message {
            id: parse_id(&self.id)?,
            conversation_id: parse_id(&self.conversation_id)?,
            sender_id: parse_id(&self.sender_id)?,
            content: self.content,
            created_at: parse_ts(&self.created_at)?,
            read_at: parse_opt_ts(self.read_at.as_deref())?,
        })
    }
}

/// One inbox line: the conversation joined with the other participant's profile.
pub struct PreviewRow {
    pub id: String,
    pub other: UserRow,
    pub last_message_text: Option<String>,
    pub last_message_at: Option<String>,
    pub unread_count: u32,
}

impl PreviewRow {
    pub fn into_preview(self) -> StoreResult<ConversationPreview> {
        Ok(ConversationPreview {
            id: parse_id(&self.id)?,
            other_user: self.other.into_profile()?,
            last_message_text: self.last_message_text,
            last_message_at: parse_opt_ts(self.last_message_at.as_deref())?,
            unread_count: self.unread_count,
        })
    }
}

// An unknown team value is profile data we can live without.
fn parse_team(raw: Option<&str>) -> Option<Team> {
    raw.and_then(|t| t.parse().ok())
}

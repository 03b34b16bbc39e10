use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::models::Message;

/// Events sent FROM server TO client over the WebSocket gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Sent once per (re)connection, after authentication. Clients resubscribe on it.
    #[serde(rename_all = "camelCase")]
    Ready { user_id: Uuid },

    /// A message was posted to a conversation room this connection is in
    NewMessage(Message),

    /// Inbox-level notice that a conversation got a new message
    #[serde(rename_all = "camelCase")]
    ConversationUpdated {
        conversation_id: Uuid,
        last_message_text: String,
        last_message_at: DateTime<Utc>,
    },

    /// The given user started typing in the current conversation room
    UserTyping(Uuid),

    /// The given user paused typing
    UserStopTyping(Uuid),

    /// A command from this connection was rejected
    Error { kind: ErrorKind, message: String },
}

impl ServerEvent {
    /// Returns the conversation this event is scoped to, when the payload names one.
    pub fn conversation_id(&self) -> Option<Uuid> {
        match self {
            Self::NewMessage(message) => Some(message.conversation_id),
            Self::ConversationUpdated {
                conversation_id, ..
            } => Some(*conversation_id),
            _ => None,
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ClientCommand {
    /// Subscribe to the personal inbox room of the given user
    Join(Uuid),

    /// Subscribe to a conversation room
    JoinConversation(Uuid),

    /// Unsubscribe from a conversation room
    LeaveConversation(Uuid),

    /// Fan out an already persisted message
    #[serde(rename_all = "camelCase")]
    SendMessage {
        conversation_id: Uuid,
        message: Message,
        recipient_id: Uuid,
    },

    #[serde(rename_all = "camelCase")]
    Typing { conversation_id: Uuid, user_id: Uuid },

    #[serde(rename_all = "camelCase")]
    StopTyping { conversation_id: Uuid, user_id: Uuid },
}

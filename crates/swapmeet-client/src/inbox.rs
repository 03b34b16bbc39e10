use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};
use uuid::Uuid;

use swapmeet_types::error::ChatError;
use swapmeet_types::events::{ClientCommand, ServerEvent};
use swapmeet_types::models::ConversationPreview;

use crate::backend::ChatBackend;
use crate::error::ClientError;
use crate::gateway::EventChannel;

/// Conversation list with unread badges. The server's list is the truth;
/// every `conversation-updated` triggers a re-fetch instead of a local patch.
pub struct InboxController<B, C> {
    backend: B,
    channel: C,
    me: Uuid,
    conversations: Vec<ConversationPreview>,
    loaded: bool,
    error: Option<ChatError>,
}

impl<B: ChatBackend, C: EventChannel> InboxController<B, C> {
    pub fn new(backend: B, channel: C, me: Uuid) -> Self {
        Self {
            backend,
            channel,
            me,
            conversations: Vec::new(),
            loaded: false,
            error: None,
        }
    }

    pub fn conversations(&self) -> &[ConversationPreview] {
        &self.conversations
    }

    pub fn total_unread(&self) -> u32 {
        self.conversations.iter().map(|c| c.unread_count).sum()
    }

    pub fn unread_for(&self, conversation_id: Uuid) -> u32 {
        self.conversations
            .iter()
            .find(|c| c.id == conversation_id)
            .map_or(0, |c| c.unread_count)
    }

    /// Last failed fetch, cleared by the next successful one.
    pub fn error(&self) -> Option<&ChatError> {
        self.error.as_ref()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Subscribe to our inbox room and fetch the list.
    pub async fn open(&mut self) -> Result<(), ClientError> {
        if let Err(e) = self.channel.emit(ClientCommand::Join(self.me)) {
            warn!("Could not join inbox: {}", e);
        }
        self.refresh().await
    }

    /// Re-fetch the list. A failure keeps the previous list on screen.
    pub async fn refresh(&mut self) -> Result<(), ClientError> {
        match self.backend.list_conversations().await {
            Ok(conversations) => {
                debug!("Inbox refreshed: {} conversations", conversations.len());
                self.conversations = conversations;
                self.loaded = true;
                self.error = None;
                Ok(())
            }
            Err(e) => {
                self.error = Some(ChatError::from(&e));
                Err(e)
            }
        }
    }

    /// Opening a conversation reads it; clear its badge without a round trip.
    pub fn mark_read(&mut self, conversation_id: Uuid) {
        if let Some(preview) = self.conversations.iter_mut().find(|c| c.id == conversation_id) {
            preview.unread_count = 0;
        }
    }

    /// Returns `true` when the list was re-fetched.
    pub async fn handle_event(&mut self, event: &ServerEvent) -> Result<bool, ClientError> {
        match event {
            ServerEvent::ConversationUpdated { .. } => self.refresh().await.map(|_| true),
            ServerEvent::Ready { .. } => self.open().await.map(|_| true),
            _ => Ok(false),
        }
    }

    pub async fn step(
        &mut self,
        events: &mut broadcast::Receiver<ServerEvent>,
    ) -> Result<bool, ClientError> {
        match events.recv().await {
            Ok(event) => self.handle_event(&event).await,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Inbox skipped {} gateway events, refreshing", skipped);
                self.refresh().await.map(|_| true)
            }
            Err(RecvError::Closed) => Err(ClientError::ChannelClosed),
        }
    }
}

//! One open conversation: history, live messages, the draft and both typing
//! indicators.
//!
//! The session subscribes to the conversation room *before* fetching history
//! and keeps merging live messages by id while the fetch is in flight, so a
//! message landing between the two is neither lost nor shown twice.

use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use swapmeet_types::error::{ChatError, ErrorKind};
use swapmeet_types::events::{ClientCommand, ServerEvent};
use swapmeet_types::models::{Conversation, ConversationPreview, Message};

use crate::backend::ChatBackend;
use crate::error::ClientError;
use crate::gateway::EventChannel;

/// Quiet period after the last keystroke before `stop-typing` goes out.
pub const TYPING_IDLE: Duration = Duration::from_secs(2);

/// How long a peer's `user-typing` is shown without a refresh.
pub const TYPING_DECAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// History not (yet) in sync. `error` holds the last failed fetch.
    Loading { error: Option<ChatError> },
    Ready,
    Closed,
}

pub struct ChatSession<B, C: EventChannel> {
    backend: B,
    channel: C,
    me: Uuid,
    conversation_id: Uuid,
    peer_id: Uuid,
    state: SessionState,
    messages: Vec<Message>,
    draft: String,
    send_error: Option<ChatError>,
    /// Our own typing burst ends here unless another keystroke arrives.
    typing_idle_at: Option<Instant>,
    /// The peer's indicator is hidden after this.
    peer_typing_until: Option<Instant>,
}

impl<B: ChatBackend, C: EventChannel> ChatSession<B, C> {
    pub fn new(backend: B, channel: C, me: Uuid, conversation_id: Uuid, peer_id: Uuid) -> Self {
        Self {
            backend,
            channel,
            me,
            conversation_id,
            peer_id,
            state: SessionState::Loading { error: None },
            messages: Vec::new(),
            draft: String::new(),
            send_error: None,
            typing_idle_at: None,
            peer_typing_until: None,
        }
    }

    pub fn for_conversation(
        backend: B,
        channel: C,
        me: Uuid,
        conversation: &Conversation,
    ) -> Result<Self, ClientError> {
        let peer = conversation.other_participant(me).ok_or_else(|| {
            ChatError::new(ErrorKind::Unauthorized, "not a participant of this conversation")
        })?;
        Ok(Self::new(backend, channel, me, conversation.id, peer))
    }

    pub fn for_preview(backend: B, channel: C, me: Uuid, preview: &ConversationPreview) -> Self {
        Self::new(backend, channel, me, preview.id, preview.other_user.id)
    }

    // -- Accessors --

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn send_error(&self) -> Option<&ChatError> {
        self.send_error.as_ref()
    }

    pub fn is_peer_typing(&self) -> bool {
        self.peer_typing_until
            .is_some_and(|until| Instant::now() < until)
    }

    // -- Sync --

    /// Join the room, then fetch history and fold in whatever arrived live
    /// meanwhile. On failure the session stays in `Loading` with the error.
    pub async fn load(&mut self) -> Result<(), ClientError> {
        if self.state == SessionState::Closed {
            return Err(ClientError::ChannelClosed);
        }
        self.state = SessionState::Loading { error: None };

        if let Err(e) = self.channel.emit(ClientCommand::JoinConversation(self.conversation_id)) {
            // history still loads; the next `ready` resubscribes
            warn!("Could not join conversation {}: {}", self.conversation_id, e);
        }

        match self.backend.list_messages(self.conversation_id).await {
            Ok(history) => {
                let live = std::mem::replace(&mut self.messages, history);
                for message in live {
                    self.merge(message);
                }
                self.messages.sort_by_key(|m| m.created_at);
                self.state = SessionState::Ready;
                debug!(
                    "Conversation {} loaded with {} messages",
                    self.conversation_id,
                    self.messages.len()
                );
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Loading {
                    error: Some(ChatError::from(&e)),
                };
                Err(e)
            }
        }
    }

    /// Apply one server event. Returns `true` when visible state changed.
    ///
    /// A `ready` puts the session back into `Loading`; call [`load`](Self::load)
    /// (or use [`step`](Self::step), which does) to resync.
    pub fn handle_event(&mut self, event: &ServerEvent) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        // inbox traffic for other conversations shares the connection
        if event
            .conversation_id()
            .is_some_and(|id| id != self.conversation_id)
        {
            return false;
        }
        match event {
            ServerEvent::NewMessage(message) => {
                if message.sender_id == self.peer_id {
                    self.peer_typing_until = None;
                }
                self.merge(message.clone())
            }
            ServerEvent::UserTyping(user) if *user == self.peer_id => {
                self.peer_typing_until = Some(Instant::now() + TYPING_DECAY);
                true
            }
            ServerEvent::UserStopTyping(user) if *user == self.peer_id => {
                self.peer_typing_until.take().is_some()
            }
            ServerEvent::Ready { .. } => {
                self.state = SessionState::Loading { error: None };
                true
            }
            ServerEvent::Error { kind, message } => {
                warn!("Gateway rejected a command: {} ({})", message, kind);
                false
            }
            _ => false,
        }
    }

    /// Wait for the next event or timer and apply it. Resyncs from the
    /// backend on `ready` and when the subscription lagged.
    pub async fn step(
        &mut self,
        events: &mut broadcast::Receiver<ServerEvent>,
    ) -> Result<bool, ClientError> {
        let deadline = self.next_deadline();
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => {
                    let changed = self.handle_event(&event);
                    if matches!(event, ServerEvent::Ready { .. }) {
                        self.load().await?;
                    }
                    Ok(changed)
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Skipped {} gateway events, resyncing", skipped);
                    self.load().await?;
                    Ok(true)
                }
                Err(RecvError::Closed) => Err(ClientError::ChannelClosed),
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                Ok(self.poll_timers())
            }
        }
    }

    /// Fire expired deadlines: our `stop-typing` and the peer's indicator decay.
    pub fn poll_timers(&mut self) -> bool {
        let now = Instant::now();
        let mut changed = false;

        if self.typing_idle_at.is_some_and(|at| at <= now) {
            self.typing_idle_at = None;
            self.emit_stop_typing();
            changed = true;
        }
        if self.peer_typing_until.is_some_and(|until| until <= now) {
            self.peer_typing_until = None;
            changed = true;
        }
        changed
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.typing_idle_at, self.peer_typing_until) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // -- Composing --

    /// Replace the draft (one keystroke). Signals `typing` and pushes the
    /// idle deadline out.
    pub fn set_draft(&mut self, text: impl Into<String>) {
        if self.state == SessionState::Closed {
            return;
        }
        self.draft = text.into();
        self.emit(ClientCommand::Typing {
            conversation_id: self.conversation_id,
            user_id: self.me,
        });
        self.typing_idle_at = Some(Instant::now() + TYPING_IDLE);
    }

    /// Persist the draft, show it, then relay it to the room.
    ///
    /// Nothing is relayed unless the backend accepted the message. On failure
    /// the draft is kept so the user can retry.
    pub async fn send_draft(&mut self) -> Result<Message, ClientError> {
        if self.state == SessionState::Closed {
            return Err(ClientError::ChannelClosed);
        }
        let content = self.draft.trim().to_string();
        if content.is_empty() {
            let e = ClientError::InvalidArgument("message cannot be empty".into());
            self.send_error = Some(ChatError::from(&e));
            return Err(e);
        }

        let message = match self.backend.send_message(self.conversation_id, &content).await {
            Ok(message) => message,
            Err(e) => {
                warn!("Send to {} failed: {}", self.conversation_id, e);
                self.send_error = Some(ChatError::from(&e));
                return Err(e);
            }
        };

        self.send_error = None;
        self.draft.clear();
        self.merge(message.clone());

        if self.typing_idle_at.take().is_some() {
            self.emit_stop_typing();
        }
        self.emit(ClientCommand::SendMessage {
            conversation_id: self.conversation_id,
            message: message.clone(),
            recipient_id: self.peer_id,
        });
        Ok(message)
    }

    /// Send `content` without going through the typing signals.
    pub async fn send(&mut self, content: &str) -> Result<Message, ClientError> {
        self.draft = content.to_string();
        self.send_draft().await
    }

    /// Leave the room. Dropping the session does the same.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn merge(&mut self, message: Message) -> bool {
        if self.messages.iter().any(|m| m.id == message.id) {
            return false;
        }
        self.messages.push(message);
        true
    }

    fn emit_stop_typing(&self) {
        self.emit(ClientCommand::StopTyping {
            conversation_id: self.conversation_id,
            user_id: self.me,
        });
    }

    fn emit(&self, command: ClientCommand) {
        if let Err(e) = self.channel.emit(command) {
            debug!("Gateway command dropped: {}", e);
        }
    }
}

impl<B, C: EventChannel> ChatSession<B, C> {
    fn shutdown(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if self.typing_idle_at.take().is_some() {
            let _ = self.channel.emit(ClientCommand::StopTyping {
                conversation_id: self.conversation_id,
                user_id: self.me,
            });
        }
        let _ = self
            .channel
            .emit(ClientCommand::LeaveConversation(self.conversation_id));
        self.state = SessionState::Closed;
        self.messages.clear();
        self.peer_typing_until = None;
    }
}

impl<B, C: EventChannel> Drop for ChatSession<B, C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

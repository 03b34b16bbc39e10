#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use swapmeet_client::{ChatBackend, ClientError, EventChannel};
use swapmeet_db::{Database, StoreError};
use swapmeet_types::error::{ChatError, ErrorKind};
use swapmeet_types::events::ClientCommand;
use swapmeet_types::models::{Conversation, ConversationPreview, Message, Team};

pub fn db() -> Arc<Database> {
    Arc::new(Database::open_in_memory().unwrap())
}

pub fn user(db: &Database, name: &str) -> Uuid {
    let id = Uuid::new_v4();
    db.create_user(id, name, "not-a-real-hash", Some(name), Some(Team::Valor))
        .unwrap();
    id
}

fn rejected(e: StoreError) -> ClientError {
    ClientError::Rejected(ChatError::new(e.kind(), e.to_string()))
}

/// Backend that talks to the store directly, acting as `me`.
pub struct LocalBackend {
    pub db: Arc<Database>,
    pub me: Uuid,
    pub fail_loads: AtomicBool,
    pub fail_sends: AtomicBool,
}

impl LocalBackend {
    pub fn new(db: Arc<Database>, me: Uuid) -> Self {
        Self {
            db,
            me,
            fail_loads: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
        }
    }

    fn outage() -> ClientError {
        ClientError::Rejected(ChatError::new(ErrorKind::Internal, "backend unavailable"))
    }
}

impl ChatBackend for LocalBackend {
    async fn list_conversations(&self) -> Result<Vec<ConversationPreview>, ClientError> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(Self::outage());
        }
        self.db.list_conversations_for_user(self.me).map_err(rejected)
    }

    async fn open_conversation(&self, user_id: Uuid) -> Result<Conversation, ClientError> {
        self.db
            .get_or_create_conversation(self.me, user_id)
            .map(|(conversation, _)| conversation)
            .map_err(rejected)
    }

    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, ClientError> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(Self::outage());
        }
        self.db.list_messages(conversation_id, self.me).map_err(rejected)
    }

    async fn send_message(
        &self,
        conversation_id: Uuid,
        content: &str,
    ) -> Result<Message, ClientError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Self::outage());
        }
        self.db
            .send_message(conversation_id, self.me, content)
            .map_err(rejected)
    }
}

/// Channel that records every emitted command.
#[derive(Clone, Default)]
pub struct RecordingChannel {
    sent: Arc<Mutex<Vec<ClientCommand>>>,
}

impl RecordingChannel {
    /// Drain what was emitted so far.
    pub fn take(&self) -> Vec<ClientCommand> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

impl EventChannel for RecordingChannel {
    fn emit(&self, command: ClientCommand) -> Result<(), ClientError> {
        self.sent.lock().unwrap().push(command);
        Ok(())
    }
}

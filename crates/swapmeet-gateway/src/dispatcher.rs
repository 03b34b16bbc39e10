use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, trace};
use uuid::Uuid;

use swapmeet_types::events::ServerEvent;
use swapmeet_types::models::{Message, summarize};

/// Identifies one live socket. A user with two tabs open has two.
pub type ConnId = Uuid;

/// A named subscription group of live connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Room {
    /// Conversation-list notifications for one user
    Inbox(Uuid),
    /// Message and typing traffic for one conversation
    Conversation(Uuid),
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbox(user_id) => write!(f, "inbox:{}", user_id),
            Self::Conversation(conversation_id) => write!(f, "conversation:{}", conversation_id),
        }
    }
}

/// Lifecycle of a registered connection. A connection that is no longer
/// registered is disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Registered, no room memberships
    Connected,
    /// Member of at least one room
    Subscribed,
}

/// How many connections each half of a send-message fan-out reached.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Fanout {
    pub conversation: usize,
    pub inbox: usize,
}

struct ConnectionEntry {
    user_id: Uuid,
    tx: mpsc::UnboundedSender<ServerEvent>,
    rooms: HashSet<Room>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnId, ConnectionEntry>,
    rooms: HashMap<Room, HashSet<ConnId>>,
}

impl Registry {
    /// Queue `event` for every member of `room` except `except`. Members whose
    /// socket task already ended are skipped; they are removed on unregister.
    fn deliver(&self, room: &Room, event: &ServerEvent, except: Option<ConnId>) -> usize {
        let Some(members) = self.rooms.get(room) else {
            return 0;
        };

        let mut delivered = 0;
        for conn_id in members {
            if Some(*conn_id) == except {
                continue;
            }
            if let Some(entry) = self.connections.get(conn_id) {
                if entry.tx.send(event.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }
}

/// Room registry and event router for all live gateway connections.
///
/// Every connection gets its own unbounded queue; broadcasting only pushes onto
/// those queues, so the registry lock is never held across socket I/O. Events
/// for one room are queued under one lock in arrival order, which is the order
/// every subscriber of that room observes them.
#[derive(Clone, Default)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

#[derive(Default)]
struct DispatcherInner {
    registry: RwLock<Registry>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection for `user_id`. Returns (conn_id, receiver).
    pub async fn register(&self, user_id: Uuid) -> (ConnId, mpsc::UnboundedReceiver<ServerEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.registry.write().await.connections.insert(
            conn_id,
            ConnectionEntry {
                user_id,
                tx,
                rooms: HashSet::new(),
            },
        );
        debug!("Registered connection {} for {}", conn_id, user_id);
        (conn_id, rx)
    }

    /// Drop a connection and every room membership it held. Peers are not notified.
    pub async fn unregister(&self, conn_id: ConnId) {
        let mut registry = self.inner.registry.write().await;
        let Some(entry) = registry.connections.remove(&conn_id) else {
            return;
        };

        for room in &entry.rooms {
            if let Some(members) = registry.rooms.get_mut(room) {
                members.remove(&conn_id);
                if members.is_empty() {
                    registry.rooms.remove(room);
                }
            }
        }
        debug!(
            "Unregistered connection {} ({}), left {} rooms",
            conn_id,
            entry.user_id,
            entry.rooms.len()
        );
    }

    /// Add a connection to a room. Returns false if the connection is not registered.
    pub async fn join(&self, conn_id: ConnId, room: Room) -> bool {
        let mut registry = self.inner.registry.write().await;
        let Some(entry) = registry.connections.get_mut(&conn_id) else {
            return false;
        };
        entry.rooms.insert(room);
        registry.rooms.entry(room).or_default().insert(conn_id);
        trace!("{} joined {}", conn_id, room);
        true
    }

    /// Remove a connection from one room. Returns whether it was a member.
    pub async fn leave(&self, conn_id: ConnId, room: Room) -> bool {
        let mut registry = self.inner.registry.write().await;
        if let Some(entry) = registry.connections.get_mut(&conn_id) {
            entry.rooms.remove(&room);
        }

        let Some(members) = registry.rooms.get_mut(&room) else {
            return false;
        };
        let was_member = members.remove(&conn_id);
        if members.is_empty() {
            registry.rooms.remove(&room);
        }
        trace!("{} left {}", conn_id, room);
        was_member
    }

    pub async fn is_member(&self, conn_id: ConnId, room: Room) -> bool {
        self.inner
            .registry
            .read()
            .await
            .rooms
            .get(&room)
            .is_some_and(|members| members.contains(&conn_id))
    }

    /// `None` once the connection has been unregistered.
    pub async fn state(&self, conn_id: ConnId) -> Option<ConnectionState> {
        let registry = self.inner.registry.read().await;
        let entry = registry.connections.get(&conn_id)?;
        Some(if entry.rooms.is_empty() {
            ConnectionState::Connected
        } else {
            ConnectionState::Subscribed
        })
    }

    pub async fn room_members(&self, room: Room) -> Vec<ConnId> {
        self.inner
            .registry
            .read()
            .await
            .rooms
            .get(&room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Send an event to exactly one connection.
    pub async fn send_to_connection(&self, conn_id: ConnId, event: ServerEvent) -> bool {
        let registry = self.inner.registry.read().await;
        registry
            .connections
            .get(&conn_id)
            .is_some_and(|entry| entry.tx.send(event).is_ok())
    }

    /// Send an event to every member of `room` except `except`. An empty room is a no-op.
    pub async fn broadcast(&self, room: Room, event: ServerEvent, except: Option<ConnId>) -> usize {
        self.inner.registry.read().await.deliver(&room, &event, except)
    }

    /// Fan out a stored message: `new-message` to the rest of the conversation
    /// room and `conversation-updated` to the recipient's inbox room, both
    /// queued under the same lock.
    pub async fn send_message(
        &self,
        origin: ConnId,
        conversation_id: Uuid,
        message: Message,
        recipient_id: Uuid,
    ) -> Fanout {
        let updated = ServerEvent::ConversationUpdated {
            conversation_id,
            last_message_text: summarize(&message.content),
            last_message_at: message.created_at,
        };
        let new_message = ServerEvent::NewMessage(message);

        let registry = self.inner.registry.read().await;
        let fanout = Fanout {
            conversation: registry.deliver(
                &Room::Conversation(conversation_id),
                &new_message,
                Some(origin),
            ),
            inbox: registry.deliver(&Room::Inbox(recipient_id), &updated, None),
        };
        debug!(
            "Message fan-out in {}: {} room peers, {} inbox connections",
            conversation_id, fanout.conversation, fanout.inbox
        );
        fanout
    }

    pub async fn typing(&self, origin: ConnId, conversation_id: Uuid, user_id: Uuid) -> usize {
        self.broadcast(
            Room::Conversation(conversation_id),
            ServerEvent::UserTyping(user_id),
            Some(origin),
        )
        .await
    }

    pub async fn stop_typing(&self, origin: ConnId, conversation_id: Uuid, user_id: Uuid) -> usize {
        self.broadcast(
            Room::Conversation(conversation_id),
            ServerEvent::UserStopTyping(user_id),
            Some(origin),
        )
        .await
    }
}

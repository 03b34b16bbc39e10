use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use swapmeet_db::{Database, StoreError, StoreResult};
use swapmeet_types::error::ErrorKind;
use swapmeet_types::events::{ClientCommand, ServerEvent};
use swapmeet_types::models::Message;

use crate::dispatcher::{ConnId, Dispatcher, Room};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Everything a command handler needs to know about the connection it runs on.
struct ConnContext {
    dispatcher: Dispatcher,
    db: Arc<Database>,
    conn_id: ConnId,
    user_id: Uuid,
    username: String,
}

/// Handle a pre-authenticated WebSocket connection.
/// The JWT was already validated at the HTTP upgrade layer, so the socket is
/// bound to `user_id` for its whole lifetime and client payloads never get to
/// choose which identity they act as.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    user_id: Uuid,
    username: String,
) {
    let (mut sender, mut receiver) = socket.split();
    let (conn_id, mut conn_rx) = dispatcher.register(user_id).await;

    info!("{} ({}) connected to gateway as {}", username, user_id, conn_id);

    if send_event(&mut sender, &ServerEvent::Ready { user_id }).await.is_err() {
        dispatcher.unregister(conn_id).await;
        return;
    }

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward routed events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = conn_rx.recv() => {
                    let Some(event) = event else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(WsMessage::Ping(Default::default())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client. Commands from one connection are handled
    // strictly one after another.
    let ctx = ConnContext {
        dispatcher: dispatcher.clone(),
        db,
        conn_id,
        user_id,
        username: username.clone(),
    };
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                WsMessage::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(cmd) => handle_command(&ctx, cmd).await,
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            ctx.username,
                            ctx.user_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                    }
                },
                WsMessage::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    dispatcher.unregister(conn_id).await;
    info!("{} ({}) disconnected from gateway", username, user_id);
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, WsMessage>,
    event: &ServerEvent,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to serialize gateway event: {}", e);
            return Ok(());
        }
    };
    sender.send(WsMessage::Text(text.into())).await
}

async fn handle_command(ctx: &ConnContext, cmd: ClientCommand) {
    match cmd {
        ClientCommand::Join(user_id) => {
            if user_id != ctx.user_id {
                reject(ctx, ErrorKind::Unauthorized, "cannot join another user's inbox").await;
                return;
            }
            ctx.dispatcher.join(ctx.conn_id, Room::Inbox(user_id)).await;
            info!("{} ({}) joined their inbox", ctx.username, ctx.user_id);
        }

        ClientCommand::JoinConversation(conversation_id) => {
            let user_id = ctx.user_id;
            let allowed = with_db(&ctx.db, move |db| {
                let conversation = db
                    .get_conversation(conversation_id)?
                    .ok_or(StoreError::NotFound("conversation"))?;
                if !conversation.has_participant(user_id) {
                    return Err(StoreError::Unauthorized);
                }
                Ok(())
            })
            .await;

            match allowed {
                Ok(()) => {
                    ctx.dispatcher
                        .join(ctx.conn_id, Room::Conversation(conversation_id))
                        .await;
                    debug!("{} ({}) joined conversation {}", ctx.username, ctx.user_id, conversation_id);
                }
                Err(kind) => {
                    reject(ctx, kind, format!("cannot join conversation {}", conversation_id)).await;
                }
            }
        }

        ClientCommand::LeaveConversation(conversation_id) => {
            ctx.dispatcher
                .leave(ctx.conn_id, Room::Conversation(conversation_id))
                .await;
            debug!("{} ({}) left conversation {}", ctx.username, ctx.user_id, conversation_id);
        }

        ClientCommand::SendMessage {
            conversation_id,
            message,
            recipient_id,
        } => {
            let message_id = message.id;
            match verify_stored_message(ctx, conversation_id, message, recipient_id).await {
                Ok(stored) => {
                    ctx.dispatcher
                        .send_message(ctx.conn_id, conversation_id, stored, recipient_id)
                        .await;
                }
                Err(kind) => {
                    reject(ctx, kind, format!("cannot broadcast message {}", message_id)).await;
                }
            }
        }

        ClientCommand::Typing {
            conversation_id,
            user_id,
        } => {
            if typing_allowed(ctx, conversation_id, user_id).await {
                ctx.dispatcher
                    .typing(ctx.conn_id, conversation_id, ctx.user_id)
                    .await;
            }
        }

        ClientCommand::StopTyping {
            conversation_id,
            user_id,
        } => {
            if typing_allowed(ctx, conversation_id, user_id).await {
                ctx.dispatcher
                    .stop_typing(ctx.conn_id, conversation_id, ctx.user_id)
                    .await;
            }
        }
    }
}

/// Only relay a message that is durably stored, belongs to this conversation,
/// was sent by this connection's user and is addressed to the other
/// participant. The stored record is what gets broadcast, not the client's copy.
async fn verify_stored_message(
    ctx: &ConnContext,
    conversation_id: Uuid,
    claimed: Message,
    recipient_id: Uuid,
) -> Result<Message, ErrorKind> {
    let user_id = ctx.user_id;
    with_db(&ctx.db, move |db| {
        let conversation = db
            .get_conversation(conversation_id)?
            .ok_or(StoreError::NotFound("conversation"))?;
        if conversation.other_participant(user_id) != Some(recipient_id) {
            return Err(StoreError::Unauthorized);
        }

        let stored = db
            .get_message(claimed.id)?
            .ok_or(StoreError::NotFound("message"))?;
        if stored.conversation_id != conversation_id || stored.sender_id != user_id {
            return Err(StoreError::Unauthorized);
        }
        Ok(stored)
    })
    .await
}

/// Typing signals must name the connection's own user and come from a
/// connection that is in the conversation room.
async fn typing_allowed(ctx: &ConnContext, conversation_id: Uuid, claimed_user: Uuid) -> bool {
    if claimed_user != ctx.user_id {
        warn!(
            "{} ({}) sent typing signal as {}, dropping",
            ctx.username, ctx.user_id, claimed_user
        );
        return false;
    }
    if !ctx
        .dispatcher
        .is_member(ctx.conn_id, Room::Conversation(conversation_id))
        .await
    {
        warn!(
            "{} ({}) sent typing signal for unjoined conversation {}",
            ctx.username, ctx.user_id, conversation_id
        );
        return false;
    }
    true
}

async fn reject(ctx: &ConnContext, kind: ErrorKind, message: impl Into<String>) {
    let message = message.into();
    warn!("{} ({}) rejected: {} ({})", ctx.username, ctx.user_id, message, kind);
    ctx.dispatcher
        .send_to_connection(ctx.conn_id, ServerEvent::Error { kind, message })
        .await;
}

/// Run a store call off the async runtime, collapsing failures to their kind.
async fn with_db<T, F>(db: &Arc<Database>, f: F) -> Result<T, ErrorKind>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> StoreResult<T> + Send + 'static,
{
    let db = db.clone();
    match tokio::task::spawn_blocking(move || f(&db)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            if e.kind() == ErrorKind::Internal {
                error!("Gateway store error: {}", e);
            }
            Err(e.kind())
        }
        Err(e) => {
            error!("spawn_blocking join error: {}", e);
            Err(ErrorKind::Internal)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        dispatcher: Dispatcher,
        db: Arc<Database>,
        alice: Uuid,
        bob: Uuid,
        conversation: Uuid,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        db.create_user(alice, "alice", "hash", None, None).unwrap();
        db.create_user(bob, "bob", "hash", None, None).unwrap();
        let (conversation, _) = db.get_or_create_conversation(alice, bob).unwrap();
        Fixture {
            dispatcher: Dispatcher::new(),
            db,
            alice,
            bob,
            conversation: conversation.id,
        }
    }

    async fn connect(f: &Fixture, user_id: Uuid) -> (ConnContext, UnboundedReceiver<ServerEvent>) {
        let (conn_id, rx) = f.dispatcher.register(user_id).await;
        let ctx = ConnContext {
            dispatcher: f.dispatcher.clone(),
            db: f.db.clone(),
            conn_id,
            user_id,
            username: "test".into(),
        };
        (ctx, rx)
    }

    fn rejected_with(rx: &mut UnboundedReceiver<ServerEvent>, expected: ErrorKind) -> bool {
        matches!(rx.try_recv(), Ok(ServerEvent::Error { kind, .. }) if kind == expected)
    }

    #[tokio::test]
    async fn inbox_join_is_bound_to_authenticated_user() {
        let f = fixture();
        let (ctx, mut rx) = connect(&f, f.alice).await;

        handle_command(&ctx, ClientCommand::Join(f.bob)).await;
        assert!(rejected_with(&mut rx, ErrorKind::Unauthorized));
        assert!(!f.dispatcher.is_member(ctx.conn_id, Room::Inbox(f.bob)).await);

        handle_command(&ctx, ClientCommand::Join(f.alice)).await;
        assert!(f.dispatcher.is_member(ctx.conn_id, Room::Inbox(f.alice)).await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn conversation_join_requires_participant() {
        let f = fixture();
        let outsider = Uuid::new_v4();
        f.db.create_user(outsider, "mallory", "hash", None, None).unwrap();
        let (spy, mut spy_rx) = connect(&f, outsider).await;
        let (member, _rx) = connect(&f, f.bob).await;

        handle_command(&spy, ClientCommand::JoinConversation(f.conversation)).await;
        assert!(rejected_with(&mut spy_rx, ErrorKind::Unauthorized));

        handle_command(&spy, ClientCommand::JoinConversation(Uuid::new_v4())).await;
        assert!(rejected_with(&mut spy_rx, ErrorKind::NotFound));

        handle_command(&member, ClientCommand::JoinConversation(f.conversation)).await;
        assert_eq!(
            f.dispatcher.room_members(Room::Conversation(f.conversation)).await,
            vec![member.conn_id]
        );
    }

    #[tokio::test]
    async fn stored_message_is_relayed_to_room_and_inbox() {
        let f = fixture();
        let (sender, mut sender_rx) = connect(&f, f.alice).await;
        let (peer, mut peer_rx) = connect(&f, f.bob).await;
        let (inbox, mut inbox_rx) = connect(&f, f.bob).await;
        handle_command(&sender, ClientCommand::JoinConversation(f.conversation)).await;
        handle_command(&peer, ClientCommand::JoinConversation(f.conversation)).await;
        handle_command(&inbox, ClientCommand::Join(f.bob)).await;

        let stored = f.db.send_message(f.conversation, f.alice, "hey, want to trade?").unwrap();
        let mut claimed = stored.clone();
        claimed.content = "something else".into();

        handle_command(
            &sender,
            ClientCommand::SendMessage {
                conversation_id: f.conversation,
                message: claimed,
                recipient_id: f.bob,
            },
        )
        .await;

        assert!(sender_rx.try_recv().is_err());
        assert_eq!(peer_rx.try_recv().unwrap(), ServerEvent::NewMessage(stored.clone()));
        match inbox_rx.try_recv().unwrap() {
            ServerEvent::ConversationUpdated {
                conversation_id,
                last_message_text,
                ..
            } => {
                assert_eq!(conversation_id, f.conversation);
                assert_eq!(last_message_text, "hey, want to trade?");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn unstored_or_foreign_messages_are_not_relayed() {
        let f = fixture();
        let (alice, mut alice_rx) = connect(&f, f.alice).await;
        let (bob, mut bob_rx) = connect(&f, f.bob).await;
        handle_command(&alice, ClientCommand::JoinConversation(f.conversation)).await;
        handle_command(&bob, ClientCommand::JoinConversation(f.conversation)).await;

        let bobs = f.db.send_message(f.conversation, f.bob, "mine").unwrap();
        let mut never_stored = bobs.clone();
        never_stored.id = Uuid::new_v4();
        never_stored.sender_id = f.alice;

        handle_command(
            &alice,
            ClientCommand::SendMessage {
                conversation_id: f.conversation,
                message: never_stored,
                recipient_id: f.bob,
            },
        )
        .await;
        assert!(rejected_with(&mut alice_rx, ErrorKind::NotFound));

        handle_command(
            &alice,
            ClientCommand::SendMessage {
                conversation_id: f.conversation,
                message: bobs,
                recipient_id: f.bob,
            },
        )
        .await;
        assert!(rejected_with(&mut alice_rx, ErrorKind::Unauthorized));
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn typing_signals_cannot_be_spoofed() {
        let f = fixture();
        let (alice, _alice_rx) = connect(&f, f.alice).await;
        let (bob, mut bob_rx) = connect(&f, f.bob).await;
        handle_command(&bob, ClientCommand::JoinConversation(f.conversation)).await;

        // Not in the room yet
        handle_command(
            &alice,
            ClientCommand::Typing {
                conversation_id: f.conversation,
                user_id: f.alice,
            },
        )
        .await;
        assert!(bob_rx.try_recv().is_err());

        handle_command(&alice, ClientCommand::JoinConversation(f.conversation)).await;
        handle_command(
            &alice,
            ClientCommand::Typing {
                conversation_id: f.conversation,
                user_id: f.bob,
            },
        )
        .await;
        assert!(bob_rx.try_recv().is_err());

        handle_command(
            &alice,
            ClientCommand::Typing {
                conversation_id: f.conversation,
                user_id: f.alice,
            },
        )
        .await;
        handle_command(
            &alice,
            ClientCommand::StopTyping {
                conversation_id: f.conversation,
                user_id: f.alice,
            },
        )
        .await;
        assert_eq!(bob_rx.try_recv().unwrap(), ServerEvent::UserTyping(f.alice));
        assert_eq!(bob_rx.try_recv().unwrap(), ServerEvent::UserStopTyping(f.alice));
    }

    #[tokio::test]
    async fn leave_stops_room_traffic() {
        let f = fixture();
        let (alice, _alice_rx) = connect(&f, f.alice).await;
        let (bob, mut bob_rx) = connect(&f, f.bob).await;
        handle_command(&alice, ClientCommand::JoinConversation(f.conversation)).await;
        handle_command(&bob, ClientCommand::JoinConversation(f.conversation)).await;
        handle_command(&bob, ClientCommand::LeaveConversation(f.conversation)).await;

        handle_command(
            &alice,
            ClientCommand::Typing {
                conversation_id: f.conversation,
                user_id: f.alice,
            },
        )
        .await;
        assert!(bob_rx.try_recv().is_err());
    }
}

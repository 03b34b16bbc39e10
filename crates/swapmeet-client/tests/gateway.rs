//! Client controllers against a live gateway on a loopback socket.

mod common;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use swapmeet_client::{ChatSession, ClientConfig, GatewayClient, InboxController, ReconnectPolicy};
use swapmeet_db::Database;
use swapmeet_gateway::connection::handle_connection;
use swapmeet_gateway::{Dispatcher, Room};
use swapmeet_types::events::ServerEvent;

use common::{LocalBackend, db, user};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct TestState {
    db: Arc<Database>,
    dispatcher: Dispatcher,
}

/// Test identity: the token is the user id itself.
async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<TestState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let user_id: Uuid = params["token"].parse().unwrap();
    ws.on_upgrade(move |socket| {
        handle_connection(
            socket,
            state.dispatcher,
            state.db,
            user_id,
            user_id.to_string(),
        )
    })
}

async fn spawn_server(db: Arc<Database>) -> (SocketAddr, Dispatcher) {
    let dispatcher = Dispatcher::new();
    let app = Router::new()
        .route("/gateway", get(upgrade))
        .with_state(TestState {
            db,
            dispatcher: dispatcher.clone(),
        });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, dispatcher)
}

async fn connect(addr: SocketAddr, user_id: Uuid) -> Arc<GatewayClient> {
    let config = ClientConfig::new(format!("http://{}", addr), user_id.to_string());
    assert_eq!(config.reconnect, ReconnectPolicy::default());
    let client = config.gateway();
    let mut events = client.events();
    client.connect().await.unwrap();

    let first = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(first, ServerEvent::Ready { user_id });
    client
}

async fn wait_for_members(dispatcher: &Dispatcher, room: Room, count: usize) {
    timeout(WAIT, async {
        while dispatcher.room_members(room).await.len() != count {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn message_reaches_peer_session_and_inbox() {
    let db = db();
    let (ash, misty) = (user(&db, "ash"), user(&db, "misty"));
    let (conversation, _) = db.get_or_create_conversation(ash, misty).unwrap();
    let (addr, dispatcher) = spawn_server(db.clone()).await;

    let ash_gateway = connect(addr, ash).await;
    let misty_gateway = connect(addr, misty).await;
    let mut misty_chat_events = misty_gateway.events();
    let mut misty_inbox_events = misty_gateway.events();

    let mut misty_inbox = InboxController::new(
        LocalBackend::new(db.clone(), misty),
        misty_gateway.clone(),
        misty,
    );
    misty_inbox.open().await.unwrap();

    let mut ash_session = ChatSession::for_conversation(
        LocalBackend::new(db.clone(), ash),
        ash_gateway.clone(),
        ash,
        &conversation,
    )
    .unwrap();
    let mut misty_session = ChatSession::for_conversation(
        LocalBackend::new(db.clone(), misty),
        misty_gateway.clone(),
        misty,
        &conversation,
    )
    .unwrap();
    ash_session.load().await.unwrap();
    misty_session.load().await.unwrap();

    wait_for_members(&dispatcher, Room::Conversation(conversation.id), 2).await;
    wait_for_members(&dispatcher, Room::Inbox(misty), 1).await;

    // typing is relayed to the peer
    ash_session.set_draft("hey");
    timeout(WAIT, async {
        while !misty_session.is_peer_typing() {
            misty_session.step(&mut misty_chat_events).await.unwrap();
        }
    })
    .await
    .unwrap();

    let sent = ash_session.send_draft().await.unwrap();

    timeout(WAIT, async {
        while !misty_session.messages().iter().any(|m| m.id == sent.id) {
            misty_session.step(&mut misty_chat_events).await.unwrap();
        }
    })
    .await
    .unwrap();
    assert!(!misty_session.is_peer_typing());

    timeout(WAIT, async {
        while !misty_inbox.step(&mut misty_inbox_events).await.unwrap() {}
    })
    .await
    .unwrap();
    assert_eq!(misty_inbox.unread_for(conversation.id), 1);
    assert_eq!(
        misty_inbox.conversations()[0].last_message_text.as_deref(),
        Some("hey")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn closing_and_disconnecting_release_rooms() {
    let db = db();
    let (ash, misty) = (user(&db, "ash"), user(&db, "misty"));
    let (conversation, _) = db.get_or_create_conversation(ash, misty).unwrap();
    let (addr, dispatcher) = spawn_server(db.clone()).await;

    let gateway = connect(addr, ash).await;
    let mut session = ChatSession::for_conversation(
        LocalBackend::new(db.clone(), ash),
        gateway.clone(),
        ash,
        &conversation,
    )
    .unwrap();
    session.load().await.unwrap();
    wait_for_members(&dispatcher, Room::Conversation(conversation.id), 1).await;

    session.close();
    wait_for_members(&dispatcher, Room::Conversation(conversation.id), 0).await;

    let mut inbox = InboxController::new(LocalBackend::new(db.clone(), ash), gateway.clone(), ash);
    inbox.open().await.unwrap();
    wait_for_members(&dispatcher, Room::Inbox(ash), 1).await;

    gateway.disconnect();
    assert!(!gateway.is_connected());
    wait_for_members(&dispatcher, Room::Inbox(ash), 0).await;
}

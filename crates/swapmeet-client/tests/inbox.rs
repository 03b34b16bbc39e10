mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::Utc;
use tokio::sync::broadcast;

use swapmeet_client::InboxController;
use swapmeet_types::error::ErrorKind;
use swapmeet_types::events::{ClientCommand, ServerEvent};

use common::{LocalBackend, RecordingChannel, db, user};

#[tokio::test]
async fn open_joins_inbox_and_lists_conversations() {
    let db = db();
    let ash = user(&db, "ash");
    let (misty, brock) = (user(&db, "misty"), user(&db, "brock"));
    let (with_misty, _) = db.get_or_create_conversation(misty, ash).unwrap();
    let (with_brock, _) = db.get_or_create_conversation(ash, brock).unwrap();
    db.send_message(with_misty.id, misty, "trade?").unwrap();
    db.send_message(with_misty.id, misty, "hello??").unwrap();
    db.send_message(with_brock.id, brock, "got onix").unwrap();

    let channel = RecordingChannel::default();
    let mut inbox = InboxController::new(LocalBackend::new(db.clone(), ash), channel.clone(), ash);
    assert!(!inbox.is_loaded());

    inbox.open().await.unwrap();

    assert_eq!(channel.take(), vec![ClientCommand::Join(ash)]);
    assert!(inbox.is_loaded());
    assert_eq!(inbox.conversations().len(), 2);
    assert_eq!(inbox.conversations()[0].id, with_brock.id);
    assert_eq!(inbox.unread_for(with_misty.id), 2);
    assert_eq!(inbox.total_unread(), 3);

    inbox.mark_read(with_misty.id);
    assert_eq!(inbox.total_unread(), 1);
}

#[tokio::test]
async fn conversation_updated_refetches_the_list() {
    let db = db();
    let (ash, misty) = (user(&db, "ash"), user(&db, "misty"));
    let (conversation, _) = db.get_or_create_conversation(ash, misty).unwrap();

    let mut inbox =
        InboxController::new(LocalBackend::new(db.clone(), ash), RecordingChannel::default(), ash);
    inbox.open().await.unwrap();
    assert_eq!(inbox.total_unread(), 0);
    assert!(inbox.conversations()[0].last_message_text.is_none());

    let message = db.send_message(conversation.id, misty, "still trading?").unwrap();
    let refreshed = inbox
        .handle_event(&ServerEvent::ConversationUpdated {
            conversation_id: conversation.id,
            last_message_text: message.content.clone(),
            last_message_at: message.created_at,
        })
        .await
        .unwrap();

    assert!(refreshed);
    assert_eq!(inbox.total_unread(), 1);
    assert_eq!(
        inbox.conversations()[0].last_message_text.as_deref(),
        Some("still trading?")
    );
}

#[tokio::test]
async fn ready_rejoins_and_other_events_are_ignored() {
    let db = db();
    let ash = user(&db, "ash");
    let channel = RecordingChannel::default();
    let mut inbox = InboxController::new(LocalBackend::new(db.clone(), ash), channel.clone(), ash);
    inbox.open().await.unwrap();
    channel.take();

    let (tx, mut events) = broadcast::channel(16);
    tx.send(ServerEvent::UserTyping(ash)).unwrap();
    tx.send(ServerEvent::Ready { user_id: ash }).unwrap();

    assert!(!inbox.step(&mut events).await.unwrap());
    assert!(channel.take().is_empty());

    assert!(inbox.step(&mut events).await.unwrap());
    assert_eq!(channel.take(), vec![ClientCommand::Join(ash)]);
}

#[tokio::test]
async fn failed_refresh_keeps_the_previous_list() {
    let db = db();
    let (ash, misty) = (user(&db, "ash"), user(&db, "misty"));
    let (conversation, _) = db.get_or_create_conversation(ash, misty).unwrap();

    let backend = Arc::new(LocalBackend::new(db.clone(), ash));
    let mut inbox = InboxController::new(backend.clone(), RecordingChannel::default(), ash);
    inbox.open().await.unwrap();

    backend.fail_loads.store(true, Ordering::SeqCst);
    let event = ServerEvent::ConversationUpdated {
        conversation_id: conversation.id,
        last_message_text: "hi".into(),
        last_message_at: Utc::now(),
    };
    let err = inbox.handle_event(&event).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert_eq!(inbox.error().map(|e| e.kind), Some(ErrorKind::Internal));
    assert_eq!(inbox.conversations().len(), 1);

    backend.fail_loads.store(false, Ordering::SeqCst);
    inbox.refresh().await.unwrap();
    assert!(inbox.error().is_none());
}

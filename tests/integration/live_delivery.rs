#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::future_not_send
)]

//! Live delivery: both parties connected, the receiver gets the message
//! immediately, and the sender's echo collapses into its own confirmed copy.

use std::sync::Arc;
use std::time::Duration;

use courier::client::{ChatClient, ClientEvent, ClientSettings};
use courier::error::ClientError;
use courier::state::DeliveryState;
use courier_proto::message::{Identity, ValidationError};
use courier_server::auth::TokenTable;
use courier_server::router::{Router, RouterConfig};
use courier_server::server::{AppState, start_server_with_state};
use courier_server::store::MemoryStore;
use tokio::sync::mpsc;

async fn start_server() -> (String, Arc<AppState>) {
    let tokens: TokenTable = [
        ("alice-token", Identity::new("alice")),
        ("bob-token", Identity::new("bob")),
        ("carol-token", Identity::new("carol")),
    ]
    .into_iter()
    .collect();
    let router = Router::new(Arc::new(MemoryStore::new()), RouterConfig::default());
    let state = Arc::new(AppState::new(router, Arc::new(tokens)));
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    (format!("http://{addr}"), state)
}

async fn connected(url: &str, who: &str) -> (ChatClient, mpsc::Receiver<ClientEvent>) {
    let (client, events) = ChatClient::new(ClientSettings::new(url, format!("{who}-token"), who)).unwrap();
    client.connect().await.unwrap();
    (client, events)
}

async fn wait_for<F>(rx: &mut mpsc::Receiver<ClientEvent>, mut pred: F) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn live_message_reaches_receiver_and_echo_is_deduplicated() {
    let (url, state) = start_server().await;
    let alice_id = Identity::new("alice");
    let bob_id = Identity::new("bob");

    let (alice, mut alice_events) = connected(&url, "alice").await;
    let (bob, mut bob_events) = connected(&url, "bob").await;

    let id = alice.send(&bob_id, "hello").await.unwrap();

    let ClientEvent::MessageReceived(received) =
        wait_for(&mut bob_events, |e| matches!(e, ClientEvent::MessageReceived(_))).await
    else {
        unreachable!()
    };
    assert_eq!(received.id, id);
    assert_eq!(received.sender, alice_id);
    assert_eq!(received.body, "hello");
    assert_eq!(bob.conversation(&alice_id).len(), 1);

    // The read receipt travels on alice's socket after the echo, so once it
    // is seen the echo has been processed too.
    wait_for(&mut alice_events, |e| matches!(e, ClientEvent::MessageRead { .. })).await;

    let mine = alice.conversation(&bob_id);
    assert_eq!(mine.len(), 1, "echo must not create a second copy");
    assert_eq!(mine[0].message.id, id);
    assert!(mine[0].is_own());
    assert_eq!(mine[0].state, DeliveryState::Sent);
    assert!(mine[0].message.read);

    assert_eq!(state.router.store().queue_len(&bob_id).unwrap(), 0);
}

#[tokio::test]
async fn pair_ordering_is_preserved_for_live_delivery() {
    let (url, _state) = start_server().await;
    let alice_id = Identity::new("alice");
    let bob_id = Identity::new("bob");

    let (alice, _alice_events) = connected(&url, "alice").await;
    let (bob, mut bob_events) = connected(&url, "bob").await;

    let mut ids = Vec::new();
    for i in 0..10 {
        ids.push(alice.send(&bob_id, &format!("m{i}")).await.unwrap());
    }

    let mut seen = Vec::new();
    while seen.len() < ids.len() {
        if let ClientEvent::MessageReceived(m) =
            wait_for(&mut bob_events, |e| matches!(e, ClientEvent::MessageReceived(_))).await
        {
            seen.push(m.id);
        }
    }
    assert_eq!(seen, ids);

    let stored: Vec<_> = bob.conversation(&alice_id).iter().map(|m| m.message.id).collect();
    assert_eq!(stored, ids);
}

#[tokio::test]
async fn send_to_self_is_stored_once() {
    let (url, _state) = start_server().await;
    let alice_id = Identity::new("alice");

    let (alice, _events) = connected(&url, "alice").await;
    let id = alice.send(&alice_id, "note to self").await.unwrap();

    // The live copy lands on the same socket right after the ack.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let notes = alice.conversation(&alice_id);
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].message.id, id);
    assert!(notes[0].is_own());
}

#[tokio::test]
async fn blank_send_is_rejected_without_storing() {
    let (url, _state) = start_server().await;
    let (alice, _events) = connected(&url, "alice").await;

    let err = alice.send(&Identity::new("bob"), "   ").await.unwrap_err();
    assert!(matches!(err, ClientError::Validation(ValidationError::EmptyBody)));

    let err = alice.send(&Identity::new(" "), "hi").await.unwrap_err();
    assert!(matches!(err, ClientError::Validation(ValidationError::MissingReceiver)));

    assert!(alice.summaries().is_empty());
}

#[tokio::test]
async fn join_chat_marks_earlier_messages_read() {
    let (url, _state) = start_server().await;
    let alice_id = Identity::new("alice");
    let carol_id = Identity::new("carol");

    let mut settings = ClientSettings::new(&url, "carol-token", "carol");
    settings.auto_mark_read = false;
    let (carol, mut carol_events) = ChatClient::new(settings).unwrap();
    carol.connect().await.unwrap();
    let (alice, mut alice_events) = connected(&url, "alice").await;

    let id = alice.send(&carol_id, "ping").await.unwrap();
    wait_for(&mut carol_events, |e| matches!(e, ClientEvent::MessageReceived(_))).await;
    assert!(!carol.message(&id).unwrap().message.read);
    assert_eq!(carol.summaries()[0].unread, 1);

    assert_eq!(carol.join_chat(&alice_id).await.unwrap(), 1);
    assert!(carol.message(&id).unwrap().message.read);
    assert_eq!(carol.summaries()[0].unread, 0);

    let read = wait_for(&mut alice_events, |e| matches!(e, ClientEvent::MessageRead { .. })).await;
    assert_eq!(read, ClientEvent::MessageRead { id });
}

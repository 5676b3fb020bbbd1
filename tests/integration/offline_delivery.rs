#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::future_not_send
)]

//! Offline delivery: a message sent to an offline receiver is queued, pushed
//! on the receiver's next connect, and cleared only after the client
//! confirms the batch.

use std::sync::Arc;
use std::time::Duration;

use courier::client::{ChatClient, ClientEvent, ClientSettings};
use courier::state::DeliveryState;
use courier_proto::message::Identity;
use courier_server::auth::TokenTable;
use courier_server::router::{Router, RouterConfig};
use courier_server::server::{AppState, start_server_with_state};
use courier_server::store::MemoryStore;
use tokio::sync::mpsc;

async fn start_server() -> (String, Arc<AppState>) {
    let tokens: TokenTable = [("alice-token", Identity::new("alice")), ("bob-token", Identity::new("bob"))]
        .into_iter()
        .collect();
    let router = Router::new(Arc::new(MemoryStore::new()), RouterConfig::default());
    let state = Arc::new(AppState::new(router, Arc::new(tokens)));
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    (format!("http://{addr}"), state)
}

fn client(url: &str, who: &str) -> (ChatClient, mpsc::Receiver<ClientEvent>) {
    ChatClient::new(ClientSettings::new(url, format!("{who}-token"), who)).unwrap()
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

async fn queue_len(state: &AppState, who: &str) -> usize {
    state.router.store().queue_len(&Identity::new(who)).unwrap()
}

#[tokio::test]
async fn queued_message_flushed_on_connect_and_cleared_after_confirm() {
    let (url, state) = start_server().await;
    let bob_id = Identity::new("bob");
    let alice_id = Identity::new("alice");

    let (alice, mut alice_events) = client(&url, "alice");
    alice.connect().await.unwrap();

    let id = alice.send(&bob_id, "hi").await.unwrap();
    let sent = alice.message(&id).unwrap();
    assert_eq!(sent.state, DeliveryState::Sent);
    assert!(sent.is_own());
    assert_eq!(queue_len(&state, "bob").await, 1);

    let (bob, mut bob_events) = client(&url, "bob");
    bob.connect().await.unwrap();

    let flushed = wait_for(&mut bob_events, |e| matches!(e, ClientEvent::UnreadFlushed { .. })).await;
    assert_eq!(flushed, ClientEvent::UnreadFlushed { count: 1 });

    let conversation = bob.conversation(&alice_id);
    assert_eq!(conversation.len(), 1);
    assert_eq!(conversation[0].message.id, id);
    assert_eq!(conversation[0].message.body, "hi");
    assert!(conversation[0].message.read);

    // Clearing waits for bob's confirmation; poll until it lands.
    tokio::time::timeout(Duration::from_secs(5), async {
        while queue_len(&state, "bob").await != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // Bob read it while alice is online, so alice gets a receipt.
    let read = wait_for(&mut alice_events, |e| matches!(e, ClientEvent::MessageRead { .. })).await;
    assert_eq!(read, ClientEvent::MessageRead { id });
    assert!(alice.message(&id).unwrap().message.read);
}

#[tokio::test]
async fn queued_messages_arrive_in_send_order() {
    let (url, _state) = start_server().await;
    let bob_id = Identity::new("bob");

    let (alice, _alice_events) = client(&url, "alice");
    alice.connect().await.unwrap();
    let mut ids = Vec::new();
    for body in ["one", "two", "three"] {
        ids.push(alice.send(&bob_id, body).await.unwrap());
    }

    let (bob, mut bob_events) = client(&url, "bob");
    bob.connect().await.unwrap();
    wait_for(&mut bob_events, |e| matches!(e, ClientEvent::UnreadFlushed { count: 3 })).await;

    let got: Vec<_> = bob
        .conversation(&Identity::new("alice"))
        .iter()
        .map(|m| (m.message.id, m.message.body.clone()))
        .collect();
    assert_eq!(
        got,
        vec![
            (ids[0], "one".to_string()),
            (ids[1], "two".to_string()),
            (ids[2], "three".to_string()),
        ]
    );
}

#[tokio::test]
async fn message_queued_after_snapshot_survives_confirm() {
    let (url, state) = start_server().await;
    let bob_id = Identity::new("bob");
    let alice_id = Identity::new("alice");

    let (alice, _alice_events) = client(&url, "alice");
    alice.connect().await.unwrap();
    alice.send(&bob_id, "before").await.unwrap();

    let batch = state.router.store().snapshot(&bob_id).unwrap();
    assert_eq!(batch.messages.len(), 1);

    // Another message lands after the snapshot was taken.
    alice.send(&bob_id, "after").await.unwrap();
    let removed = state.router.confirm_flush(&bob_id, batch.through).await.unwrap();
    assert_eq!(removed, 1);

    let remaining = state.router.store().snapshot(&bob_id).unwrap();
    assert_eq!(remaining.messages.len(), 1);
    assert_eq!(remaining.messages[0].body, "after");
    assert_eq!(remaining.messages[0].sender, alice_id);
}

#[tokio::test]
async fn status_reports_last_seen_after_disconnect() {
    let (url, _state) = start_server().await;
    let bob_id = Identity::new("bob");

    let (alice, _alice_events) = client(&url, "alice");
    let status = alice.check_status(&bob_id).await.unwrap();
    assert!(!status.online);
    assert!(status.last_seen.is_none());

    let (bob, _bob_events) = client(&url, "bob");
    bob.connect().await.unwrap();
    assert!(alice.check_status(&bob_id).await.unwrap().online);

    bob.disconnect().await;
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let status = alice.check_status(&bob_id).await.unwrap();
            if !status.online {
                assert!(status.last_seen.is_some());
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

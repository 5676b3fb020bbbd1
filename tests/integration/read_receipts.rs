#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::future_not_send
)]

//! Read receipts reach the sender only if it is connected when the receiver
//! marks the message read. Receipts for an offline sender are dropped, not
//! queued.

use std::sync::Arc;
use std::time::Duration;

use courier::client::{ChatClient, ClientEvent, ClientSettings};
use courier_proto::message::Identity;
use courier_server::auth::TokenTable;
use courier_server::router::{ReceiptOutcome, Router, RouterConfig};
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

fn manual_reader(url: &str, who: &str) -> (ChatClient, mpsc::Receiver<ClientEvent>) {
    let mut settings = ClientSettings::new(url, format!("{who}-token"), who);
    settings.auto_mark_read = false;
    ChatClient::new(settings).unwrap()
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

async fn wait_offline(state: &AppState, who: &Identity) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while state.router.presence().is_online(who) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn receipt_delivered_when_sender_online() {
    let (url, _state) = start_server().await;
    let alice_id = Identity::new("alice");
    let bob_id = Identity::new("bob");

    let (alice, mut alice_events) = manual_reader(&url, "alice");
    alice.connect().await.unwrap();
    let (bob, mut bob_events) = manual_reader(&url, "bob");
    bob.connect().await.unwrap();

    let id = alice.send(&bob_id, "read me").await.unwrap();
    wait_for(&mut bob_events, |e| matches!(e, ClientEvent::MessageReceived(_))).await;
    assert!(!alice.message(&id).unwrap().message.read);

    assert_eq!(bob.mark_chat_read(&alice_id).await.unwrap(), 1);
    let read = wait_for(&mut alice_events, |e| matches!(e, ClientEvent::MessageRead { .. })).await;
    assert_eq!(read, ClientEvent::MessageRead { id });
    assert!(alice.message(&id).unwrap().message.read);

    // Marking again changes nothing.
    assert_eq!(bob.mark_chat_read(&alice_id).await.unwrap(), 0);
}

#[tokio::test]
async fn receipt_dropped_when_sender_offline() {
    let (url, state) = start_server().await;
    let alice_id = Identity::new("alice");
    let bob_id = Identity::new("bob");

    let (alice, mut alice_events) = manual_reader(&url, "alice");
    alice.connect().await.unwrap();
    let (bob, mut bob_events) = manual_reader(&url, "bob");
    bob.connect().await.unwrap();

    let id = alice.send(&bob_id, "read me later").await.unwrap();
    wait_for(&mut bob_events, |e| matches!(e, ClientEvent::MessageReceived(_))).await;

    alice.disconnect().await;
    wait_offline(&state, &alice_id).await;

    // The server-side decision: flag flipped, nobody to notify.
    assert_eq!(state.router.mark_read(&bob_id, id), ReceiptOutcome::SenderOffline);
    assert_eq!(state.router.mark_read(&bob_id, id), ReceiptOutcome::AlreadyRead);

    // Reconnecting does not replay the dropped receipt.
    while alice_events.try_recv().is_ok() {}
    alice.connect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(e) = alice_events.try_recv() {
        assert!(!matches!(e, ClientEvent::MessageRead { .. }), "dropped receipt was replayed");
    }
    assert!(!alice.message(&id).unwrap().message.read);
}

#[tokio::test]
async fn only_the_receiver_can_mark_read() {
    let (url, state) = start_server().await;
    let bob_id = Identity::new("bob");

    let (alice, _alice_events) = manual_reader(&url, "alice");
    alice.connect().await.unwrap();
    let id = alice.send(&bob_id, "mine").await.unwrap();

    assert_eq!(
        state.router.mark_read(&Identity::new("alice"), id),
        ReceiptOutcome::Ignored
    );
    assert_eq!(state.router.mark_read(&bob_id, id), ReceiptOutcome::Notified);
}

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::future_not_send
)]

//! Rebinding: a second connection for the same identity takes over live
//! delivery, and closing the older one does not take the identity offline.

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

async fn connected(url: &str, who: &str) -> (ChatClient, mpsc::Receiver<ClientEvent>) {
    let (client, events) = ChatClient::new(ClientSettings::new(url, format!("{who}-token"), who)).unwrap();
    client.connect().await.unwrap();
    (client, events)
}

async fn next_received(rx: &mut mpsc::Receiver<ClientEvent>) -> courier_proto::message::Message {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let ClientEvent::MessageReceived(m) = rx.recv().await.expect("event channel closed") {
                return m;
            }
        }
    })
    .await
    .expect("timed out waiting for message")
}

fn received_any(rx: &mut mpsc::Receiver<ClientEvent>) -> bool {
    let mut any = false;
    while let Ok(e) = rx.try_recv() {
        any |= matches!(e, ClientEvent::MessageReceived(_));
    }
    any
}

#[tokio::test]
async fn newer_connection_receives_and_stale_disconnect_is_ignored() {
    let (url, state) = start_server().await;
    let alice_id = Identity::new("alice");

    let (old, mut old_events) = connected(&url, "alice").await;
    let (new, mut new_events) = connected(&url, "alice").await;
    let (bob, _bob_events) = connected(&url, "bob").await;

    let first = bob.send(&alice_id, "to the newest").await.unwrap();
    assert_eq!(next_received(&mut new_events).await.id, first);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!received_any(&mut old_events));

    // Closing the superseded connection must not unbind the newer one.
    old.disconnect().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(state.router.presence().is_online(&alice_id));
    assert!(bob.check_status(&alice_id).await.unwrap().online);

    let second = bob.send(&alice_id, "still live").await.unwrap();
    assert_eq!(next_received(&mut new_events).await.id, second);
    assert_eq!(state.router.store().queue_len(&alice_id).unwrap(), 0);

    new.disconnect().await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while state.router.presence().is_online(&alice_id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // With nobody bound the next message is queued.
    bob.send(&alice_id, "queued").await.unwrap();
    assert_eq!(state.router.store().queue_len(&alice_id).unwrap(), 1);
}

#[tokio::test]
async fn reconnect_after_disconnect_receives_queue() {
    let (url, _state) = start_server().await;
    let alice_id = Identity::new("alice");

    let (alice, mut alice_events) = connected(&url, "alice").await;
    alice.disconnect().await;
    assert!(!alice.is_connected());

    let (bob, _bob_events) = connected(&url, "bob").await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while bob.check_status(&alice_id).await.unwrap().online {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    let id = bob.send(&alice_id, "while you were out").await.unwrap();

    alice.connect().await.unwrap();
    assert_eq!(next_received(&mut alice_events).await.id, id);
    assert_eq!(alice.conversation(&Identity::new("bob")).len(), 1);
}

#[tokio::test]
async fn reconnect_keeps_sends_on_the_new_connection() {
    let (url, _state) = start_server().await;
    let bob_id = Identity::new("bob");

    let (_bob, mut bob_events) = connected(&url, "bob").await;
    let (alice, _alice_events) = connected(&url, "alice").await;

    for round in 0..5 {
        alice.connect().await.unwrap();
        let body = format!("after reconnect {round}");
        let id = alice.send(&bob_id, &body).await.unwrap();
        assert_eq!(alice.message(&id).unwrap().state, DeliveryState::Sent);
        assert_eq!(next_received(&mut bob_events).await.id, id);
    }

    // Give the replaced dispatchers time to wind down.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let conversation = alice.conversation(&bob_id);
    assert_eq!(conversation.len(), 5);
    assert!(conversation.iter().all(|m| m.state == DeliveryState::Sent));
    assert!(alice.is_connected());
}

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::future_not_send
)]

//! Request/response fallback: sends without a live connection, unread
//! fetch that drains the queue, status queries, and error mapping.

use std::sync::Arc;
use std::time::Duration;

use courier::client::{ChatClient, ClientEvent, ClientSettings};
use courier::error::{ClientError, TransportError};
use courier::fallback::HttpFallback;
use courier::state::DeliveryState;
use courier_proto::message::Identity;
use courier_server::auth::TokenTable;
use courier_server::router::{Router, RouterConfig};
use courier_server::server::{AppState, start_server_with_state};
use courier_server::store::MemoryStore;
use tokio::sync::mpsc;

async fn start_server(config: RouterConfig) -> (String, Arc<AppState>) {
    let tokens: TokenTable = [("alice-token", Identity::new("alice")), ("bob-token", Identity::new("bob"))]
        .into_iter()
        .collect();
    let router = Router::new(Arc::new(MemoryStore::new()), config);
    let state = Arc::new(AppState::new(router, Arc::new(tokens)));
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    (format!("http://{addr}"), state)
}

fn offline_client(url: &str, who: &str) -> (ChatClient, mpsc::Receiver<ClientEvent>) {
    ChatClient::new(ClientSettings::new(url, format!("{who}-token"), who)).unwrap()
}

#[tokio::test]
async fn send_without_connection_uses_http_and_confirms() {
    let (url, state) = start_server(RouterConfig::default()).await;
    let bob_id = Identity::new("bob");

    let (alice, _events) = offline_client(&url, "alice");
    assert!(!alice.is_connected());

    let id = alice.send(&bob_id, "over http").await.unwrap();
    let stored = alice.message(&id).unwrap();
    assert_eq!(stored.state, DeliveryState::Sent);
    assert_eq!(stored.message.body, "over http");
    assert_eq!(state.router.store().queue_len(&bob_id).unwrap(), 1);
}

#[tokio::test]
async fn http_send_to_online_receiver_is_live() {
    let (url, state) = start_server(RouterConfig::default()).await;
    let bob_id = Identity::new("bob");

    let (bob, mut bob_events) = offline_client(&url, "bob");
    bob.connect().await.unwrap();
    let (alice, _alice_events) = offline_client(&url, "alice");

    let id = alice.send(&bob_id, "fallback to live").await.unwrap();
    let received = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(ClientEvent::MessageReceived(m)) = bob_events.recv().await {
                return m;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(received.id, id);
    assert_eq!(state.router.store().queue_len(&bob_id).unwrap(), 0);
}

#[tokio::test]
async fn fetch_unread_drains_queue_once() {
    let (url, state) = start_server(RouterConfig::default()).await;
    let bob_id = Identity::new("bob");
    let alice_id = Identity::new("alice");

    let (alice, _alice_events) = offline_client(&url, "alice");
    alice.send(&bob_id, "first").await.unwrap();
    alice.send(&bob_id, "second").await.unwrap();

    let (bob, _bob_events) = offline_client(&url, "bob");
    assert_eq!(bob.fetch_unread().await.unwrap(), 2);
    assert_eq!(state.router.store().queue_len(&bob_id).unwrap(), 0);
    assert_eq!(bob.fetch_unread().await.unwrap(), 0);

    let bodies: Vec<_> = bob
        .conversation(&alice_id)
        .iter()
        .map(|m| m.message.body.clone())
        .collect();
    assert_eq!(bodies, ["first", "second"]);
    // Without a live connection nothing is marked, so nothing goes unreported.
    assert_eq!(bob.summaries()[0].unread, 2);
    assert_eq!(bob.mark_chat_read(&alice_id).await.unwrap(), 0);
    assert_eq!(bob.join_chat(&alice_id).await.unwrap(), 0);
    assert_eq!(bob.summaries()[0].unread, 2);

    bob.connect().await.unwrap();
    assert_eq!(bob.mark_chat_read(&alice_id).await.unwrap(), 2);
    assert_eq!(bob.summaries()[0].unread, 0);
}

#[tokio::test]
async fn bad_credential_is_unauthorized() {
    let (url, _state) = start_server(RouterConfig::default()).await;

    let fallback = HttpFallback::new(&url, "wrong", Duration::from_secs(5)).unwrap();
    let err = fallback.send(&Identity::new("bob"), "hi").await.unwrap_err();
    assert!(matches!(err, TransportError::Unauthorized));

    let (mallory, _events) = ChatClient::new(ClientSettings::new(&url, "wrong", "mallory")).unwrap();
    let err = mallory.connect().await.unwrap_err();
    assert!(matches!(err, ClientError::Transport(TransportError::Unauthorized)));

    let err = mallory.send(&Identity::new("bob"), "hi").await.unwrap_err();
    let ClientError::Transport(TransportError::Unauthorized) = err else {
        panic!("expected unauthorized, got {err:?}");
    };
    let failed = &mallory.conversation(&Identity::new("bob"))[0];
    assert_eq!(failed.state, DeliveryState::Failed);
}

#[tokio::test]
async fn validation_failure_maps_to_bad_request() {
    let (url, _state) = start_server(RouterConfig::default()).await;

    let fallback = HttpFallback::new(&url, "alice-token", Duration::from_secs(5)).unwrap();
    let err = fallback.send(&Identity::new(""), "hi").await.unwrap_err();
    let TransportError::Rejected { status, error } = err else {
        panic!("expected rejection, got {err:?}");
    };
    assert_eq!(status, 400);
    assert_eq!(error, "receiver is required");
}

#[tokio::test]
async fn unknown_receiver_rejected_when_creation_disabled() {
    let config = RouterConfig {
        create_unknown_receivers: false,
        ..RouterConfig::default()
    };
    let (url, _state) = start_server(config).await;

    let (alice, _events) = offline_client(&url, "alice");
    let err = alice.send(&Identity::new("nobody"), "hello?").await.unwrap_err();
    let ClientError::Rejected { id, reason } = err else {
        panic!("expected rejection, got {err:?}");
    };
    assert_eq!(reason, "unknown receiver nobody");
    assert_eq!(alice.message(&id).unwrap().state, DeliveryState::Failed);
}

#[tokio::test]
async fn status_of_never_seen_identity() {
    let (url, _state) = start_server(RouterConfig::default()).await;
    let (alice, _events) = offline_client(&url, "alice");

    let status = alice.check_status(&Identity::new("ghost")).await.unwrap();
    assert!(!status.online);
    assert!(status.last_seen.is_none());
}

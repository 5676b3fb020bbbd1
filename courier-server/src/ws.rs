//! Real-time channel: WebSocket upgrade, per-connection tasks, and frame
//! dispatch into the [`Router`](crate::router::Router).
//!
//! The connection lifecycle:
//! 1. Verify the bearer credential (header or `?token=`); refuse with 401
//!    before upgrading if it is missing or invalid.
//! 2. Queue `ready`, bind the connection, and push any pending queue.
//! 3. Process client frames one at a time until the socket closes.
//! 4. Unbind, unless a newer connection already took over the identity.

use std::sync::Arc;

use axum::Json;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use courier_proto::api::ErrorResponse;
use courier_proto::frame::{self, AckPayload, ClientFrame, ServerFrame};
use courier_proto::message::Identity;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::auth::{self, AuthError};
use crate::presence::ConnectionHandle;
use crate::server::AppState;

/// Query parameters accepted on `/ws`.
#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Bearer credential for clients that cannot set headers.
    pub token: Option<String>,
}

/// Picks the credential from the `Authorization` header, else `?token=`.
fn credential(headers: &HeaderMap, params: &WsParams) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(auth::bearer_token)
        .map(str::to_string)
        .or_else(|| params.token.clone().filter(|t| !t.is_empty()))
}

/// axum handler that authenticates and upgrades to a WebSocket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
) -> Response {
    let Some(token) = credential(&headers, &params) else {
        return reject(&AuthError::MissingCredential);
    };
    match state.verifier.verify(&token).await {
        Ok(identity) => ws.on_upgrade(move |socket| handle_socket(socket, state, identity)),
        Err(e) => {
            tracing::warn!(error = %e, "refusing real-time connection");
            reject(&e)
        }
    }
}

fn reject(err: &AuthError) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse::new(err.to_string())),
    )
        .into_response()
}

/// Drives one authenticated connection until it closes.
pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>, identity: Identity) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
    let handle = ConnectionHandle::new(state.router.presence().allocate_id(), tx);
    let conn_id = handle.id();

    tracing::info!(identity = %identity, conn = %conn_id, "connection opened");

    handle.send(ServerFrame::Ready {
        identity: identity.clone(),
    });
    if let Err(e) = state.router.connect(&identity, handle.clone()).await {
        tracing::error!(identity = %identity, error = %e, "pending flush failed");
        handle.send(ServerFrame::Error {
            reason: e.to_string(),
        });
    }

    let writer_identity = identity.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match frame::encode(&frame) {
                Ok(t) => t,
                Err(e) => {
                    tracing::error!(identity = %writer_identity, error = %e, "failed to encode frame");
                    continue;
                }
            };
            if ws_sender.send(WsMessage::Text(text.into())).await.is_err() {
                tracing::warn!(identity = %writer_identity, "WebSocket write failed");
                break;
            }
        }
    });

    let reader_identity = identity.clone();
    let reader_state = Arc::clone(&state);
    let reader_handle = handle.clone();
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                WsMessage::Text(text) => {
                    handle_text(&reader_identity, text.as_str(), &reader_state, &reader_handle).await;
                }
                WsMessage::Close(_) => {
                    tracing::debug!(identity = %reader_identity, "received close frame");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    if state.router.disconnect(&identity, conn_id).await {
        tracing::info!(identity = %identity, conn = %conn_id, "connection closed");
    } else {
        tracing::info!(identity = %identity, conn = %conn_id, "superseded connection closed");
    }
}

/// Decodes and dispatches one client frame.
async fn handle_text(identity: &Identity, text: &str, state: &AppState, handle: &ConnectionHandle) {
    let frame = match frame::decode::<ClientFrame>(text) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(identity = %identity, error = %e, "failed to decode client frame");
            handle.send(ServerFrame::Error {
                reason: e.to_string(),
            });
            return;
        }
    };

    match frame {
        ClientFrame::SendMessage {
            request_id,
            receiver,
            body,
        } => {
            let result = state
                .router
                .route(identity, receiver, body, |result| {
                    let ack = match result {
                        Ok(routed) => AckPayload::delivered(routed.message.id, routed.message.sent_at),
                        Err(e) => {
                            tracing::warn!(identity = %identity, request_id, error = %e, "send rejected");
                            AckPayload::rejected(e.to_string())
                        }
                    };
                    handle.send(ServerFrame::Ack {
                        request_id,
                        result: ack,
                    });
                })
                .await;
            match result {
                Ok(routed) => tracing::debug!(
                    identity = %identity,
                    request_id,
                    id = %routed.message.id,
                    delivery = ?routed.delivery,
                    "message routed"
                ),
                Err(e) => tracing::debug!(identity = %identity, request_id, error = %e, "message not routed"),
            }
        }
        ClientFrame::JoinChat { receiver } => {
            state.router.join_chat(identity, &receiver);
        }
        ClientFrame::MarkRead { message_id } => {
            state.router.mark_read(identity, message_id);
        }
        ClientFrame::UnreadReceived { through } => {
            if let Err(e) = state.router.confirm_flush(identity, through).await {
                tracing::error!(identity = %identity, through, error = %e, "failed to clear flushed batch");
                handle.send(ServerFrame::Error {
                    reason: e.to_string(),
                });
            }
        }
    }
}

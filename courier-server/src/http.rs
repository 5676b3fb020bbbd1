//! Request/response fallback for clients without a live connection.
//!
//! Sends go through the same [`Router`](crate::router::Router) as the
//! real-time path; the HTTP response stands in for the acknowledgment.

use std::sync::Arc;

use axum::Json;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::header;
use axum::http::request::Parts;
use courier_proto::api::{SendRequest, SendResponse, UnreadResponse};
use courier_proto::message::Identity;
use courier_proto::presence::UserStatus;

use crate::auth::{self, AuthError};
use crate::error::DeliveryError;
use crate::server::AppState;

/// Identity resolved from the request's bearer credential.
#[derive(Debug, Clone)]
pub struct Authenticated(pub Identity);

impl FromRequestParts<Arc<AppState>> for Authenticated {
    type Rejection = DeliveryError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(auth::bearer_token)
            .ok_or(AuthError::MissingCredential)?;
        let identity = state.verifier.verify(token).await?;
        Ok(Self(identity))
    }
}

/// `POST /api/messages/send`
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Authenticated(sender): Authenticated,
    Json(request): Json<SendRequest>,
) -> Result<Json<SendResponse>, DeliveryError> {
    let routed = state
        .router
        .route(&sender, request.receiver, request.body, |_| {})
        .await
        .inspect_err(|e| tracing::warn!(sender = %sender, error = %e, "fallback send rejected"))?;
    Ok(Json(SendResponse {
        success: true,
        message_id: routed.message.id,
        time: routed.message.sent_at,
    }))
}

/// `GET /api/messages/unread`
pub async fn fetch_unread(
    State(state): State<Arc<AppState>>,
    Authenticated(identity): Authenticated,
) -> Result<Json<UnreadResponse>, DeliveryError> {
    let messages = state.router.fetch_unread(&identity).await?;
    Ok(Json(UnreadResponse { messages }))
}

/// `GET /api/messages/user-status/{identity}`
pub async fn user_status(
    State(state): State<Arc<AppState>>,
    Authenticated(_caller): Authenticated,
    Path(identity): Path<String>,
) -> Result<Json<UserStatus>, DeliveryError> {
    Ok(Json(state.router.status(&Identity::new(identity))?))
}

/// `GET /health`
pub async fn health() -> &'static str {
    "ok"
}

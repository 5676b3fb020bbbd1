//! Delivery error taxonomy and its HTTP mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use courier_proto::api::ErrorResponse;
use courier_proto::message::ValidationError;

use crate::auth::AuthError;
use crate::store::StoreError;

/// Why a delivery operation failed.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The caller's credential was missing or invalid.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// The request was malformed.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The pending store failed; nothing was accepted.
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),
}

impl DeliveryError {
    /// HTTP status for this error class.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Persistence(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for DeliveryError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(ErrorResponse::new(self.to_string()))).into_response()
    }
}

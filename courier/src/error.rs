//! Client error types.

use courier_proto::frame::CodecError;
use courier_proto::message::{Identity, MessageId, ValidationError};

use crate::state::StateError;

/// Errors raised by the real-time connection and the HTTP fallback.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection is closed or was never opened.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The server refused the credential.
    #[error("credential rejected by server")]
    Unauthorized,

    /// The handshake completed but the server misbehaved.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The configured server URL is unusable.
    #[error("invalid server url: {0}")]
    InvalidUrl(String),

    /// The server answered a fallback request with an error status.
    #[error("server rejected request ({status}): {error}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Error text from the response body.
        error: String,
    },

    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The WebSocket layer failed.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The HTTP client failed.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors surfaced by [`crate::client::ChatClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The send was rejected locally before anything left the client.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The message was not acknowledged within the window.
    #[error("no acknowledgment for message {id}")]
    AckTimeout {
        /// Provisional id of the failed message.
        id: MessageId,
    },

    /// The server rejected the message.
    #[error("message {id} rejected: {reason}")]
    Rejected {
        /// Provisional id of the failed message.
        id: MessageId,
        /// Server-provided reason.
        reason: String,
    },

    /// The connection dropped while waiting for the acknowledgment.
    #[error("connection lost before message {id} was acknowledged")]
    ConnectionLost {
        /// Provisional id of the failed message.
        id: MessageId,
    },

    /// The server authenticated us as someone else.
    #[error("server identified us as {actual}, expected {expected}")]
    IdentityMismatch {
        /// Configured identity.
        expected: Identity,
        /// Identity announced by the server.
        actual: Identity,
    },

    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Local state could not be saved or loaded.
    #[error(transparent)]
    State(#[from] StateError),
}

//! Request and response bodies for the HTTP fallback path.

use serde::{Deserialize, Serialize};

use crate::message::{Identity, Message, MessageId, Timestamp};

/// Body of `POST /api/messages/send`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    /// Who the message is for.
    #[serde(default = "blank_identity")]
    pub receiver: Identity,
    /// Message text.
    #[serde(default, alias = "message")]
    pub body: String,
}

fn blank_identity() -> Identity {
    Identity::new("")
}

/// Successful response to a send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResponse {
    /// Always `true`.
    pub success: bool,
    /// Canonical message id.
    pub message_id: MessageId,
    /// Canonical timestamp.
    pub time: Timestamp,
}

/// Error body returned with any non-2xx status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Always `false`.
    pub success: bool,
    /// Human-readable error description.
    pub error: String,
}

impl ErrorResponse {
    /// Builds an error body.
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}

/// Response to `GET /api/messages/unread`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnreadResponse {
    /// Messages that were waiting, oldest first.
    pub messages: Vec<Message>,
}

//! Real-time channel frames and their JSON codec.
//!
//! Every WebSocket text frame carries exactly one [`ClientFrame`] (client to
//! server) or [`ServerFrame`] (server to client). Frames are adjacently
//! tagged: `{"event": "send-message", "data": {...}}`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::message::{Identity, Message, MessageId, Timestamp};

/// Frames sent by a client over the real-time channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
#[serde(rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Opens (or re-opens) the conversation room shared with `receiver`.
    JoinChat {
        /// The other participant.
        receiver: Identity,
    },
    /// Sends a message. Answered by exactly one [`ServerFrame::Ack`]
    /// carrying the same `request_id`.
    SendMessage {
        /// Client-chosen correlation id, unique per connection.
        request_id: u64,
        /// Who the message is for.
        receiver: Identity,
        /// Message text.
        body: String,
    },
    /// Reports that a message has been displayed. Fire-and-forget.
    MarkRead {
        /// The message that was read.
        message_id: MessageId,
    },
    /// Confirms receipt of an [`ServerFrame::UnreadMessages`] batch so the
    /// server may clear the flushed entries.
    UnreadReceived {
        /// The `through` cursor of the batch being confirmed.
        through: u64,
    },
}

/// Outcome carried by an acknowledgment.
///
/// On the wire this is `{success, id, time}` or `{success: false, error}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    /// Whether the send was accepted.
    pub success: bool,
    /// Canonical server-issued message id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    /// Canonical server-issued timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<Timestamp>,
    /// Failure description when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AckPayload {
    /// Builds a successful acknowledgment.
    #[must_use]
    pub const fn delivered(id: MessageId, time: Timestamp) -> Self {
        Self {
            success: true,
            id: Some(id),
            time: Some(time),
            error: None,
        }
    }

    /// Builds a failed acknowledgment.
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            id: None,
            time: None,
            error: Some(error.into()),
        }
    }

    /// Converts the payload into the canonical id/time pair or the error.
    ///
    /// # Errors
    ///
    /// Returns the server's error text when the ack reports failure, or a
    /// description of the malformed ack when a success lacks id or time.
    pub fn into_result(self) -> Result<(MessageId, Timestamp), String> {
        match (self.success, self.id, self.time) {
            (true, Some(id), Some(time)) => Ok((id, time)),
            (true, _, _) => Err("acknowledgment is missing id or time".to_string()),
            (false, _, _) => Err(self.error.unwrap_or_else(|| "unknown error".to_string())),
        }
    }
}

/// Frames pushed by the server over the real-time channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
#[serde(rename_all_fields = "camelCase")]
pub enum ServerFrame {
    /// First frame after a successful upgrade; echoes the verified identity.
    Ready {
        /// Identity the credential resolved to.
        identity: Identity,
    },
    /// Acknowledgment for a [`ClientFrame::SendMessage`].
    Ack {
        /// Correlation id copied from the request.
        request_id: u64,
        /// The outcome.
        result: AckPayload,
    },
    /// A live-delivered message (also used for the sender's own echo).
    NewMessage(Message),
    /// The pending queue flushed on connect, oldest first.
    UnreadMessages {
        /// Cursor to echo back in [`ClientFrame::UnreadReceived`].
        through: u64,
        /// The queued messages.
        messages: Vec<Message>,
    },
    /// One of the client's messages has been read by its receiver.
    MessageRead {
        /// The message that was read.
        message_id: MessageId,
    },
    /// A request could not be processed.
    Error {
        /// Human-readable error description.
        reason: String,
    },
}

/// Error type for frame encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("frame encode error: {0}")]
    Encode(#[source] serde_json::Error),
    /// The text is not a valid frame.
    #[error("frame decode error: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Encodes a frame as JSON text.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if the frame cannot be serialized.
pub fn encode<T: Serialize>(frame: &T) -> Result<String, CodecError> {
    serde_json::to_string(frame).map_err(CodecError::Encode)
}

/// Decodes a frame from JSON text.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] if the text is not a valid frame.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    serde_json::from_str(text).map_err(CodecError::Decode)
}

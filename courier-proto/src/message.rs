//! Core message types shared by the server and the client.
//!
//! Everything here is serialized as JSON on both the real-time channel and
//! the request/response fallback, so field names follow the camelCase
//! convention of the wire format.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum allowed message body size in bytes (64 KB).
pub const MAX_BODY_SIZE: usize = 64 * 1024;

/// Sender value a client substitutes for its own identity when it stores
/// an echoed message.
pub const SELF_MARKER: &str = "SELF";

/// A stable, externally verified participant key.
///
/// Identities are produced by the identity verifier from a bearer
/// credential and are never generated by this crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Wraps an identity string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The marker identity used for locally authored messages.
    #[must_use]
    pub fn self_marker() -> Self {
        Self(SELF_MARKER.to_string())
    }

    /// Returns the string form of this identity.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if this is the local-author marker.
    #[must_use]
    pub fn is_self_marker(&self) -> bool {
        self.0 == SELF_MARKER
    }

    /// Returns `true` if the identity is empty or whitespace only.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Unique identifier for a message, based on UUID v7 for time-ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new time-ordered message identifier (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// A direct message between two identities.
///
/// The `read` flag only ever moves from `false` to `true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Globally unique message id (server-issued once acknowledged).
    pub id: MessageId,
    /// Who wrote the message.
    pub sender: Identity,
    /// Who the message is addressed to.
    pub receiver: Identity,
    /// Message text.
    pub body: String,
    /// When the message was accepted.
    pub sent_at: Timestamp,
    /// Whether the receiver has displayed the message.
    #[serde(default)]
    pub read: bool,
}

impl Message {
    /// Returns the identity on the other side of the conversation from
    /// `local`'s point of view.
    #[must_use]
    pub fn correspondent(&self, local: &Identity) -> &Identity {
        if &self.sender == local || self.sender.is_self_marker() {
            &self.receiver
        } else {
            &self.sender
        }
    }
}

/// Error returned when a send request fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// No receiver was given.
    #[error("receiver is required")]
    MissingReceiver,
    /// The message body is empty or whitespace only.
    #[error("message body is empty")]
    EmptyBody,
    /// The message body exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the body in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
    /// The receiver has no identity record and implicit creation is disabled.
    #[error("unknown receiver {0}")]
    UnknownReceiver(Identity),
}

/// Validates the user-supplied parts of a send request.
///
/// # Errors
///
/// Returns [`ValidationError::MissingReceiver`] for a blank receiver,
/// [`ValidationError::EmptyBody`] for a blank body, or
/// [`ValidationError::TooLarge`] if the body exceeds `max_body_size`.
pub fn validate_send(
    receiver: &Identity,
    body: &str,
    max_body_size: usize,
) -> Result<(), ValidationError> {
    if receiver.is_blank() {
        return Err(ValidationError::MissingReceiver);
    }
    if body.trim().is_empty() {
        return Err(ValidationError::EmptyBody);
    }
    if body.len() > max_body_size {
        return Err(ValidationError::TooLarge {
            size: body.len(),
            max: max_body_size,
        });
    }
    Ok(())
}

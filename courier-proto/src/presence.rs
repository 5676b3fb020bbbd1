//! Presence status as reported to status queries.

use serde::{Deserialize, Serialize};

use crate::message::Timestamp;

/// Reachability of an identity, as answered by `fetch status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatus {
    /// Whether the identity currently has a live connection.
    pub online: bool,
    /// When the identity last connected or disconnected, if ever.
    pub last_seen: Option<Timestamp>,
}

impl UserStatus {
    /// Status of an identity that has never been seen.
    #[must_use]
    pub const fn unknown() -> Self {
        Self {
            online: false,
            last_seen: None,
        }
    }
}

impl std::fmt::Display for UserStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.online, self.last_seen) {
            (true, _) => write!(f, "online"),
            (false, Some(ts)) => write!(f, "offline (last seen {ts})"),
            (false, None) => write!(f, "offline"),
        }
    }
}

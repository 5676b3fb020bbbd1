//! Conversation rooms for direct chats.
//!
//! A room is named by the unordered pair of its two participants, so
//! `alice`/`bob` and `bob`/`alice` share one room. Rooms only track who has
//! opened the conversation; delivery itself goes through the presence
//! registry. Entries are ephemeral and lost on restart.

use std::collections::{HashMap, HashSet};

use courier_proto::message::Identity;
use parking_lot::RwLock;

/// Canonical key of a two-party conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomKey {
    low: Identity,
    high: Identity,
}

impl RoomKey {
    /// Builds the key for the conversation between `a` and `b`.
    #[must_use]
    pub fn between(a: &Identity, b: &Identity) -> Self {
        if a <= b {
            Self {
                low: a.clone(),
                high: b.clone(),
            }
        } else {
            Self {
                low: b.clone(),
                high: a.clone(),
            }
        }
    }

    /// Returns `true` if `identity` is one of the two parties.
    #[must_use]
    pub fn involves(&self, identity: &Identity) -> bool {
        &self.low == identity || &self.high == identity
    }
}

impl std::fmt::Display for RoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.low, self.high)
    }
}

/// Which identities currently have each conversation open.
#[derive(Debug, Default)]
pub struct ConversationRooms {
    rooms: RwLock<HashMap<RoomKey, HashSet<Identity>>>,
}

impl ConversationRooms {
    /// Creates an empty room table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `member` opened the conversation with `other`.
    pub fn join(&self, member: &Identity, other: &Identity) -> RoomKey {
        let key = RoomKey::between(member, other);
        self.rooms
            .write()
            .entry(key.clone())
            .or_default()
            .insert(member.clone());
        key
    }

    /// Identities currently in the room.
    #[must_use]
    pub fn members(&self, key: &RoomKey) -> Vec<Identity> {
        self.rooms
            .read()
            .get(key)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Removes `member` from every room, dropping rooms that become empty.
    ///
    /// Returns how many rooms `member` left.
    pub fn leave_all(&self, member: &Identity) -> usize {
        let mut rooms = self.rooms.write();
        let mut left = 0;
        rooms.retain(|_, members| {
            if members.remove(member) {
                left += 1;
            }
            !members.is_empty()
        });
        left
    }

    /// Number of rooms with at least one member.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rooms.read().len()
    }

    /// Returns `true` if no rooms are open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

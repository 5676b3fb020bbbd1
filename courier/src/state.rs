//! Client-side message state and reconciliation.
//!
//! [`ClientStore`] is the single owner of everything the client knows about
//! its conversations: optimistic sends awaiting acknowledgment, messages
//! received live or from a flush, and read flags in both directions.
//! Summaries are derived on demand and never stored.
//!
//! Locally authored messages are stored with the [`SELF_MARKER`] sender.
//! Delivery state only moves `Pending -> Sent` or `Pending -> Failed`;
//! `read` only moves `false -> true`.
//!
//! Persistence is explicit: [`ClientStore::persist`] writes a JSON snapshot
//! atomically and [`ClientStore::load`] reads it back.
//!
//! [`SELF_MARKER`]: courier_proto::message::SELF_MARKER

use std::collections::BTreeMap;
use std::path::Path;

use courier_proto::message::{self, Identity, Message, MessageId, Timestamp, ValidationError};
use serde::{Deserialize, Serialize};

/// Errors from loading or persisting client state.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The state file could not be read or written.
    #[error("state file I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The state file is not valid JSON for this format.
    #[error("state file is malformed: {0}")]
    Json(#[from] serde_json::Error),

    /// The state file belongs to a different identity.
    #[error("state file belongs to {found}, expected {expected}")]
    IdentityMismatch {
        /// Identity the store was opened for.
        expected: Identity,
        /// Identity recorded in the file.
        found: Identity,
    },
}

/// Sender-side delivery state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    /// Sent optimistically, awaiting acknowledgment.
    Pending,
    /// Acknowledged by the server.
    Sent,
    /// No acknowledgment within the window, or rejected. Terminal.
    Failed,
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Sent => write!(f, "sent"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A message as the client tracks it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalMessage {
    /// The message; `sender` is the self marker for own messages.
    #[serde(flatten)]
    pub message: Message,
    /// Delivery state.
    pub state: DeliveryState,
    /// Why the send failed, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Server id of a failed send whose acknowledgment arrived after the
    /// window closed. Its echo is folded into this entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_as: Option<MessageId>,
}

impl LocalMessage {
    /// Returns `true` if this client authored the message.
    #[must_use]
    pub fn is_own(&self) -> bool {
        self.message.sender.is_self_marker()
    }
}

/// Per-correspondent overview, derived from the stored messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSummary {
    /// The other participant.
    pub correspondent: Identity,
    /// Body of the most recent message.
    pub last_body: String,
    /// Time of the most recent message.
    pub last_at: Timestamp,
    /// Incoming messages not yet read.
    pub unread: usize,
}

/// Result of a delivery-state transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The transition happened.
    Applied,
    /// The message was not `Pending`; nothing changed.
    Rejected(DeliveryState),
    /// No message with that id.
    NotFound,
}

/// Result of ingesting a server-delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingested {
    /// A new message was stored.
    Inserted,
    /// The id was already known; only the read flag was merged.
    Duplicate,
}

/// Serialized form of a [`ClientStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreSnapshot {
    identity: Identity,
    conversations: BTreeMap<Identity, Vec<LocalMessage>>,
}

/// The client's conversations and their reconciliation state.
#[derive(Debug, Clone)]
pub struct ClientStore {
    local: Identity,
    max_body_size: usize,
    conversations: BTreeMap<Identity, Vec<LocalMessage>>,
}

impl ClientStore {
    /// Creates an empty store for `local`.
    #[must_use]
    pub fn new(local: Identity) -> Self {
        Self {
            local,
            max_body_size: message::MAX_BODY_SIZE,
            conversations: BTreeMap::new(),
        }
    }

    /// Overrides the maximum body size checked by [`ClientStore::begin_send`].
    #[must_use]
    pub fn with_max_body_size(mut self, max: usize) -> Self {
        self.max_body_size = max;
        self
    }

    /// The identity this store belongs to.
    #[must_use]
    pub const fn local(&self) -> &Identity {
        &self.local
    }

    /// Records an optimistic send and returns its provisional id.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] for a blank receiver or body, or a body
    /// over the size limit. Nothing is stored in that case.
    pub fn begin_send(&mut self, receiver: &Identity, body: &str) -> Result<MessageId, ValidationError> {
        let receiver = Identity::new(receiver.as_str().trim());
        message::validate_send(&receiver, body, self.max_body_size)?;

        let id = MessageId::new();
        let local = LocalMessage {
            message: Message {
                id,
                sender: Identity::self_marker(),
                receiver: receiver.clone(),
                body: body.to_string(),
                sent_at: Timestamp::now(),
                read: false,
            },
            state: DeliveryState::Pending,
            error: None,
            delivered_as: None,
        };
        self.conversations.entry(receiver).or_default().push(local);
        Ok(id)
    }

    /// `Pending -> Sent`, adopting the server's id and timestamp.
    pub fn confirm(&mut self, provisional: MessageId, canonical: MessageId, time: Timestamp) -> Transition {
        let Some((key, index)) = self.locate(&provisional) else {
            return Transition::NotFound;
        };
        let Some(list) = self.conversations.get_mut(&key) else {
            return Transition::NotFound;
        };
        let state = list[index].state;
        if state != DeliveryState::Pending {
            return Transition::Rejected(state);
        }

        // An echo carrying the canonical id may already be stored.
        let duplicate = list
            .iter()
            .position(|m| m.message.id == canonical && m.message.id != provisional);
        let mut index = index;
        if let Some(dup) = duplicate {
            let removed = list.remove(dup);
            if dup < index {
                index -= 1;
            }
            list[index].message.read |= removed.message.read;
        }

        let entry = &mut list[index];
        entry.message.id = canonical;
        entry.message.sent_at = time;
        entry.state = DeliveryState::Sent;
        Transition::Applied
    }

    /// `Pending -> Failed`.
    pub fn fail(&mut self, provisional: MessageId, reason: impl Into<String>) -> Transition {
        let Some(entry) = self.find_mut(&provisional) else {
            return Transition::NotFound;
        };
        if entry.state != DeliveryState::Pending {
            return Transition::Rejected(entry.state);
        }
        entry.state = DeliveryState::Failed;
        entry.error = Some(reason.into());
        Transition::Applied
    }

    /// Links a timed-out send to the server id a late acknowledgment
    /// reported. The entry keeps its state, which is `Failed` or about to be.
    ///
    /// Returns `false` if `provisional` is unknown or already `Sent`.
    pub fn record_late_delivery(&mut self, provisional: MessageId, canonical: MessageId) -> bool {
        match self.find_mut(&provisional) {
            Some(entry) if entry.state != DeliveryState::Sent => {
                entry.delivered_as = Some(canonical);
                true
            }
            _ => false,
        }
    }

    /// Stores a message pushed by the server, deduplicating by id.
    ///
    /// Messages authored by the local identity are stored with the self
    /// marker as sender. The echo of a failed send that the server delivered
    /// anyway is absorbed by that send's entry.
    pub fn ingest(&mut self, mut message: Message) -> Ingested {
        if message.sender == self.local {
            message.sender = Identity::self_marker();
        }
        let correspondent = message.correspondent(&self.local).clone();
        let list = self.conversations.entry(correspondent).or_default();

        if let Some(existing) = list.iter_mut().find(|m| m.message.id == message.id) {
            existing.message.read |= message.read;
            return Ingested::Duplicate;
        }
        if message.sender.is_self_marker() && list.iter().any(|m| m.delivered_as == Some(message.id)) {
            return Ingested::Duplicate;
        }

        let at = list
            .iter()
            .rposition(|m| m.message.sent_at <= message.sent_at)
            .map_or(0, |i| i + 1);
        list.insert(
            at,
            LocalMessage {
                message,
                state: DeliveryState::Sent,
                error: None,
                delivered_as: None,
            },
        );
        Ingested::Inserted
    }

    /// Marks one incoming message read. Returns `true` if it was unread.
    pub fn mark_message_read(&mut self, id: &MessageId) -> bool {
        match self.find_mut(id) {
            Some(entry) if !entry.is_own() && !entry.message.read => {
                entry.message.read = true;
                true
            }
            _ => false,
        }
    }

    /// Marks every unread incoming message from `correspondent` read and
    /// returns their ids, oldest first.
    pub fn mark_conversation_read(&mut self, correspondent: &Identity) -> Vec<MessageId> {
        let Some(list) = self.conversations.get_mut(correspondent) else {
            return Vec::new();
        };
        list.iter_mut()
            .filter(|m| !m.is_own() && !m.message.read)
            .map(|m| {
                m.message.read = true;
                m.message.id
            })
            .collect()
    }

    /// Applies a read receipt for one of this client's own messages.
    ///
    /// Returns `true` if the flag changed.
    pub fn apply_read_receipt(&mut self, id: &MessageId) -> bool {
        match self.find_mut(id) {
            Some(entry) if entry.is_own() && !entry.message.read => {
                entry.message.read = true;
                true
            }
            _ => false,
        }
    }

    /// Looks up a message by id.
    #[must_use]
    pub fn message(&self, id: &MessageId) -> Option<&LocalMessage> {
        self.conversations
            .values()
            .flat_map(|list| list.iter())
            .find(|m| &m.message.id == id)
    }

    /// Messages exchanged with `correspondent`, oldest first.
    #[must_use]
    pub fn conversation(&self, correspondent: &Identity) -> &[LocalMessage] {
        self.conversations
            .get(correspondent)
            .map_or(&[], Vec::as_slice)
    }

    /// One summary per correspondent, most recent conversation first.
    #[must_use]
    pub fn summaries(&self) -> Vec<ChatSummary> {
        let mut out: Vec<ChatSummary> = self
            .conversations
            .iter()
            .filter_map(|(who, list)| {
                let last = list.iter().max_by_key(|m| m.message.sent_at)?;
                Some(ChatSummary {
                    correspondent: who.clone(),
                    last_body: last.message.body.clone(),
                    last_at: last.message.sent_at,
                    unread: list
                        .iter()
                        .filter(|m| !m.is_own() && !m.message.read)
                        .count(),
                })
            })
            .collect();
        out.sort_by(|a, b| b.last_at.cmp(&a.last_at));
        out
    }

    /// Writes the store to `path` as JSON, replacing the file atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if serialization or any file operation fails.
    pub fn persist(&self, path: &Path) -> Result<(), StateError> {
        let snapshot = StoreSnapshot {
            identity: self.local.clone(),
            conversations: self.conversations.clone(),
        };
        let json = serde_json::to_vec_pretty(&snapshot)?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Loads a store for `local` from `path`; a missing file yields an
    /// empty store.
    ///
    /// Messages still `Pending` in the file can no longer be acknowledged
    /// and are loaded as `Failed`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the file cannot be read or parsed, or was
    /// written for a different identity.
    pub fn load(path: &Path, local: Identity) -> Result<Self, StateError> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new(local)),
            Err(e) => return Err(e.into()),
        };
        let mut snapshot: StoreSnapshot = serde_json::from_slice(&bytes)?;
        if snapshot.identity != local {
            return Err(StateError::IdentityMismatch {
                expected: local,
                found: snapshot.identity,
            });
        }
        for entry in snapshot.conversations.values_mut().flatten() {
            if entry.state == DeliveryState::Pending {
                entry.state = DeliveryState::Failed;
                entry.error = Some("interrupted before acknowledgment".to_string());
            }
        }
        Ok(Self {
            local,
            max_body_size: message::MAX_BODY_SIZE,
            conversations: snapshot.conversations,
        })
    }

    fn locate(&self, id: &MessageId) -> Option<(Identity, usize)> {
        self.conversations.iter().find_map(|(who, list)| {
            list.iter()
                .position(|m| &m.message.id == id)
                .map(|i| (who.clone(), i))
        })
    }

    fn find_mut(&mut self, id: &MessageId) -> Option<&mut LocalMessage> {
        self.conversations
            .values_mut()
            .flat_map(|list| list.iter_mut())
            .find(|m| &m.message.id == id)
    }
}

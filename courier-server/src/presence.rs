//! Presence registry: which identity currently holds which live connection.
//!
//! At most one connection is bound per identity. Every connection gets a
//! [`ConnectionId`] at upgrade time so that a late disconnect from a
//! superseded connection cannot remove its replacement's binding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use courier_proto::frame::ServerFrame;
use courier_proto::message::{Identity, Timestamp};
use parking_lot::RwLock;
use tokio::sync::mpsc;

/// Opaque, process-unique id for one real-time connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Outbound half of a live connection.
///
/// Frames pushed here are written to the socket, in order, by the
/// connection's writer task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<ServerFrame>,
}

impl ConnectionHandle {
    /// Wraps the sender half of a connection's outbound channel.
    #[must_use]
    pub const fn new(id: ConnectionId, tx: mpsc::UnboundedSender<ServerFrame>) -> Self {
        Self { id, tx }
    }

    /// Returns the connection id.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues a frame for the writer task.
    ///
    /// Returns `false` if the connection's writer has shut down.
    pub fn send(&self, frame: ServerFrame) -> bool {
        self.tx.send(frame).is_ok()
    }

    /// Returns `true` if the writer has shut down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug)]
struct PresenceEntry {
    connection: Option<ConnectionHandle>,
    last_seen: Timestamp,
}

/// Identity-to-connection map.
///
/// Lookups take a read lock and never wait on I/O.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    entries: RwLock<HashMap<Identity, PresenceEntry>>,
    next_id: AtomicU64,
}

impl PresenceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh connection id.
    pub fn allocate_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Binds `identity` to `handle`, replacing any existing binding.
    ///
    /// Returns the superseded handle, if there was one.
    pub fn bind(&self, identity: &Identity, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let mut entries = self.entries.write();
        let entry = entries.entry(identity.clone()).or_insert(PresenceEntry {
            connection: None,
            last_seen: Timestamp::now(),
        });
        entry.last_seen = Timestamp::now();
        entry.connection.replace(handle)
    }

    /// Removes the binding for `identity` only if it still points at `id`.
    ///
    /// Returns `true` if a binding was removed.
    pub fn unbind(&self, identity: &Identity, id: ConnectionId) -> bool {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(identity) else {
            return false;
        };
        if entry.connection.as_ref().is_some_and(|c| c.id == id) {
            entry.connection = None;
            entry.last_seen = Timestamp::now();
            true
        } else {
            false
        }
    }

    /// Returns the live connection for `identity`, if any.
    #[must_use]
    pub fn lookup(&self, identity: &Identity) -> Option<ConnectionHandle> {
        self.entries
            .read()
            .get(identity)
            .and_then(|e| e.connection.clone())
    }

    /// Returns `true` if `identity` currently has a bound connection.
    #[must_use]
    pub fn is_online(&self, identity: &Identity) -> bool {
        self.entries
            .read()
            .get(identity)
            .is_some_and(|e| e.connection.is_some())
    }

    /// Last connect or disconnect time observed by this process.
    #[must_use]
    pub fn last_seen(&self, identity: &Identity) -> Option<Timestamp> {
        self.entries.read().get(identity).map(|e| e.last_seen)
    }

    /// Number of identities with a live connection.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.entries
            .read()
            .values()
            .filter(|e| e.connection.is_some())
            .count()
    }
}

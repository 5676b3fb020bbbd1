//! Message router: the one place that decides between live delivery and the
//! pending queue.
//!
//! Both the WebSocket handler and the HTTP fallback call into [`Router`].
//! Every operation that reads presence and then touches a pending queue runs
//! under that identity's lock from [`IdentityLocks`], so a send can never
//! slip between a bind and its flush, and a message ends up either on a live
//! connection or in the queue, never both and never neither.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use courier_proto::frame::ServerFrame;
use courier_proto::message::{self, Identity, Message, MessageId, Timestamp, ValidationError};
use courier_proto::presence::UserStatus;

use crate::error::DeliveryError;
use crate::ledger::{DEFAULT_LEDGER_CAPACITY, MessageLedger, ReadOutcome};
use crate::locks::IdentityLocks;
use crate::presence::{ConnectionHandle, ConnectionId, PresenceRegistry};
use crate::rooms::{ConversationRooms, RoomKey};
use crate::store::PendingStore;

/// Tunables for a [`Router`].
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum message body size in bytes.
    pub max_body_size: usize,
    /// Whether sending to an identity with no record creates one.
    pub create_unknown_receivers: bool,
    /// Number of routed messages remembered for read receipts.
    pub ledger_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_body_size: message::MAX_BODY_SIZE,
            create_unknown_receivers: true,
            ledger_capacity: DEFAULT_LEDGER_CAPACITY,
        }
    }
}

/// Which path a routed message took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the receiver's live connection.
    Live,
    /// Appended to the receiver's pending queue.
    Queued,
}

/// A message accepted by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routed {
    /// The message with its canonical id and timestamp.
    pub message: Message,
    /// Which path it took.
    pub delivery: Delivery,
}

/// Result of binding a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectReport {
    /// Number of queued messages pushed to the new connection.
    pub flushed: usize,
    /// Cursor the client must confirm before the batch is cleared.
    pub through: u64,
    /// Whether an earlier connection was superseded.
    pub superseded: bool,
}

/// What happened to a read report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptOutcome {
    /// The sender was online and has been notified.
    Notified,
    /// The sender was offline; the receipt was dropped.
    SenderOffline,
    /// The message was already read.
    AlreadyRead,
    /// The reader is not the message's receiver, or the message is unknown.
    Ignored,
}

/// Issues strictly increasing wall-clock timestamps.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicU64,
}

impl MonotonicClock {
    /// Returns `max(now, previous + 1)`.
    pub fn next(&self) -> Timestamp {
        let now = Timestamp::now().as_millis();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, candidate, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Timestamp::from_millis(candidate),
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Presence-aware message router.
pub struct Router {
    presence: PresenceRegistry,
    store: Arc<dyn PendingStore>,
    locks: IdentityLocks,
    ledger: MessageLedger,
    rooms: ConversationRooms,
    clock: MonotonicClock,
    config: RouterConfig,
}

impl Router {
    /// Creates a router over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn PendingStore>, config: RouterConfig) -> Self {
        Self {
            presence: PresenceRegistry::new(),
            store,
            locks: IdentityLocks::new(),
            ledger: MessageLedger::new(config.ledger_capacity),
            rooms: ConversationRooms::new(),
            clock: MonotonicClock::default(),
            config,
        }
    }

    /// The presence registry.
    #[must_use]
    pub const fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    /// The pending store.
    #[must_use]
    pub fn store(&self) -> &dyn PendingStore {
        self.store.as_ref()
    }

    /// Routes one message from `sender` to `receiver`.
    ///
    /// `on_accept` runs after the routing decision and before the sender's
    /// echo is dispatched, so an acknowledgment queued on the sender's
    /// connection always precedes the echo.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Validation`] for a blank receiver or body or
    /// an unknown receiver when implicit creation is disabled, and
    /// [`DeliveryError::Persistence`] if the pending queue cannot be written.
    pub async fn route<F>(
        &self,
        sender: &Identity,
        receiver: Identity,
        body: String,
        on_accept: F,
    ) -> Result<Routed, DeliveryError>
    where
        F: FnOnce(&Result<Routed, DeliveryError>),
    {
        let receiver = Identity::new(receiver.as_str().trim());
        let result = self.decide(sender, receiver, body).await;
        on_accept(&result);

        if let Ok(routed) = &result
            && routed.delivery == Delivery::Live
            && &routed.message.receiver != sender
            && let Some(own) = self.presence.lookup(sender)
        {
            own.send(ServerFrame::NewMessage(routed.message.clone()));
        }
        result
    }

    async fn decide(
        &self,
        sender: &Identity,
        receiver: Identity,
        body: String,
    ) -> Result<Routed, DeliveryError> {
        message::validate_send(&receiver, &body, self.config.max_body_size)?;

        let _guard = self.locks.lock(&receiver).await;

        if self.config.create_unknown_receivers {
            if self.store.ensure_identity(&receiver)? {
                tracing::debug!(receiver = %receiver, "created record for new receiver");
            }
        } else if !self.store.identity_exists(&receiver)? {
            return Err(ValidationError::UnknownReceiver(receiver).into());
        }

        let message = Message {
            id: MessageId::new(),
            sender: sender.clone(),
            receiver,
            body,
            sent_at: self.clock.next(),
            read: false,
        };

        if let Some(conn) = self.presence.lookup(&message.receiver) {
            if conn.send(ServerFrame::NewMessage(message.clone())) {
                self.ledger.record(&message);
                tracing::debug!(
                    sender = %message.sender,
                    receiver = %message.receiver,
                    id = %message.id,
                    "delivered live"
                );
                return Ok(Routed {
                    message,
                    delivery: Delivery::Live,
                });
            }
            tracing::warn!(
                receiver = %message.receiver,
                conn = %conn.id(),
                "live dispatch failed, unbinding and queuing"
            );
            self.release(&message.receiver, conn.id());
        }

        let seq = self.store.append(&message)?;
        self.ledger.record(&message);
        tracing::info!(
            sender = %message.sender,
            receiver = %message.receiver,
            id = %message.id,
            seq,
            "receiver offline, message queued"
        );
        Ok(Routed {
            message,
            delivery: Delivery::Queued,
        })
    }

    /// Binds a freshly authenticated connection and pushes its pending queue.
    ///
    /// The queue is not cleared here; the client confirms the batch with
    /// [`Router::confirm_flush`].
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Persistence`] if the identity record or its
    /// queue cannot be read. The binding is kept even then.
    pub async fn connect(
        &self,
        identity: &Identity,
        handle: ConnectionHandle,
    ) -> Result<ConnectReport, DeliveryError> {
        let _guard = self.locks.lock(identity).await;

        let superseded = self.presence.bind(identity, handle.clone());
        if let Some(old) = &superseded {
            tracing::info!(identity = %identity, old = %old.id(), new = %handle.id(), "connection superseded");
        }
        if let Err(e) = self.store.record_last_seen(identity, Timestamp::now()) {
            tracing::warn!(identity = %identity, error = %e, "failed to record last seen");
        }

        let batch = self.store.snapshot(identity)?;
        let flushed = batch.messages.len();
        if !batch.is_empty() {
            for message in &batch.messages {
                self.ledger.record(message);
            }
            handle.send(ServerFrame::UnreadMessages {
                through: batch.through,
                messages: batch.messages,
            });
            tracing::info!(identity = %identity, count = flushed, through = batch.through, "flushed pending queue");
        }

        Ok(ConnectReport {
            flushed,
            through: batch.through,
            superseded: superseded.is_some(),
        })
    }

    /// Clears the flushed batch after the client confirmed it.
    ///
    /// Messages queued after the snapshot survive.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Persistence`] if the clear fails.
    pub async fn confirm_flush(&self, identity: &Identity, through: u64) -> Result<usize, DeliveryError> {
        let _guard = self.locks.lock(identity).await;
        let removed = self.store.clear_through(identity, through)?;
        tracing::debug!(identity = %identity, through, removed, "pending batch cleared");
        Ok(removed)
    }

    /// Unbinds `conn` if it is still the identity's current connection.
    ///
    /// Returns `false` for a stale disconnect.
    pub async fn disconnect(&self, identity: &Identity, conn: ConnectionId) -> bool {
        let _guard = self.locks.lock(identity).await;
        self.release(identity, conn)
    }

    fn release(&self, identity: &Identity, conn: ConnectionId) -> bool {
        if !self.presence.unbind(identity, conn) {
            tracing::debug!(identity = %identity, conn = %conn, "ignoring stale disconnect");
            return false;
        }
        if let Err(e) = self.store.record_last_seen(identity, Timestamp::now()) {
            tracing::warn!(identity = %identity, error = %e, "failed to record last seen");
        }
        let left = self.rooms.leave_all(identity);
        tracing::info!(identity = %identity, conn = %conn, rooms = left, "connection unbound");
        true
    }

    /// Applies a read report from `reader` and notifies the sender if online.
    pub fn mark_read(&self, reader: &Identity, id: MessageId) -> ReceiptOutcome {
        match self.ledger.mark_read(&id, reader) {
            ReadOutcome::Marked { sender } => {
                let notified = self
                    .presence
                    .lookup(&sender)
                    .is_some_and(|conn| conn.send(ServerFrame::MessageRead { message_id: id }));
                if notified {
                    tracing::debug!(id = %id, sender = %sender, "read receipt pushed");
                    ReceiptOutcome::Notified
                } else {
                    tracing::debug!(id = %id, sender = %sender, "sender offline, read receipt dropped");
                    ReceiptOutcome::SenderOffline
                }
            }
            ReadOutcome::AlreadyRead => ReceiptOutcome::AlreadyRead,
            ReadOutcome::NotReceiver => {
                tracing::warn!(id = %id, reader = %reader, "mark-read from non-receiver ignored");
                ReceiptOutcome::Ignored
            }
            ReadOutcome::Unknown => {
                tracing::debug!(id = %id, reader = %reader, "mark-read for unknown message");
                ReceiptOutcome::Ignored
            }
        }
    }

    /// Returns and clears the caller's whole pending queue.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Persistence`] if the drain fails.
    pub async fn fetch_unread(&self, identity: &Identity) -> Result<Vec<Message>, DeliveryError> {
        let _guard = self.locks.lock(identity).await;
        let messages = self.store.drain(identity)?;
        for message in &messages {
            self.ledger.record(message);
        }
        tracing::info!(identity = %identity, count = messages.len(), "pending queue drained");
        Ok(messages)
    }

    /// Reachability of `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Persistence`] if the stored last-seen time
    /// cannot be read.
    pub fn status(&self, identity: &Identity) -> Result<UserStatus, DeliveryError> {
        let online = self.presence.is_online(identity);
        let last_seen = match self.presence.last_seen(identity) {
            Some(ts) => Some(ts),
            None => self.store.last_seen(identity)?,
        };
        Ok(UserStatus { online, last_seen })
    }

    /// Records that `member` opened the conversation with `other`.
    pub fn join_chat(&self, member: &Identity, other: &Identity) -> RoomKey {
        let key = self.rooms.join(member, other);
        tracing::debug!(member = %member, room = %key, "joined chat");
        key
    }

    /// Conversation rooms.
    #[must_use]
    pub const fn rooms(&self) -> &ConversationRooms {
        &self.rooms
    }
}

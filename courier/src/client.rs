//! High-level chat client.
//!
//! [`ChatClient`] owns the [`ClientStore`] and drives it from two sides:
//! caller actions (send, open a chat, mark read) and server pushes handled
//! by a background dispatcher. Sends use the real-time connection with a
//! bounded acknowledgment wait when it is open, and the HTTP fallback
//! otherwise.
//!
//! ```text
//! caller ── send ──► ClientStore (Pending) ──► RealtimeConnection ──► server
//!                                   ▲                                  │
//!                       dispatcher ─┴──── ServerFrame channel ◄────────┘
//!                            │
//!                            └──► ClientEvent channel ──► caller
//! ```

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use courier_proto::frame::{AckPayload, ClientFrame, ServerFrame};
use courier_proto::message::{Identity, MAX_BODY_SIZE, Message, MessageId};
use courier_proto::presence::UserStatus;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::ack::{AckOutcome, AckTicket, AckTracker, DEFAULT_ACK_TIMEOUT};
use crate::connection::RealtimeConnection;
use crate::error::{ClientError, TransportError};
use crate::fallback::HttpFallback;
use crate::state::{ChatSummary, ClientStore, DeliveryState, Ingested, LocalMessage, Transition};

/// Settings needed to run a [`ChatClient`].
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Base HTTP URL of the server (e.g. `http://127.0.0.1:8000`).
    pub server_url: String,
    /// Bearer credential.
    pub token: String,
    /// Identity the credential belongs to.
    pub identity: Identity,
    /// Acknowledgment window for real-time sends.
    pub ack_timeout: Duration,
    /// Timeout for connecting and for fallback requests.
    pub connect_timeout: Duration,
    /// Capacity of the frame and event channels.
    pub channel_capacity: usize,
    /// Mark incoming messages read as soon as they are processed.
    pub auto_mark_read: bool,
    /// Largest body accepted by [`ChatClient::send`].
    pub max_body_size: usize,
}

impl ClientSettings {
    /// Settings with default timeouts for the given server and credential.
    pub fn new(server_url: impl Into<String>, token: impl Into<String>, identity: impl Into<Identity>) -> Self {
        Self {
            server_url: server_url.into(),
            token: token.into(),
            identity: identity.into(),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            connect_timeout: Duration::from_secs(10),
            channel_capacity: 256,
            auto_mark_read: true,
            max_body_size: MAX_BODY_SIZE,
        }
    }
}

/// Notifications emitted to the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The real-time connection is up.
    Connected {
        /// Identity the server authenticated.
        identity: Identity,
    },
    /// The real-time connection went down.
    Disconnected,
    /// A message from someone else arrived.
    MessageReceived(Message),
    /// A batch of queued messages was delivered on connect.
    UnreadFlushed {
        /// Number of messages not seen before.
        count: usize,
    },
    /// One of our messages changed delivery state.
    DeliveryChanged {
        /// Current id (canonical once sent).
        id: MessageId,
        /// New state.
        state: DeliveryState,
    },
    /// One of our messages was read by its receiver.
    MessageRead {
        /// The message that was read.
        id: MessageId,
    },
    /// The server reported an error.
    ServerError(String),
}

/// The open real-time connection and its serial.
#[derive(Clone)]
struct Live {
    serial: u64,
    conn: Arc<RealtimeConnection>,
}

struct Inner {
    settings: ClientSettings,
    store: Mutex<ClientStore>,
    acks: AckTracker,
    fallback: HttpFallback,
    connection: Mutex<Option<Live>>,
    next_serial: AtomicU64,
    events: mpsc::Sender<ClientEvent>,
}

/// Client for one identity. Cheap to clone.
#[derive(Clone)]
pub struct ChatClient {
    inner: Arc<Inner>,
}

impl ChatClient {
    /// Creates a client with an empty store.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Transport`] if the server URL is invalid.
    pub fn new(settings: ClientSettings) -> Result<(Self, mpsc::Receiver<ClientEvent>), ClientError> {
        let store = ClientStore::new(settings.identity.clone()).with_max_body_size(settings.max_body_size);
        Self::with_store(settings, store)
    }

    /// Creates a client over an existing (for example, loaded) store.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Transport`] if the server URL is invalid.
    pub fn with_store(
        settings: ClientSettings,
        store: ClientStore,
    ) -> Result<(Self, mpsc::Receiver<ClientEvent>), ClientError> {
        let fallback = HttpFallback::new(&settings.server_url, settings.token.clone(), settings.connect_timeout)?;
        let (events, events_rx) = mpsc::channel(settings.channel_capacity.max(1));
        let inner = Inner {
            acks: AckTracker::new(settings.ack_timeout),
            store: Mutex::new(store),
            fallback,
            connection: Mutex::new(None),
            next_serial: AtomicU64::new(1),
            events,
            settings,
        };
        Ok((
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        ))
    }

    /// Our identity.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.inner.settings.identity
    }

    /// Opens the real-time connection and starts the dispatcher.
    ///
    /// Any messages queued while we were offline arrive right after.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Transport`] if the connection cannot be
    /// established, or [`ClientError::IdentityMismatch`] if the server
    /// authenticated a different identity.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let url = self.inner.fallback.realtime_url()?;
        let (frames_tx, frames_rx) = mpsc::channel(self.inner.settings.channel_capacity.max(1));
        let conn = RealtimeConnection::connect(
            url.as_str(),
            &self.inner.settings.token,
            self.inner.settings.connect_timeout,
            frames_tx,
        )
        .await?;

        if conn.identity() != self.identity() {
            conn.close().await;
            return Err(ClientError::IdentityMismatch {
                expected: self.identity().clone(),
                actual: conn.identity().clone(),
            });
        }

        let live = Live {
            serial: self.inner.next_serial.fetch_add(1, Ordering::Relaxed),
            conn: Arc::new(conn),
        };
        let previous = self.inner.connection.lock().replace(live.clone());
        if let Some(old) = previous {
            old.conn.close().await;
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(dispatch_loop(inner, live, frames_rx));

        self.emit(ClientEvent::Connected {
            identity: self.identity().clone(),
        });
        Ok(())
    }

    /// Closes the real-time connection, if open.
    pub async fn disconnect(&self) {
        let live = self.inner.connection.lock().take();
        if let Some(live) = live {
            live.conn.close().await;
        }
    }

    /// Returns `true` while the real-time connection is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.live().is_some()
    }

    /// Sends a message and waits for its acknowledgment.
    ///
    /// The message is visible as `Pending` in the store immediately. On
    /// success it becomes `Sent` under the returned canonical id; on failure
    /// it becomes `Failed` and the error carries the provisional id.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Validation`] if the receiver or body is blank
    ///   (nothing is stored).
    /// - [`ClientError::AckTimeout`] if no acknowledgment arrived in time.
    /// - [`ClientError::Rejected`] if the server refused the message.
    /// - [`ClientError::ConnectionLost`] if the connection dropped first.
    pub async fn send(&self, receiver: &Identity, body: &str) -> Result<MessageId, ClientError> {
        let provisional = self.inner.store.lock().begin_send(receiver, body)?;
        let receiver = Identity::new(receiver.as_str().trim());
        self.emit(ClientEvent::DeliveryChanged {
            id: provisional,
            state: DeliveryState::Pending,
        });

        if let Some(live) = self.live() {
            let ticket = self.inner.acks.register(provisional, live.serial);
            let frame = ClientFrame::SendMessage {
                request_id: ticket.request_id(),
                receiver: receiver.clone(),
                body: body.to_string(),
            };
            match live.conn.send(&frame).await {
                Ok(()) => return self.await_ack(provisional, ticket).await,
                Err(e) => {
                    tracing::warn!(error = %e, "real-time send failed, using fallback");
                    self.inner.acks.cancel(ticket);
                }
            }
        }

        self.send_via_fallback(provisional, &receiver, body).await
    }

    async fn await_ack(&self, provisional: MessageId, ticket: AckTicket) -> Result<MessageId, ClientError> {
        match self.inner.acks.wait(ticket).await {
            AckOutcome::Answered(Ok((canonical, _))) => Ok(canonical),
            AckOutcome::Answered(Err(reason)) => Err(ClientError::Rejected {
                id: provisional,
                reason,
            }),
            AckOutcome::TimedOut => {
                tracing::warn!(id = %provisional, "no acknowledgment within window");
                self.fail(provisional, "acknowledgment timed out");
                Err(ClientError::AckTimeout { id: provisional })
            }
            AckOutcome::Abandoned => {
                self.fail(provisional, "connection lost");
                Err(ClientError::ConnectionLost { id: provisional })
            }
        }
    }

    async fn send_via_fallback(
        &self,
        provisional: MessageId,
        receiver: &Identity,
        body: &str,
    ) -> Result<MessageId, ClientError> {
        match self.inner.fallback.send(receiver, body).await {
            Ok((canonical, time)) => {
                let transition = self.inner.store.lock().confirm(provisional, canonical, time);
                if transition == Transition::Applied {
                    self.emit(ClientEvent::DeliveryChanged {
                        id: canonical,
                        state: DeliveryState::Sent,
                    });
                }
                Ok(canonical)
            }
            Err(TransportError::Rejected { error, .. }) => {
                self.fail(provisional, error.clone());
                Err(ClientError::Rejected {
                    id: provisional,
                    reason: error,
                })
            }
            Err(e) => {
                self.fail(provisional, e.to_string());
                Err(e.into())
            }
        }
    }

    fn fail(&self, provisional: MessageId, reason: impl Into<String>) {
        let transition = self.inner.store.lock().fail(provisional, reason);
        if transition == Transition::Applied {
            self.emit(ClientEvent::DeliveryChanged {
                id: provisional,
                state: DeliveryState::Failed,
            });
        }
    }

    /// Opens the conversation with `correspondent` and marks it read.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Transport`] if the join frame cannot be sent.
    pub async fn join_chat(&self, correspondent: &Identity) -> Result<usize, ClientError> {
        if let Some(live) = self.live() {
            live.conn.send(&ClientFrame::JoinChat {
                receiver: correspondent.clone(),
            })
            .await?;
        }
        self.mark_chat_read(correspondent).await
    }

    /// Marks every unread incoming message from `correspondent` read and
    /// reports each one to the server. Returns how many were marked.
    ///
    /// Without a live connection nothing is marked and this returns `0`, so
    /// the messages stay unread until they can be reported.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Transport`] if a report cannot be sent.
    pub async fn mark_chat_read(&self, correspondent: &Identity) -> Result<usize, ClientError> {
        let Some(live) = self.live() else {
            return Ok(0);
        };
        let ids = self.inner.store.lock().mark_conversation_read(correspondent);
        for id in &ids {
            live.conn.send(&ClientFrame::MarkRead { message_id: *id }).await?;
        }
        Ok(ids.len())
    }

    /// Pulls and clears the server-side pending queue over HTTP.
    ///
    /// Returns the number of messages not already known.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Transport`] if the request fails.
    pub async fn fetch_unread(&self) -> Result<usize, ClientError> {
        let messages = self.inner.fallback.fetch_unread().await?;
        let live = self.live();
        let fresh = ingest_batch(&self.inner, live.as_ref().map(|l| &*l.conn), messages).await;
        Ok(fresh)
    }

    /// Asks the server whether `identity` is online.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Transport`] if the request fails.
    pub async fn check_status(&self, identity: &Identity) -> Result<UserStatus, ClientError> {
        Ok(self.inner.fallback.status(identity).await?)
    }

    /// Messages exchanged with `correspondent`, oldest first.
    #[must_use]
    pub fn conversation(&self, correspondent: &Identity) -> Vec<LocalMessage> {
        self.inner.store.lock().conversation(correspondent).to_vec()
    }

    /// Looks up one message by id.
    #[must_use]
    pub fn message(&self, id: &MessageId) -> Option<LocalMessage> {
        self.inner.store.lock().message(id).cloned()
    }

    /// One summary per correspondent, most recent first.
    #[must_use]
    pub fn summaries(&self) -> Vec<ChatSummary> {
        self.inner.store.lock().summaries()
    }

    /// Saves the store to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::State`] if the file cannot be written.
    pub fn persist(&self, path: &Path) -> Result<(), ClientError> {
        let store = self.inner.store.lock().clone();
        store.persist(path)?;
        Ok(())
    }

    fn live(&self) -> Option<Live> {
        self.inner
            .connection
            .lock()
            .as_ref()
            .filter(|l| l.conn.is_connected())
            .cloned()
    }

    fn emit(&self, event: ClientEvent) {
        emit(&self.inner, event);
    }
}

fn emit(inner: &Inner, event: ClientEvent) {
    if let Err(e) = inner.events.try_send(event) {
        tracing::warn!(error = %e, "event channel full or closed, dropping event");
    }
}

/// Applies server frames to the store in arrival order.
async fn dispatch_loop(inner: Arc<Inner>, live: Live, mut frames: mpsc::Receiver<ServerFrame>) {
    let conn: &RealtimeConnection = &live.conn;
    while let Some(frame) = frames.recv().await {
        match frame {
            ServerFrame::Ack { request_id, result } => apply_ack(&inner, request_id, result),
            ServerFrame::NewMessage(message) => {
                ingest_batch(&inner, Some(conn), vec![message]).await;
            }
            ServerFrame::UnreadMessages { through, messages } => {
                let fresh = ingest_batch(&inner, Some(conn), messages).await;
                tracing::info!(count = fresh, through, "received pending messages");
                if let Err(e) = conn.send(&ClientFrame::UnreadReceived { through }).await {
                    tracing::warn!(error = %e, through, "failed to confirm pending batch");
                }
                emit(&inner, ClientEvent::UnreadFlushed { count: fresh });
            }
            ServerFrame::MessageRead { message_id } => {
                if inner.store.lock().apply_read_receipt(&message_id) {
                    emit(&inner, ClientEvent::MessageRead { id: message_id });
                }
            }
            ServerFrame::Error { reason } => {
                tracing::warn!(reason = %reason, "server error");
                emit(&inner, ClientEvent::ServerError(reason));
            }
            ServerFrame::Ready { identity } => {
                tracing::debug!(identity = %identity, "duplicate ready frame ignored");
            }
        }
    }

    let abandoned = inner.acks.abandon_connection(live.serial);
    let was_current = {
        let mut current = inner.connection.lock();
        if current.as_ref().is_some_and(|c| c.serial == live.serial) {
            *current = None;
            true
        } else {
            false
        }
    };
    tracing::info!(serial = live.serial, abandoned, "real-time connection ended");
    if was_current {
        emit(&inner, ClientEvent::Disconnected);
    }
}

/// Resolves an ack against its pending send, unless the window already
/// closed. A late success only links the failed entry to its server id.
fn apply_ack(inner: &Inner, request_id: u64, payload: AckPayload) {
    let Some(pending) = inner.acks.claim(request_id) else {
        match (inner.acks.claim_expired(request_id), payload.into_result()) {
            (Some(provisional), Ok((canonical, _))) => {
                inner.store.lock().record_late_delivery(provisional, canonical);
                tracing::debug!(request_id, id = %provisional, server_id = %canonical, "late ack, message stays failed");
            }
            _ => tracing::debug!(request_id, "late or unknown ack ignored"),
        }
        return;
    };
    let provisional = pending.message();
    let result = payload.into_result();
    let (transition, event) = {
        let mut store = inner.store.lock();
        match &result {
            Ok((canonical, time)) => (
                store.confirm(provisional, *canonical, *time),
                ClientEvent::DeliveryChanged {
                    id: *canonical,
                    state: DeliveryState::Sent,
                },
            ),
            Err(reason) => (
                store.fail(provisional, reason.clone()),
                ClientEvent::DeliveryChanged {
                    id: provisional,
                    state: DeliveryState::Failed,
                },
            ),
        }
    };
    if transition == Transition::Applied {
        emit(inner, event);
    }
    pending.complete(result);
}

/// Stores pushed messages, emits events for new incoming ones, and marks
/// them read when configured to. Returns the number of new messages.
async fn ingest_batch(inner: &Inner, conn: Option<&RealtimeConnection>, messages: Vec<Message>) -> usize {
    let local = inner.settings.identity.clone();
    let mut fresh = Vec::new();
    {
        let mut store = inner.store.lock();
        for message in messages {
            if store.ingest(message.clone()) == Ingested::Inserted {
                fresh.push(message);
            }
        }
    }

    let mut to_mark = Vec::new();
    for message in &fresh {
        if message.sender != local {
            if inner.settings.auto_mark_read && conn.is_some() && inner.store.lock().mark_message_read(&message.id) {
                to_mark.push(message.id);
            }
            emit(inner, ClientEvent::MessageReceived(message.clone()));
        }
    }

    if let Some(conn) = conn {
        for id in to_mark {
            if let Err(e) = conn.send(&ClientFrame::MarkRead { message_id: id }).await {
                tracing::warn!(id = %id, error = %e, "failed to report read message");
            }
        }
    }
    fresh.len()
}

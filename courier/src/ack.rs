//! Acknowledgment correlation with a bounded wait.
//!
//! Every real-time send registers a [`AckTicket`] keyed by a per-client
//! request id. Whoever removes the entry from the tracker first wins: the
//! connection's dispatcher when the ack arrives ([`AckTracker::claim`]), or
//! the waiting sender when the window expires. The loser finds nothing to
//! remove, so a late ack is never applied and a timeout never overrides an
//! ack. Expired requests are remembered until their connection ends so a
//! late ack can still be recognized ([`AckTracker::claim_expired`]).
//!
//! Each request records the serial of the connection that carried it. When
//! that connection ends only its own requests are abandoned.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use courier_proto::message::{MessageId, Timestamp};
use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Default acknowledgment window.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Final answer delivered to a waiting sender.
pub type AckResult = Result<(MessageId, Timestamp), String>;

/// How a wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// The server answered; the dispatcher has already applied the result.
    Answered(AckResult),
    /// The window expired first.
    TimedOut,
    /// The connection went away before an answer.
    Abandoned,
}

/// An in-flight request as seen by the dispatcher.
#[derive(Debug)]
pub struct PendingAck {
    message: MessageId,
    connection: u64,
    tx: oneshot::Sender<AckResult>,
}

impl PendingAck {
    /// Provisional id of the message this request carries.
    #[must_use]
    pub const fn message(&self) -> MessageId {
        self.message
    }

    /// Hands the applied result to the waiting sender.
    pub fn complete(self, result: AckResult) {
        let _ = self.tx.send(result);
    }
}

/// Held by the sender while it waits.
#[derive(Debug)]
pub struct AckTicket {
    request_id: u64,
    rx: oneshot::Receiver<AckResult>,
}

impl AckTicket {
    /// The correlation id to put on the wire.
    #[must_use]
    pub const fn request_id(&self) -> u64 {
        self.request_id
    }
}

#[derive(Debug, Clone, Copy)]
struct Expired {
    message: MessageId,
    connection: u64,
}

/// Tracks outstanding acknowledgments.
#[derive(Debug)]
pub struct AckTracker {
    next_id: AtomicU64,
    waiting: Mutex<HashMap<u64, PendingAck>>,
    expired: Mutex<HashMap<u64, Expired>>,
    timeout: Duration,
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new(DEFAULT_ACK_TIMEOUT)
    }
}

impl AckTracker {
    /// Creates a tracker with the given window.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            waiting: Mutex::new(HashMap::new()),
            expired: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// The acknowledgment window.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Registers a request for the message with provisional id `message`,
    /// carried by the connection with serial `connection`.
    pub fn register(&self, message: MessageId, connection: u64) -> AckTicket {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().insert(
            request_id,
            PendingAck {
                message,
                connection,
                tx,
            },
        );
        AckTicket { request_id, rx }
    }

    /// Removes the entry for `request_id` so the caller can apply an ack.
    ///
    /// Returns `None` if the request already timed out or was abandoned.
    pub fn claim(&self, request_id: u64) -> Option<PendingAck> {
        self.waiting.lock().remove(&request_id)
    }

    /// Removes the record of a request whose window already closed and
    /// returns the provisional id it carried.
    pub fn claim_expired(&self, request_id: u64) -> Option<MessageId> {
        self.expired.lock().remove(&request_id).map(|e| e.message)
    }

    /// Drops a request that was never put on the wire.
    pub fn cancel(&self, ticket: AckTicket) {
        self.waiting.lock().remove(&ticket.request_id);
    }

    /// Drops the requests carried by connection `connection`; their waiters
    /// see [`AckOutcome::Abandoned`]. Requests on other connections are
    /// untouched. Returns how many waiters were abandoned.
    pub fn abandon_connection(&self, connection: u64) -> usize {
        self.expired.lock().retain(|_, e| e.connection != connection);
        let mut waiting = self.waiting.lock();
        let before = waiting.len();
        waiting.retain(|_, p| p.connection != connection);
        before - waiting.len()
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.waiting.lock().len()
    }

    /// Waits for the ack of `ticket` for at most the configured window.
    pub async fn wait(&self, ticket: AckTicket) -> AckOutcome {
        let AckTicket { request_id, mut rx } = ticket;
        match tokio::time::timeout(self.timeout, &mut rx).await {
            Ok(Ok(result)) => AckOutcome::Answered(result),
            Ok(Err(_)) => AckOutcome::Abandoned,
            Err(_) => {
                let removed = self.waiting.lock().remove(&request_id);
                if let Some(pending) = removed {
                    tracing::debug!(request_id, "ack window expired");
                    self.expired.lock().insert(
                        request_id,
                        Expired {
                            message: pending.message,
                            connection: pending.connection,
                        },
                    );
                    AckOutcome::TimedOut
                } else {
                    // Claimed by the dispatcher just as the window closed.
                    match rx.await {
                        Ok(result) => AckOutcome::Answered(result),
                        Err(_) => AckOutcome::Abandoned,
                    }
                }
            }
        }
    }
}

//! Bounded record of recently routed messages, used to resolve read receipts.
//!
//! A `mark-read` only carries a message id; the ledger maps it back to the
//! sender (who gets notified) and the receiver (the only identity allowed to
//! mark it). Entries are evicted least-recently-used once the capacity is hit;
//! receipts for evicted messages are dropped.

use std::num::NonZeroUsize;

use courier_proto::message::{Identity, Message, MessageId};
use lru::LruCache;
use parking_lot::Mutex;

/// Default number of messages remembered for read receipts.
pub const DEFAULT_LEDGER_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
struct LedgerEntry {
    sender: Identity,
    receiver: Identity,
    read: bool,
}

/// Result of applying a read report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The message went from unread to read; `sender` should be told.
    Marked {
        /// Author of the message.
        sender: Identity,
    },
    /// The message was already read.
    AlreadyRead,
    /// The reporter is not the message's receiver.
    NotReceiver,
    /// No record of the message (never routed here, or evicted).
    Unknown,
}

/// LRU map from message id to its parties and read flag.
pub struct MessageLedger {
    entries: Mutex<LruCache<MessageId, LedgerEntry>>,
}

impl MessageLedger {
    /// Creates a ledger holding at most `capacity` messages.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Remembers a routed message. Re-recording keeps an existing read flag.
    pub fn record(&self, message: &Message) {
        let mut entries = self.entries.lock();
        if entries.get(&message.id).is_some() {
            return;
        }
        entries.put(
            message.id,
            LedgerEntry {
                sender: message.sender.clone(),
                receiver: message.receiver.clone(),
                read: message.read,
            },
        );
    }

    /// Applies a read report from `reader`.
    pub fn mark_read(&self, id: &MessageId, reader: &Identity) -> ReadOutcome {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(id) else {
            return ReadOutcome::Unknown;
        };
        if &entry.receiver != reader {
            return ReadOutcome::NotReceiver;
        }
        if entry.read {
            return ReadOutcome::AlreadyRead;
        }
        entry.read = true;
        ReadOutcome::Marked {
            sender: entry.sender.clone(),
        }
    }

    /// Number of remembered messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if nothing is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

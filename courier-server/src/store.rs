//! Durable per-identity pending queues.
//!
//! The [`PendingStore`] holds, for every receiver, a FIFO queue of messages
//! that could not be delivered live, plus the identity record's last-seen
//! timestamp. Each queued message gets a store-wide increasing sequence
//! number; a flush hands out a snapshot bounded by its highest sequence so
//! that clearing only removes what the client actually received.
//!
//! [`SqliteStore`] is the durable implementation. [`MemoryStore`] keeps the
//! same semantics without surviving a restart.

use std::collections::{HashMap, VecDeque};
use std::path::Path;

use courier_proto::message::{Identity, Message, MessageId, Timestamp};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

/// Default maximum number of queued messages per receiver.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;

/// Errors raised by pending-queue storage.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The database rejected an operation.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The database file or its directory could not be created.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The receiver's queue is at capacity.
    #[error("pending queue for {receiver} is full (max {max} messages)")]
    QueueFull {
        /// Whose queue is full.
        receiver: Identity,
        /// Configured capacity.
        max: usize,
    },

    /// A stored row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// A flushed view of one receiver's queue.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PendingBatch {
    /// Highest sequence number included (0 when empty).
    pub through: u64,
    /// Messages in FIFO order.
    pub messages: Vec<Message>,
}

impl PendingBatch {
    /// Returns `true` if nothing was queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Identity-keyed durable record of pending messages and last-seen time.
///
/// Every method is atomic with respect to the receiver it touches. Callers
/// that need a multi-step sequence (presence check then append) serialize
/// it themselves through [`crate::locks::IdentityLocks`].
pub trait PendingStore: Send + Sync {
    /// Creates an empty record for `identity` if none exists.
    ///
    /// Returns `true` if a record was created.
    fn ensure_identity(&self, identity: &Identity) -> Result<bool, StoreError>;

    /// Returns `true` if a record exists for `identity`.
    fn identity_exists(&self, identity: &Identity) -> Result<bool, StoreError>;

    /// Appends a message to its receiver's queue, returning the assigned
    /// sequence number. The append is durable when this returns.
    fn append(&self, message: &Message) -> Result<u64, StoreError>;

    /// Returns the receiver's whole queue without removing it.
    fn snapshot(&self, receiver: &Identity) -> Result<PendingBatch, StoreError>;

    /// Removes every queued message for `receiver` with sequence `<= through`.
    ///
    /// Returns the number of messages removed.
    fn clear_through(&self, receiver: &Identity, through: u64) -> Result<usize, StoreError>;

    /// Removes and returns the receiver's whole queue in one step.
    fn drain(&self, receiver: &Identity) -> Result<Vec<Message>, StoreError>;

    /// Number of messages currently queued for `receiver`.
    fn queue_len(&self, receiver: &Identity) -> Result<usize, StoreError>;

    /// Records a connect or disconnect time for `identity`.
    fn record_last_seen(&self, identity: &Identity, at: Timestamp) -> Result<(), StoreError>;

    /// Returns the stored last-seen time for `identity`.
    fn last_seen(&self, identity: &Identity) -> Result<Option<Timestamp>, StoreError>;
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

/// SQLite-backed [`PendingStore`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
    max_queue_size: usize,
}

impl SqliteStore {
    /// Opens or creates a database at `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the directory or database cannot be created
    /// or the schema cannot be applied.
    pub fn open(path: &Path, max_queue_size: usize) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;
        Self::with_connection(conn, max_queue_size)
    }

    /// Creates a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the schema cannot be applied.
    pub fn open_in_memory(max_queue_size: usize) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, max_queue_size)
    }

    fn with_connection(conn: Connection, max_queue_size: usize) -> Result<Self, StoreError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS identities (
                identity    TEXT PRIMARY KEY,
                last_seen   INTEGER,
                created_at  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS pending_messages (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                receiver    TEXT NOT NULL,
                message_id  TEXT NOT NULL UNIQUE,
                sender      TEXT NOT NULL,
                body        TEXT NOT NULL,
                sent_at     INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_pending_receiver
                ON pending_messages(receiver, seq);
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_queue_size,
        })
    }
}

fn to_sql_millis(ts: Timestamp) -> i64 {
    i64::try_from(ts.as_millis()).unwrap_or(i64::MAX)
}

fn from_sql_millis(value: i64) -> Timestamp {
    Timestamp::from_millis(u64::try_from(value).unwrap_or_default())
}

fn to_seq(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

/// Reads `(seq, message)` rows for one receiver in FIFO order.
fn select_queue(
    conn: &Connection,
    receiver: &Identity,
) -> Result<Vec<(u64, Message)>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT seq, message_id, sender, body, sent_at
         FROM pending_messages WHERE receiver = ?1 ORDER BY seq ASC",
    )?;
    let rows = stmt.query_map(params![receiver.as_str()], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, i64>(4)?,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (seq, id, sender, body, sent_at) = row?;
        let id: MessageId = id
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("message id {id}: {e}")))?;
        out.push((
            to_seq(seq),
            Message {
                id,
                sender: Identity::new(sender),
                receiver: receiver.clone(),
                body,
                sent_at: from_sql_millis(sent_at),
                read: false,
            },
        ));
    }
    Ok(out)
}

impl PendingStore for SqliteStore {
    fn ensure_identity(&self, identity: &Identity) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO identities (identity, last_seen, created_at)
             VALUES (?1, NULL, ?2)",
            params![identity.as_str(), to_sql_millis(Timestamp::now())],
        )?;
        Ok(inserted > 0)
    }

    fn identity_exists(&self, identity: &Identity) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let found = conn
            .query_row(
                "SELECT 1 FROM identities WHERE identity = ?1",
                params![identity.as_str()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn append(&self, message: &Message) -> Result<u64, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let queued: i64 = tx.query_row(
            "SELECT COUNT(*) FROM pending_messages WHERE receiver = ?1",
            params![message.receiver.as_str()],
            |row| row.get(0),
        )?;
        if usize::try_from(queued).unwrap_or(usize::MAX) >= self.max_queue_size {
            return Err(StoreError::QueueFull {
                receiver: message.receiver.clone(),
                max: self.max_queue_size,
            });
        }
        tx.execute(
            "INSERT INTO pending_messages (receiver, message_id, sender, body, sent_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.receiver.as_str(),
                message.id.to_string(),
                message.sender.as_str(),
                message.body,
                to_sql_millis(message.sent_at),
            ],
        )?;
        let seq = tx.last_insert_rowid();
        tx.commit()?;
        Ok(to_seq(seq))
    }

    fn snapshot(&self, receiver: &Identity) -> Result<PendingBatch, StoreError> {
        let conn = self.conn.lock();
        let rows = select_queue(&conn, receiver)?;
        drop(conn);
        let through = rows.last().map_or(0, |(seq, _)| *seq);
        Ok(PendingBatch {
            through,
            messages: rows.into_iter().map(|(_, m)| m).collect(),
        })
    }

    fn clear_through(&self, receiver: &Identity, through: u64) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM pending_messages WHERE receiver = ?1 AND seq <= ?2",
            params![receiver.as_str(), i64::try_from(through).unwrap_or(i64::MAX)],
        )?;
        Ok(removed)
    }

    fn drain(&self, receiver: &Identity) -> Result<Vec<Message>, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let rows = select_queue(&tx, receiver)?;
        tx.execute(
            "DELETE FROM pending_messages WHERE receiver = ?1",
            params![receiver.as_str()],
        )?;
        tx.commit()?;
        Ok(rows.into_iter().map(|(_, m)| m).collect())
    }

    fn queue_len(&self, receiver: &Identity) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pending_messages WHERE receiver = ?1",
            params![receiver.as_str()],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn record_last_seen(&self, identity: &Identity, at: Timestamp) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO identities (identity, last_seen, created_at) VALUES (?1, ?2, ?2)
             ON CONFLICT(identity) DO UPDATE SET last_seen = excluded.last_seen",
            params![identity.as_str(), to_sql_millis(at)],
        )?;
        Ok(())
    }

    fn last_seen(&self, identity: &Identity) -> Result<Option<Timestamp>, StoreError> {
        let conn = self.conn.lock();
        let value: Option<Option<i64>> = conn
            .query_row(
                "SELECT last_seen FROM identities WHERE identity = ?1",
                params![identity.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.flatten().map(from_sql_millis))
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    last_seen: HashMap<Identity, Option<Timestamp>>,
    queues: HashMap<Identity, VecDeque<(u64, Message)>>,
    next_seq: u64,
}

/// Non-durable [`PendingStore`] used for ephemeral servers and tests.
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    max_queue_size: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store with the default queue size limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_queue_size(DEFAULT_MAX_QUEUE_SIZE)
    }

    /// Creates an empty store with a custom queue size limit.
    #[must_use]
    pub fn with_max_queue_size(max_queue_size: usize) -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
            max_queue_size,
        }
    }
}

impl PendingStore for MemoryStore {
    fn ensure_identity(&self, identity: &Identity) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        if inner.last_seen.contains_key(identity) {
            return Ok(false);
        }
        inner.last_seen.insert(identity.clone(), None);
        Ok(true)
    }

    fn identity_exists(&self, identity: &Identity) -> Result<bool, StoreError> {
        Ok(self.inner.lock().last_seen.contains_key(identity))
    }

    fn append(&self, message: &Message) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        inner.next_seq += 1;
        let seq = inner.next_seq;
        let queue = inner.queues.entry(message.receiver.clone()).or_default();
        if queue.len() >= self.max_queue_size {
            return Err(StoreError::QueueFull {
                receiver: message.receiver.clone(),
                max: self.max_queue_size,
            });
        }
        queue.push_back((seq, message.clone()));
        Ok(seq)
    }

    fn snapshot(&self, receiver: &Identity) -> Result<PendingBatch, StoreError> {
        let inner = self.inner.lock();
        let Some(queue) = inner.queues.get(receiver) else {
            return Ok(PendingBatch::default());
        };
        Ok(PendingBatch {
            through: queue.back().map_or(0, |(seq, _)| *seq),
            messages: queue.iter().map(|(_, m)| m.clone()).collect(),
        })
    }

    fn clear_through(&self, receiver: &Identity, through: u64) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock();
        let Some(queue) = inner.queues.get_mut(receiver) else {
            return Ok(0);
        };
        let before = queue.len();
        queue.retain(|(seq, _)| *seq > through);
        let removed = before - queue.len();
        if queue.is_empty() {
            inner.queues.remove(receiver);
        }
        Ok(removed)
    }

    fn drain(&self, receiver: &Identity) -> Result<Vec<Message>, StoreError> {
        let mut inner = self.inner.lock();
        Ok(inner
            .queues
            .remove(receiver)
            .map(|q| q.into_iter().map(|(_, m)| m).collect())
            .unwrap_or_default())
    }

    fn queue_len(&self, receiver: &Identity) -> Result<usize, StoreError> {
        Ok(self.inner.lock().queues.get(receiver).map_or(0, VecDeque::len))
    }

    fn record_last_seen(&self, identity: &Identity, at: Timestamp) -> Result<(), StoreError> {
        self.inner.lock().last_seen.insert(identity.clone(), Some(at));
        Ok(())
    }

    fn last_seen(&self, identity: &Identity) -> Result<Option<Timestamp>, StoreError> {
        Ok(self.inner.lock().last_seen.get(identity).copied().flatten())
    }
}

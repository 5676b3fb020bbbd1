//! Per-identity async mutual exclusion.
//!
//! The presence check and the pending-queue mutation that follows it must
//! not interleave with a bind or a flush for the same identity. Each
//! identity gets its own `tokio` mutex; entries are removed once no task
//! holds or waits on them.

use std::collections::HashMap;
use std::sync::Arc;

use courier_proto::message::Identity;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of per-identity locks.
#[derive(Debug, Default)]
pub struct IdentityLocks {
    locks: parking_lot::Mutex<HashMap<Identity, Arc<Mutex<()>>>>,
}

/// Holds one identity's lock until dropped.
#[derive(Debug)]
pub struct IdentityGuard<'a> {
    owner: &'a IdentityLocks,
    identity: Identity,
    guard: Option<OwnedMutexGuard<()>>,
}

impl IdentityLocks {
    /// Creates an empty lock registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `identity`.
    pub async fn lock(&self, identity: &Identity) -> IdentityGuard<'_> {
        let mutex = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(identity.clone()).or_default())
        };
        let guard = mutex.lock_owned().await;
        IdentityGuard {
            owner: self,
            identity: identity.clone(),
            guard: Some(guard),
        }
    }

    /// Number of identities with a live lock entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    /// Returns `true` if no lock entries are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for IdentityGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.owner.locks.lock();
        if locks
            .get(&self.identity)
            .is_some_and(|m| Arc::strong_count(m) == 1)
        {
            locks.remove(&self.identity);
        }
    }
}

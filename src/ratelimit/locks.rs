//! Per-identity mutual exclusion for admission decisions.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Registry of one async mutex per identity.
///
/// Locks are created on first use. Distinct identities never share a lock,
/// so a slow decision for one identity cannot stall another.
#[derive(Debug, Default)]
pub struct IdentityLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl IdentityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `identity`.
    ///
    /// The lock is released when the returned guard is dropped.
    pub async fn acquire(&self, identity: &str) -> OwnedMutexGuard<()> {
        // Clone out of the map before awaiting so no shard lock is held across the wait.
        let lock = self
            .locks
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop locks nobody holds or waits on. Returns how many were removed.
    ///
    /// A pruned identity simply gets a fresh lock on its next request.
    pub fn prune_idle(&self) -> usize {
        let before = self.locks.len();
        // Holders and waiters each keep a clone, and clones are only taken
        // under the shard lock that `retain` also holds.
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        let removed = before.saturating_sub(self.locks.len());
        if removed > 0 {
            debug!(removed, remaining = self.locks.len(), "Pruned idle identity locks");
        }
        removed
    }

    /// Number of identities with a live lock entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

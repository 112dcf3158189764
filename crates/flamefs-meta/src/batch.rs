//! Per-inode operation batching.
//!
//! Metadata operations on the same parent inode are serialized by a baton:
//! at most one batch commits at a time, later arrivals queue on the baton
//! and run against the committed state. Transactions remain the correctness
//! backstop; the baton exists so concurrent operations on a hot directory
//! queue instead of burning conflict retries against each other.

use std::sync::Arc;

use dashmap::DashMap;
use flamefs_types::InodeId;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of per-inode batons.
#[derive(Default)]
pub struct InodeBatons {
    slots: DashMap<InodeId, Arc<Mutex<()>>>,
}

impl InodeBatons {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, inode: InodeId) -> Arc<Mutex<()>> {
        self.slots
            .entry(inode)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for the baton of `inode`. Held across the operation's
    /// transaction; dropping it wakes the next queued batch.
    pub async fn lock(&self, inode: InodeId) -> OwnedMutexGuard<()> {
        self.slot(inode).lock_owned().await
    }

    /// Take the batons of two inodes in a deterministic order (smaller id
    /// first) so cross-directory operations cannot deadlock. For the same
    /// inode a single baton is taken.
    pub async fn lock_pair(
        &self,
        a: InodeId,
        b: InodeId,
    ) -> (OwnedMutexGuard<()>, Option<OwnedMutexGuard<()>>) {
        if a == b {
            return (self.lock(a).await, None);
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let first_guard = self.lock(first).await;
        let second_guard = self.lock(second).await;
        (first_guard, Some(second_guard))
    }

    /// Drop idle slots so the registry does not grow with every inode ever
    /// touched.
    pub fn shrink(&self) {
        self.slots
            .retain(|_, slot| Arc::strong_count(slot) > 1 || slot.try_lock().is_err());
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

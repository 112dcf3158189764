//! Primary election through a lease key in the KV store.
//!
//! A single record under the `CONF` prefix names the current primary and its
//! deadline. Acquisition is an ordinary read-modify-write transaction; the
//! conflict detection of the engine serializes competing claimants. A
//! follower takes over only after the deadline passes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use flamefs_kv::{KvEngine, ReadOnlyTransaction, ReadWriteTransaction};
use flamefs_schema as schema;
use flamefs_types::{NodeId, Result, TransactionCode, UtcTime};

const LEASE_KEY: &str = "mgmtd-lease";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseRecord {
    holder: NodeId,
    /// Epoch milliseconds after which the lease may be taken over.
    deadline_ms: i64,
}

/// Lease handle owned by one mgmtd instance.
pub struct PrimaryLease<E: KvEngine> {
    engine: Arc<E>,
    node_id: NodeId,
    duration: Duration,
    is_primary: AtomicBool,
}

impl<E: KvEngine> PrimaryLease<E> {
    pub fn new(engine: Arc<E>, node_id: NodeId, duration: Duration) -> Self {
        Self {
            engine,
            node_id,
            duration,
            is_primary: AtomicBool::new(false),
        }
    }

    /// Whether this instance held the lease at the last acquire/extend.
    pub fn is_primary(&self) -> bool {
        self.is_primary.load(Ordering::SeqCst)
    }

    /// Try to acquire or renew the lease. Returns whether this instance is
    /// now primary.
    pub async fn acquire(&self) -> Result<bool> {
        let now_ms = UtcTime::now().timestamp_millis();
        let mut txn = self.engine.create_readwrite_transaction();
        let key = schema::config_key(LEASE_KEY);

        let current: Option<LeaseRecord> = match txn.get(&key).await? {
            Some(raw) => serde_json::from_slice(&raw).ok(),
            None => None,
        };

        let can_claim = match &current {
            None => true,
            Some(lease) => lease.holder == self.node_id || lease.deadline_ms <= now_ms,
        };

        if !can_claim {
            let _ = txn.cancel().await;
            self.is_primary.store(false, Ordering::SeqCst);
            return Ok(false);
        }

        let record = LeaseRecord {
            holder: self.node_id,
            deadline_ms: now_ms + self.duration.as_millis() as i64,
        };
        let raw = serde_json::to_vec(&record).expect("lease record serializes");
        txn.set(&key, &raw).await?;

        match txn.commit().await {
            Ok(()) => {
                let newly = !self.is_primary.swap(true, Ordering::SeqCst);
                if newly {
                    tracing::info!(node = self.node_id.0, "acquired primary lease");
                }
                Ok(true)
            }
            Err(status) if status.code() == TransactionCode::CONFLICT => {
                // Someone else claimed it first.
                self.is_primary.store(false, Ordering::SeqCst);
                Ok(false)
            }
            Err(status) => Err(status),
        }
    }

    /// The node currently holding the lease, if unexpired.
    pub async fn current_holder(&self) -> Result<Option<NodeId>> {
        let txn = self.engine.create_readonly_transaction();
        let raw = txn.snapshot_get(&schema::config_key(LEASE_KEY)).await?;
        let now_ms = UtcTime::now().timestamp_millis();
        Ok(raw
            .and_then(|raw| serde_json::from_slice::<LeaseRecord>(&raw).ok())
            .filter(|lease| lease.deadline_ms > now_ms)
            .map(|lease| lease.holder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flamefs_kv_backends::MemKvEngine;

    #[tokio::test]
    async fn test_first_claimant_wins() {
        let engine = Arc::new(MemKvEngine::new());
        let a = PrimaryLease::new(Arc::clone(&engine), NodeId(1), Duration::from_secs(60));
        let b = PrimaryLease::new(Arc::clone(&engine), NodeId(2), Duration::from_secs(60));

        assert!(a.acquire().await.unwrap());
        assert!(a.is_primary());

        assert!(!b.acquire().await.unwrap());
        assert!(!b.is_primary());

        assert_eq!(a.current_holder().await.unwrap(), Some(NodeId(1)));
    }

    #[tokio::test]
    async fn test_holder_renews() {
        let engine = Arc::new(MemKvEngine::new());
        let a = PrimaryLease::new(Arc::clone(&engine), NodeId(1), Duration::from_secs(60));
        assert!(a.acquire().await.unwrap());
        assert!(a.acquire().await.unwrap());
        assert!(a.is_primary());
    }

    #[tokio::test]
    async fn test_takeover_after_expiry() {
        let engine = Arc::new(MemKvEngine::new());
        let a = PrimaryLease::new(Arc::clone(&engine), NodeId(1), Duration::from_millis(0));
        let b = PrimaryLease::new(Arc::clone(&engine), NodeId(2), Duration::from_secs(60));

        assert!(a.acquire().await.unwrap());
        // a's lease deadline is already in the past.
        assert!(b.acquire().await.unwrap());
        assert!(b.is_primary());
        assert_eq!(b.current_holder().await.unwrap(), Some(NodeId(2)));
    }

    #[tokio::test]
    async fn test_concurrent_claim_single_winner() {
        let engine = Arc::new(MemKvEngine::new());
        let mut handles = Vec::new();
        for id in 1..=4u32 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                let lease = PrimaryLease::new(engine, NodeId(id), Duration::from_secs(60));
                lease.acquire().await.unwrap()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}

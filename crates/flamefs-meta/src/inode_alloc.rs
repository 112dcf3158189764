//! Inode id allocation.
//!
//! Ids are dense and never reused within a generation. Sharded counters
//! persisted under the `CONF` prefix hand out ranges; each server reserves
//! a batch per transaction and serves from it locally, so allocation rarely
//! touches the store.

use std::sync::Arc;

use parking_lot::Mutex;

use flamefs_kv::{KvEngine, ReadOnlyTransaction, ReadWriteTransaction};
use flamefs_schema as schema;
use flamefs_types::{make_error_msg, InodeId, MetaCode, Result, TransactionCode};

/// Ids 0 and 1 are the tree roots; allocation starts past a reserved band.
const FIRST_DYNAMIC_ID: u64 = 1 << 10;

/// Counter-space range `[next, end)` reserved by this allocator.
struct Reserved {
    next: u64,
    end: u64,
}

/// Batch-reserving inode id allocator.
///
/// Shard `s` of `n` owns ids `FIRST_DYNAMIC_ID + counter * n + s`, so
/// distinct shards never collide and ids stay dense overall.
pub struct InodeAllocator<E: KvEngine> {
    engine: Arc<E>,
    shard: u32,
    shards: u32,
    batch: u64,
    reserved: Mutex<Reserved>,
}

impl<E: KvEngine> InodeAllocator<E>
where
    E::RwTxn: Send + Sync,
{
    pub fn new(engine: Arc<E>, shard: u32, shards: u32, batch: u64) -> Self {
        let shards = shards.max(1);
        Self {
            engine,
            shard: shard % shards,
            shards,
            batch: batch.max(1),
            reserved: Mutex::new(Reserved { next: 0, end: 0 }),
        }
    }

    fn id_of(&self, counter: u64) -> InodeId {
        InodeId(FIRST_DYNAMIC_ID + counter * self.shards as u64 + self.shard as u64)
    }

    /// Allocate one id, reserving a fresh range when the local one runs dry.
    pub async fn alloc(&self) -> Result<InodeId> {
        {
            let mut reserved = self.reserved.lock();
            if reserved.next < reserved.end {
                let counter = reserved.next;
                reserved.next += 1;
                return Ok(self.id_of(counter));
            }
        }

        let (start, end) = self.reserve_range().await?;
        let mut reserved = self.reserved.lock();
        // Another task may have refilled concurrently; reserved ranges never
        // overlap, so the spare range is simply dropped.
        if reserved.next >= reserved.end {
            *reserved = Reserved { next: start, end };
        }
        let counter = reserved.next;
        reserved.next += 1;
        Ok(self.id_of(counter))
    }

    /// Advance the persisted shard counter by `batch`, returning the
    /// counter-space range claimed.
    async fn reserve_range(&self) -> Result<(u64, u64)> {
        let key = schema::config_key(&format!("inode-alloc-{:04}", self.shard));
        for _ in 0..8 {
            let mut txn = self.engine.create_readwrite_transaction();
            let counter: u64 = match txn.get(&key).await? {
                Some(raw) => serde_json::from_slice(&raw).unwrap_or(0),
                None => 0,
            };
            let next = counter + self.batch;
            txn.set(&key, &serde_json::to_vec(&next).expect("u64 serializes"))
                .await?;
            match txn.commit().await {
                Ok(()) => return Ok((counter, next)),
                Err(status) if status.code() == TransactionCode::CONFLICT => continue,
                Err(status) => return Err(status),
            }
        }
        make_error_msg(MetaCode::INODE_ID_ALLOC_FAILED, "allocator kept conflicting")
    }
}

/// Whether an id is outside the reserved band (diagnostics).
pub fn is_dynamic(id: InodeId) -> bool {
    id.0 >= FIRST_DYNAMIC_ID
}

#[cfg(test)]
mod tests {
    use super::*;
    use flamefs_kv_backends::MemKvEngine;
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_ids_unique_and_dynamic() {
        let engine = Arc::new(MemKvEngine::new());
        let alloc = InodeAllocator::new(Arc::clone(&engine), 0, 4, 16);
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let id = alloc.alloc().await.unwrap();
            assert!(is_dynamic(id));
            assert!(seen.insert(id));
        }
    }

    #[tokio::test]
    async fn test_shards_do_not_collide() {
        let engine = Arc::new(MemKvEngine::new());
        let a = InodeAllocator::new(Arc::clone(&engine), 0, 2, 8);
        let b = InodeAllocator::new(Arc::clone(&engine), 1, 2, 8);
        let mut seen = HashSet::new();
        for _ in 0..50 {
            assert!(seen.insert(a.alloc().await.unwrap()));
            assert!(seen.insert(b.alloc().await.unwrap()));
        }
    }

    #[tokio::test]
    async fn test_allocation_survives_restart() {
        let engine = Arc::new(MemKvEngine::new());
        let mut seen = HashSet::new();
        {
            let alloc = InodeAllocator::new(Arc::clone(&engine), 0, 1, 4);
            for _ in 0..10 {
                assert!(seen.insert(alloc.alloc().await.unwrap()));
            }
        }
        // A restarted allocator reserves past anything handed out before.
        let alloc = InodeAllocator::new(engine, 0, 1, 4);
        for _ in 0..10 {
            assert!(seen.insert(alloc.alloc().await.unwrap()));
        }
    }

    #[tokio::test]
    async fn test_concurrent_allocators_same_shard() {
        let engine = Arc::new(MemKvEngine::new());
        let a = Arc::new(InodeAllocator::new(Arc::clone(&engine), 0, 1, 4));
        let b = Arc::new(InodeAllocator::new(Arc::clone(&engine), 0, 1, 4));
        let mut handles = Vec::new();
        for alloc in [a, b] {
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for _ in 0..20 {
                    ids.push(alloc.alloc().await.unwrap());
                }
                ids
            }));
        }
        let mut seen = HashSet::new();
        for h in handles {
            for id in h.await.unwrap() {
                assert!(seen.insert(id), "duplicate id {:?}", id);
            }
        }
    }
}

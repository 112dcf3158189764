//! In-memory KV engine: a sorted map behind a coarse lock plus a global
//! commit counter.
//!
//! Unlike a plain map, this engine implements the full transaction contract:
//! snapshot isolation for reads, optimistic read-conflict detection at
//! commit, and commit-time versionstamps. Tests and single-process
//! deployments use it in place of a production engine.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use flamefs_kv::{
    key_after, versionstamp_from_parts, GetRangeResult, KeySelector, KeyValue, KvEngine,
    ReadOnlyTransaction, ReadWriteTransaction, Versionstamp,
};
use flamefs_types::{make_error_msg, Result, TransactionCode};

// ---------------------------------------------------------------------------
// Shared store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Store {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Commit version that last touched each key (writes and clears).
    modified: BTreeMap<Vec<u8>, i64>,
    commit_version: i64,
}

/// In-memory KV engine. Cloning shares the underlying store.
#[derive(Clone, Default)]
pub struct MemKvEngine {
    store: Arc<Mutex<Store>>,
}

impl MemKvEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently committed.
    pub fn len(&self) -> usize {
        self.store.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.lock().data.is_empty()
    }

    /// The version assigned to the most recent commit.
    pub fn current_version(&self) -> i64 {
        self.store.lock().commit_version
    }
}

impl KvEngine for MemKvEngine {
    type RoTxn = MemReadOnlyTxn;
    type RwTxn = MemReadWriteTxn;

    fn create_readonly_transaction(&self) -> Self::RoTxn {
        let store = self.store.lock();
        MemReadOnlyTxn {
            snapshot: store.data.clone(),
            read_version: store.commit_version,
        }
    }

    fn create_readwrite_transaction(&self) -> Self::RwTxn {
        let store = self.store.lock();
        MemReadWriteTxn {
            snapshot: store.data.clone(),
            read_version: store.commit_version,
            read_keys: Vec::new(),
            read_ranges: Vec::new(),
            mutations: Vec::new(),
            store: Arc::clone(&self.store),
            canceled: false,
            committed_version: -1,
            committed_stamp: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Range collection
// ---------------------------------------------------------------------------

/// Resolve selectors into a half-open byte range `[begin, end)`.
/// An empty exclusive end means "no upper bound".
fn resolve_range(begin: &KeySelector, end: &KeySelector) -> (Vec<u8>, Option<Vec<u8>>) {
    let begin_key = if begin.inclusive {
        begin.key.clone()
    } else {
        key_after(&begin.key)
    };
    let end_key = if end.key.is_empty() && !end.inclusive {
        None
    } else if end.inclusive {
        Some(key_after(&end.key))
    } else {
        Some(end.key.clone())
    };
    (begin_key, end_key)
}

fn collect_range(
    map: &BTreeMap<Vec<u8>, Vec<u8>>,
    begin: &KeySelector,
    end: &KeySelector,
    limit: i32,
) -> GetRangeResult {
    let (begin_key, end_key) = resolve_range(begin, end);
    let limit = limit.max(0) as usize;

    let mut kvs = Vec::new();
    let mut has_more = false;
    for (k, v) in map.range(begin_key..) {
        if let Some(end_key) = &end_key {
            if k >= end_key {
                break;
            }
        }
        if kvs.len() >= limit {
            has_more = true;
            break;
        }
        kvs.push(KeyValue {
            key: k.clone(),
            value: v.clone(),
        });
    }

    GetRangeResult { kvs, has_more }
}

// ---------------------------------------------------------------------------
// Read-only transaction
// ---------------------------------------------------------------------------

/// Read-only transaction over a point-in-time snapshot.
pub struct MemReadOnlyTxn {
    snapshot: BTreeMap<Vec<u8>, Vec<u8>>,
    read_version: i64,
}

#[async_trait]
impl ReadOnlyTransaction for MemReadOnlyTxn {
    fn set_read_version(&mut self, version: i64) {
        self.read_version = version;
    }

    async fn snapshot_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.snapshot.get(key).cloned())
    }

    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.snapshot_get(key).await
    }

    async fn snapshot_get_range(
        &self,
        begin: &KeySelector,
        end: &KeySelector,
        limit: i32,
    ) -> Result<GetRangeResult> {
        Ok(collect_range(&self.snapshot, begin, end, limit))
    }

    async fn get_range(
        &mut self,
        begin: &KeySelector,
        end: &KeySelector,
        limit: i32,
    ) -> Result<GetRangeResult> {
        self.snapshot_get_range(begin, end, limit).await
    }

    async fn cancel(&mut self) -> Result<()> {
        Ok(())
    }

    fn reset(&mut self) {
        self.snapshot.clear();
    }
}

// ---------------------------------------------------------------------------
// Read-write transaction
// ---------------------------------------------------------------------------

enum Mutation {
    Set(Vec<u8>, Vec<u8>),
    Clear(Vec<u8>),
    StampedKey {
        key: Vec<u8>,
        offset: usize,
        value: Vec<u8>,
    },
    StampedValue {
        key: Vec<u8>,
        value: Vec<u8>,
        offset: usize,
    },
}

/// Read-write transaction. Plain writes are applied to the private snapshot
/// immediately (read-your-writes) and replayed into the shared store at
/// commit; versionstamped writes are only materialized at commit, once the
/// commit version is known.
pub struct MemReadWriteTxn {
    snapshot: BTreeMap<Vec<u8>, Vec<u8>>,
    read_version: i64,
    read_keys: Vec<Vec<u8>>,
    /// Half-open conflict ranges `[begin, end)`; empty end = unbounded.
    read_ranges: Vec<(Vec<u8>, Option<Vec<u8>>)>,
    mutations: Vec<Mutation>,
    store: Arc<Mutex<Store>>,
    canceled: bool,
    committed_version: i64,
    committed_stamp: Option<Versionstamp>,
}

#[async_trait]
impl ReadOnlyTransaction for MemReadWriteTxn {
    fn set_read_version(&mut self, version: i64) {
        self.read_version = version;
    }

    async fn snapshot_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.snapshot.get(key).cloned())
    }

    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.read_keys.push(key.to_vec());
        Ok(self.snapshot.get(key).cloned())
    }

    async fn snapshot_get_range(
        &self,
        begin: &KeySelector,
        end: &KeySelector,
        limit: i32,
    ) -> Result<GetRangeResult> {
        Ok(collect_range(&self.snapshot, begin, end, limit))
    }

    async fn get_range(
        &mut self,
        begin: &KeySelector,
        end: &KeySelector,
        limit: i32,
    ) -> Result<GetRangeResult> {
        self.read_ranges.push(resolve_range(begin, end));
        Ok(collect_range(&self.snapshot, begin, end, limit))
    }

    async fn cancel(&mut self) -> Result<()> {
        self.canceled = true;
        self.mutations.clear();
        self.read_keys.clear();
        self.read_ranges.clear();
        Ok(())
    }

    fn reset(&mut self) {
        self.canceled = false;
        self.mutations.clear();
        self.read_keys.clear();
        self.read_ranges.clear();
        self.committed_version = -1;
        self.committed_stamp = None;
        let store = self.store.lock();
        self.snapshot = store.data.clone();
        self.read_version = store.commit_version;
    }
}

#[async_trait]
impl ReadWriteTransaction for MemReadWriteTxn {
    async fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.snapshot.insert(key.to_vec(), value.to_vec());
        self.mutations
            .push(Mutation::Set(key.to_vec(), value.to_vec()));
        Ok(())
    }

    async fn clear(&mut self, key: &[u8]) -> Result<()> {
        self.snapshot.remove(key);
        self.mutations.push(Mutation::Clear(key.to_vec()));
        Ok(())
    }

    async fn add_read_conflict(&mut self, key: &[u8]) -> Result<()> {
        self.read_keys.push(key.to_vec());
        Ok(())
    }

    async fn add_read_conflict_range(&mut self, begin: &[u8], end: &[u8]) -> Result<()> {
        self.read_ranges
            .push((begin.to_vec(), Some(end.to_vec())));
        Ok(())
    }

    async fn set_versionstamped_key(
        &mut self,
        key: &[u8],
        offset: u32,
        value: &[u8],
    ) -> Result<()> {
        let offset = offset as usize;
        if offset + 10 > key.len() {
            return make_error_msg(
                TransactionCode::FAILED,
                "versionstamp offset out of key bounds",
            );
        }
        self.mutations.push(Mutation::StampedKey {
            key: key.to_vec(),
            offset,
            value: value.to_vec(),
        });
        Ok(())
    }

    async fn set_versionstamped_value(
        &mut self,
        key: &[u8],
        value: &[u8],
        offset: u32,
    ) -> Result<()> {
        let offset = offset as usize;
        if offset + 10 > value.len() {
            return make_error_msg(
                TransactionCode::FAILED,
                "versionstamp offset out of value bounds",
            );
        }
        self.mutations.push(Mutation::StampedValue {
            key: key.to_vec(),
            value: value.to_vec(),
            offset,
        });
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if self.canceled {
            return make_error_msg(TransactionCode::CANCELED, "transaction was canceled");
        }

        let mut store = self.store.lock();

        // Conflict detection: any key in the read set modified after our
        // read version fails the commit.
        for key in &self.read_keys {
            if let Some(&ver) = store.modified.get(key) {
                if ver > self.read_version {
                    return make_error_msg(
                        TransactionCode::CONFLICT,
                        format!("read key modified at version {}", ver),
                    );
                }
            }
        }
        for (begin, end) in &self.read_ranges {
            let conflicting = match end {
                Some(end) => store
                    .modified
                    .range(begin.clone()..end.clone())
                    .any(|(_, &ver)| ver > self.read_version),
                None => store
                    .modified
                    .range(begin.clone()..)
                    .any(|(_, &ver)| ver > self.read_version),
            };
            if conflicting {
                return make_error_msg(
                    TransactionCode::CONFLICT,
                    "read range modified after read version",
                );
            }
        }

        let version = store.commit_version + 1;
        let mut stamp_seq: u16 = 0;
        let mut first_stamp = None;

        for mutation in self.mutations.drain(..) {
            match mutation {
                Mutation::Set(key, value) => {
                    store.modified.insert(key.clone(), version);
                    store.data.insert(key, value);
                }
                Mutation::Clear(key) => {
                    store.modified.insert(key.clone(), version);
                    store.data.remove(&key);
                }
                Mutation::StampedKey { mut key, offset, value } => {
                    let stamp = versionstamp_from_parts(version, stamp_seq);
                    stamp_seq += 1;
                    first_stamp.get_or_insert(stamp);
                    key[offset..offset + 10].copy_from_slice(&stamp);
                    store.modified.insert(key.clone(), version);
                    store.data.insert(key, value);
                }
                Mutation::StampedValue { key, mut value, offset } => {
                    let stamp = versionstamp_from_parts(version, stamp_seq);
                    stamp_seq += 1;
                    first_stamp.get_or_insert(stamp);
                    value[offset..offset + 10].copy_from_slice(&stamp);
                    store.modified.insert(key.clone(), version);
                    store.data.insert(key, value);
                }
            }
        }

        store.commit_version = version;
        self.committed_version = version;
        self.committed_stamp = first_stamp;
        Ok(())
    }

    fn get_committed_version(&self) -> i64 {
        self.committed_version
    }

    fn get_committed_versionstamp(&self) -> Option<Versionstamp> {
        self.committed_stamp
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Deletion queue and garbage collection.
//!
//! An inode whose last name and last session are gone is moved onto the
//! `GCQE` queue in the same transaction that observed that state; the queue
//! entry is the commit record, so a crash between unlink and cleanup loses
//! nothing. A background worker drains the queue: it removes chunk data
//! through the storage client (idempotent, capped per pass) and erases the
//! inode record last.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use flamefs_kv::{KeySelector, KvEngine, ReadOnlyTransaction, ReadWriteTransaction};
use flamefs_layout::Layout;
use flamefs_proto::meta::InodeData;
use flamefs_schema as schema;
use flamefs_types::{InodeId, Result, Status, StatusCode, UtcTime, Uuid};

use crate::config::MetaConfig;
use crate::dir_entry::DirEntryList;
use crate::inode::Inode;

/// One queued deletion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcEntry {
    pub inode: InodeId,
    pub enqueued_at: UtcTime,
    /// Identity for the idempotent chunk-removal calls this entry drives.
    pub request_uuid: Uuid,
}

/// Issues chunk removals against the storage plane. The storage client
/// implements this; tests substitute an in-memory recorder.
#[async_trait]
pub trait ChunkRemover: Send + Sync {
    /// Remove up to `max_remove` chunks of `inode` with indices in
    /// `[index_begin, index_end)`. Returns `(removed, more)`; replaying a
    /// finished removal with the same `request` is a no-op.
    async fn remove_chunks(
        &self,
        inode: InodeId,
        layout: &Layout,
        index_begin: u32,
        index_end: u32,
        max_remove: u32,
        request: Uuid,
    ) -> Result<(u32, bool)>;
}

/// Stage a queue entry for `inode` inside the current transaction.
pub async fn enqueue(txn: &mut dyn ReadWriteTransaction, inode: &Inode) -> Result<()> {
    let entry = GcEntry {
        inode: inode.id(),
        enqueued_at: UtcTime::now(),
        request_uuid: Uuid::generate(),
    };
    let raw = serde_json::to_vec(&entry).map_err(|e| {
        Status::with_message(StatusCode::DATA_CORRUPTION, format!("gc entry: {}", e))
    })?;
    txn.set(&schema::gc_queue_key(inode.id()), &raw).await?;
    tracing::debug!(inode = inode.id().0, "queued for gc");
    Ok(())
}

/// Background worker draining the deletion queue.
pub struct GcWorker<E: KvEngine> {
    engine: Arc<E>,
    config: MetaConfig,
    remover: Arc<dyn ChunkRemover>,
}

impl<E: KvEngine> GcWorker<E>
where
    E::RoTxn: Send + Sync,
    E::RwTxn: Send + Sync,
{
    pub fn new(engine: Arc<E>, config: MetaConfig, remover: Arc<dyn ChunkRemover>) -> Self {
        Self {
            engine,
            config,
            remover,
        }
    }

    /// Drain one batch of queue entries. Returns how many inodes finished.
    pub async fn run_once(&self) -> Result<u32> {
        let entries = self.scan_queue().await?;
        let mut finished = 0;
        for entry in entries {
            match self.collect(&entry).await {
                Ok(true) => finished += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(inode = entry.inode.0, error = %e, "gc pass failed");
                }
            }
        }
        Ok(finished)
    }

    /// Spawn the periodic worker.
    pub fn spawn(self: Arc<Self>, runner: &mut flamefs_utils::BackgroundRunner)
    where
        E: 'static,
    {
        let interval = self.config.gc_interval;
        runner.spawn_periodic(interval, move || {
            let worker = Arc::clone(&self);
            async move {
                if let Err(e) = worker.run_once().await {
                    tracing::warn!(error = %e, "gc sweep failed");
                }
            }
        });
    }

    async fn scan_queue(&self) -> Result<Vec<GcEntry>> {
        let txn = self.engine.create_readonly_transaction();
        let prefix = schema::prefix::GC_QUEUE;
        let begin = KeySelector::new(prefix.to_vec(), true);
        let end = KeySelector::new(flamefs_kv::prefix_list_end_key(prefix), false);
        let result = txn
            .snapshot_get_range(&begin, &end, self.config.gc_batch)
            .await?;
        result
            .kvs
            .iter()
            .map(|kv| {
                serde_json::from_slice(&kv.value).map_err(|e| {
                    Status::with_message(StatusCode::DATA_CORRUPTION, format!("gc entry: {}", e))
                })
            })
            .collect()
    }

    /// Process one queue entry; `true` when the inode is fully gone.
    async fn collect(&self, entry: &GcEntry) -> Result<bool> {
        let txn = self.engine.create_readonly_transaction();
        let Some(inode) = Inode::snapshot_load(&txn, entry.inode).await? else {
            // Inode already erased; just drop the queue entry.
            self.finish(entry, false).await?;
            return Ok(true);
        };
        drop(txn);

        match &inode.record.data {
            InodeData::File { layout, length, .. } => {
                // All chunk indices the file may have touched.
                let end_index = length.div_ceil(layout.chunk_size.max(1) as u64) as u32;
                let mut begin_index = 0;
                loop {
                    let (removed, more) = self
                        .remover
                        .remove_chunks(
                            entry.inode,
                            layout,
                            begin_index,
                            end_index,
                            self.config.remove_chunks_batch_size,
                            entry.request_uuid,
                        )
                        .await?;
                    if !more {
                        break;
                    }
                    begin_index = begin_index.saturating_add(removed.max(1));
                }
                self.finish(entry, true).await?;
                tracing::debug!(inode = entry.inode.0, "gc collected file");
                Ok(true)
            }
            InodeData::Symlink { .. } => {
                self.finish(entry, true).await?;
                Ok(true)
            }
            InodeData::Directory { .. } => self.collect_directory(entry).await,
        }
    }

    /// Dismantle one page of a queued directory, re-queueing children.
    /// The directory itself finishes only once it is empty.
    async fn collect_directory(&self, entry: &GcEntry) -> Result<bool> {
        let mut txn = self.engine.create_readwrite_transaction();
        let page = DirEntryList::snapshot_load(&txn, entry.inode, "", self.config.gc_batch, false)
            .await?;

        if page.entries.is_empty() {
            let inode = Inode::load_required(&mut txn, entry.inode).await?;
            inode.remove(&mut txn).await?;
            txn.clear(&schema::gc_queue_key(entry.inode)).await?;
            txn.commit().await?;
            tracing::debug!(inode = entry.inode.0, "gc collected directory");
            return Ok(true);
        }

        for child in &page.entries {
            child.remove(&mut txn).await?;
            let Some(child_inode) = Inode::snapshot_load(&txn, child.inode_id()).await? else {
                continue;
            };
            if child_inode.is_directory() || child_inode.record.nlink <= 1 {
                let mut zeroed = child_inode;
                zeroed.record.nlink = 0;
                zeroed.store(&mut txn).await?;
                enqueue(&mut txn, &zeroed).await?;
            } else {
                let mut updated = child_inode;
                updated.record.nlink -= 1;
                updated.store(&mut txn).await?;
            }
        }
        txn.commit().await?;
        // More children (or the now-empty directory) next pass.
        Ok(false)
    }

    /// Erase the inode record (when `erase_inode`) and the queue entry.
    async fn finish(&self, entry: &GcEntry, erase_inode: bool) -> Result<()> {
        let mut txn = self.engine.create_readwrite_transaction();
        if erase_inode {
            txn.clear(&schema::inode_key(entry.inode)).await?;
        }
        txn.clear(&schema::gc_queue_key(entry.inode)).await?;
        txn.commit().await
    }
}

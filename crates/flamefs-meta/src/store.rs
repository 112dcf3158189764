//! MetaStore: shared per-server metadata state — configuration, the inode
//! id allocator and filesystem bootstrap.

use std::sync::Arc;

use flamefs_kv::{KvEngine, ReadWriteTransaction};
use flamefs_layout::Layout;
use flamefs_proto::meta::Acl;
use flamefs_types::{InodeId, NodeId, Result, UtcTime};

use crate::config::MetaConfig;
use crate::inode::Inode;
use crate::inode_alloc::InodeAllocator;

pub struct MetaStore<E: KvEngine> {
    config: MetaConfig,
    allocator: InodeAllocator<E>,
}

impl<E: KvEngine> MetaStore<E>
where
    E::RwTxn: Send + Sync,
{
    pub fn new(config: MetaConfig, engine: Arc<E>, node_id: NodeId) -> Self {
        let allocator = InodeAllocator::new(
            engine,
            node_id.0 % config.inode_alloc_shards,
            config.inode_alloc_shards,
            config.inode_alloc_batch,
        );
        Self { config, allocator }
    }

    pub fn config(&self) -> &MetaConfig {
        &self.config
    }

    pub async fn alloc_inode_id(&self) -> Result<InodeId> {
        self.allocator.alloc().await
    }

    pub fn now_ns(&self) -> i64 {
        UtcTime::now_nanos()
    }

    /// Create the root and GC-root directories when absent.
    pub async fn init_fs(
        &self,
        txn: &mut dyn ReadWriteTransaction,
        root_layout: Layout,
    ) -> Result<()> {
        let now_ns = self.now_ns();

        if Inode::load(txn, InodeId::ROOT).await?.is_none() {
            Inode::new_directory(
                InodeId::ROOT,
                InodeId::ROOT,
                "/",
                Acl::root(),
                root_layout.clone(),
                now_ns,
            )
            .store(txn)
            .await?;
            tracing::info!("created root inode");
        }

        if Inode::load(txn, InodeId::GC_ROOT).await?.is_none() {
            Inode::new_directory(
                InodeId::GC_ROOT,
                InodeId::GC_ROOT,
                "/",
                Acl::gc_root(),
                root_layout,
                now_ns,
            )
            .store(txn)
            .await?;
            tracing::info!("created gc root inode");
        }

        Ok(())
    }
}

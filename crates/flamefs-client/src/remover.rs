//! Bridges the metadata plane's chunk-removal needs (truncate, GC) onto
//! the storage client.

use std::sync::Arc;

use async_trait::async_trait;

use flamefs_layout::Layout;
use flamefs_meta::ChunkRemover;
use flamefs_types::{InodeId, Result, Status, Uuid};

use crate::storage::StorageClient;

pub struct StorageChunkRemover {
    storage: Arc<StorageClient>,
}

impl StorageChunkRemover {
    pub fn new(storage: Arc<StorageClient>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl ChunkRemover for StorageChunkRemover {
    async fn remove_chunks(
        &self,
        inode: InodeId,
        layout: &Layout,
        index_begin: u32,
        index_end: u32,
        max_remove: u32,
        request: Uuid,
    ) -> Result<(u32, bool)> {
        self.storage
            .remove_chunks(request, inode, layout, index_begin, index_end, max_remove)
            .await
            .map_err(|e| match e {
                crate::error::ClientError::Status(status) => status,
                other => Status::with_message(
                    flamefs_types::StatusCode::IO_ERROR,
                    format!("chunk removal failed: {}", other),
                ),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageClientConfig;
    use crate::routing::RoutingHandle;
    use flamefs_proto::common::{ChainInfo, ChainTable, RoutingInfo, TargetInfo, TargetState};
    use flamefs_storage::{
        ChunkEngine, MemChunkEngine, StorageConfig, StorageNode, StorageService, StorageTarget,
    };
    use flamefs_types::{ChainId, ChainTableId, ChainVer, NodeId, RoutingVersion, TargetId};

    #[tokio::test]
    async fn test_remover_clears_file_chunks() {
        // One chain, one target, one node.
        let mut info = RoutingInfo::default();
        info.routing_version = RoutingVersion(1);
        info.chains.insert(
            ChainId(100),
            ChainInfo::new(ChainId(100), ChainVer(1), &[TargetId(1)]),
        );
        info.targets.insert(
            TargetId(1),
            TargetInfo {
                target_id: TargetId(1),
                node_id: NodeId(1),
                disk_index: 0,
                state: TargetState::Online,
            },
        );
        info.chain_tables.insert(
            ChainTableId(1),
            ChainTable {
                table_id: ChainTableId(1),
                version: 1,
                chains: vec![ChainId(100)],
            },
        );
        let routing = RoutingHandle::new();
        routing.update(info).unwrap();

        let target = Arc::new(StorageTarget::new(
            TargetId(1),
            StorageConfig::default(),
            Arc::new(MemChunkEngine::new()),
            Arc::new(routing.clone()) as Arc<dyn flamefs_proto::common::RoutingProvider>,
        ));
        let node = Arc::new(StorageNode::new(
            NodeId(1),
            Arc::new(routing.clone()) as Arc<dyn flamefs_proto::common::RoutingProvider>,
        ));
        node.add_target(Arc::clone(&target));

        let client = Arc::new(StorageClient::new(
            StorageClientConfig::default(),
            Uuid::generate(),
            routing,
        ));
        client.add_node(NodeId(1), node as Arc<dyn StorageService>);

        let mut layout = Layout::new(ChainTableId(1), 1, 1 << 20, 1, 0);
        layout.chain_slots = vec![0];
        let inode = InodeId(55);
        client
            .write(inode, &layout, 0, &[7u8; 4096], Uuid::generate())
            .await
            .unwrap();
        let chunk = flamefs_layout::ChunkId::for_file(inode, 0);
        assert!(target.engine().meta(chunk).unwrap().is_some());

        let remover = StorageChunkRemover::new(Arc::clone(&client));
        let (removed, more) = remover
            .remove_chunks(inode, &layout, 0, 1, 16, Uuid::generate())
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(!more);
        assert!(target.engine().meta(chunk).unwrap().is_none());

        // Reapplying is a no-op.
        let (removed, _) = remover
            .remove_chunks(inode, &layout, 0, 1, 16, Uuid::generate())
            .await
            .unwrap();
        assert_eq!(removed, 0);
    }
}

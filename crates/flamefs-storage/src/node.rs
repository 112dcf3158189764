//! Node-level dispatch: one storage node hosts several targets; client
//! batches address the node, and the node routes each request to its local
//! replica of the chain in question.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use flamefs_proto::common::RoutingProvider;
use flamefs_proto::storage::*;
use flamefs_types::{make_error_msg, ChainId, NodeId, Result, StorageCode, TargetId};

use crate::service::StorageService;
use crate::target::StorageTarget;

pub struct StorageNode {
    node_id: NodeId,
    routing: Arc<dyn RoutingProvider>,
    targets: DashMap<TargetId, Arc<StorageTarget>>,
}

impl StorageNode {
    pub fn new(node_id: NodeId, routing: Arc<dyn RoutingProvider>) -> Self {
        Self {
            node_id,
            routing,
            targets: DashMap::new(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn add_target(&self, target: Arc<StorageTarget>) {
        self.targets.insert(target.target_id(), target);
    }

    pub fn get_target(&self, target: TargetId) -> Option<Arc<StorageTarget>> {
        self.targets.get(&target).map(|t| Arc::clone(&t))
    }

    /// The locally hosted replica of `chain_id`.
    fn local_member(&self, chain_id: ChainId) -> Result<Arc<StorageTarget>> {
        let routing = self.routing.routing();
        let chain = routing.get_chain(chain_id).ok_or_else(|| {
            flamefs_types::Status::with_message(
                flamefs_types::MgmtdCode::CHAIN_NOT_FOUND,
                format!("chain {} unknown", chain_id),
            )
        })?;
        for target in chain.target_ids() {
            if let Some(local) = self.get_target(target) {
                return Ok(local);
            }
        }
        make_error_msg(
            StorageCode::TARGET_NOT_FOUND,
            format!("node {} hosts no replica of chain {}", self.node_id, chain_id),
        )
    }
}

#[async_trait]
impl StorageService for StorageNode {
    async fn batch_read(&self, req: BatchReadReq) -> Result<BatchReadRsp> {
        self.local_member(req.chain_id)?.batch_read(req).await
    }

    async fn batch_write(&self, req: BatchWriteReq) -> Result<BatchWriteRsp> {
        self.local_member(req.chain_id)?.batch_write(req).await
    }

    async fn remove_chunks(&self, req: RemoveChunksReq) -> Result<RemoveChunksRsp> {
        self.local_member(req.chain_id)?.remove_chunks(req).await
    }

    async fn forward_update(&self, req: ForwardUpdateReq) -> Result<ForwardUpdateRsp> {
        self.local_member(req.chain_id)?.forward_update(req).await
    }

    async fn commit_update(&self, req: CommitUpdateReq) -> Result<CommitUpdateRsp> {
        self.local_member(req.chain_id)?.commit_update(req).await
    }

    async fn query_chunk(&self, req: QueryChunkReq) -> Result<QueryChunkRsp> {
        self.local_member(req.chain_id)?.query_chunk(req).await
    }
}

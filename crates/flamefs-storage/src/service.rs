//! Storage service trait: the operations a target serves to clients and to
//! its chain peers.

use async_trait::async_trait;

use flamefs_proto::storage::*;
use flamefs_types::Result;

/// Chunk I/O and chain-replication operations of one storage target.
///
/// `forward_update` and `commit_update` are chain-internal: a replica
/// invokes them on its successor/peers; clients only use the batch calls.
#[async_trait]
pub trait StorageService: Send + Sync {
    /// Read chunks from this replica with version verification.
    async fn batch_read(&self, req: BatchReadReq) -> Result<BatchReadRsp>;

    /// Write chunks through this replica; it must head the chain.
    async fn batch_write(&self, req: BatchWriteReq) -> Result<BatchWriteRsp>;

    /// Remove chunks in a chunk-id range along the chain. Idempotent.
    async fn remove_chunks(&self, req: RemoveChunksReq) -> Result<RemoveChunksRsp>;

    /// Apply an update forwarded from the chain predecessor. The response
    /// carries the tail's commit version back up the chain.
    async fn forward_update(&self, req: ForwardUpdateReq) -> Result<ForwardUpdateRsp>;

    /// Mark a staged update committed (chain acknowledgement / resync).
    async fn commit_update(&self, req: CommitUpdateReq) -> Result<CommitUpdateRsp>;

    /// Report a chunk's replica metadata.
    async fn query_chunk(&self, req: QueryChunkReq) -> Result<QueryChunkRsp>;
}

//! A storage target: one replica holder participating in chains.
//!
//! Writes arrive at the chain head, stage locally as uncommitted, forward
//! to the successor and commit on the acknowledgement path back; the head
//! answers the client only after its own commit. Reads go to any replica
//! and are version-verified; a replica holding only an uncommitted update
//! asks the tail for the authoritative committed bytes.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use flamefs_layout::ChunkId;
use flamefs_proto::common::{ChainInfo, RoutingProvider};
use flamefs_proto::storage::*;
use flamefs_types::{
    make_error_msg, ChainId, ChainVer, ChunkVer, Result, Status, StorageCode, TargetId,
};

use crate::config::StorageConfig;
use crate::engine::ChunkEngine;
use crate::service::StorageService;

/// One storage target.
pub struct StorageTarget {
    target_id: TargetId,
    config: StorageConfig,
    engine: Arc<dyn ChunkEngine>,
    routing: Arc<dyn RoutingProvider>,
    /// Handles to the other targets of this cluster, keyed by target id.
    peers: DashMap<TargetId, Arc<dyn StorageService>>,
    /// Updates this head already drove to commit, for client replays.
    applied: DashMap<UpdateId, ChunkVer>,
}

impl StorageTarget {
    pub fn new(
        target_id: TargetId,
        config: StorageConfig,
        engine: Arc<dyn ChunkEngine>,
        routing: Arc<dyn RoutingProvider>,
    ) -> Self {
        Self {
            target_id,
            config,
            engine,
            routing,
            peers: DashMap::new(),
            applied: DashMap::new(),
        }
    }

    pub fn target_id(&self) -> TargetId {
        self.target_id
    }

    pub fn engine(&self) -> &Arc<dyn ChunkEngine> {
        &self.engine
    }

    pub fn add_peer(&self, target: TargetId, service: Arc<dyn StorageService>) {
        self.peers.insert(target, service);
    }

    /// Drop staged updates whose writer went away; the chain retransmits
    /// anything it still wants.
    pub fn reclaim_stale(&self) -> usize {
        self.engine
            .reclaim_stale_uncommitted(self.config.max_uncommitted_age)
    }

    fn chain(&self, chain_id: ChainId, expected: ChainVer) -> Result<ChainInfo> {
        let routing = self.routing.routing();
        let chain = routing.get_chain(chain_id).ok_or_else(|| {
            Status::with_message(
                flamefs_types::MgmtdCode::CHAIN_NOT_FOUND,
                format!("chain {} unknown", chain_id),
            )
        })?;
        if chain.version != expected {
            return make_error_msg(
                StorageCode::CHAIN_VERSION_MISMATCH,
                format!(
                    "chain {} at version {}, request carried {}",
                    chain_id, chain.version.0, expected.0
                ),
            );
        }
        Ok(chain.clone())
    }

    fn peer(&self, target: TargetId) -> Result<Arc<dyn StorageService>> {
        self.peers
            .get(&target)
            .map(|p| Arc::clone(&p))
            .ok_or_else(|| {
                Status::with_message(
                    StorageCode::NO_SUCCESSOR_TARGET,
                    format!("no connection to target {}", target),
                )
            })
    }

    fn require_member(&self, chain: &ChainInfo) -> Result<()> {
        if chain.position_of(self.target_id).is_none() {
            return make_error_msg(
                StorageCode::TARGET_STATE_INVALID,
                format!("target {} not in chain {}", self.target_id, chain.chain_id),
            );
        }
        Ok(())
    }

    /// Verify the committed image of `chunk_id` against its stored
    /// checksum.
    fn verify_checksum(&self, chunk_id: ChunkId) -> Result<()> {
        if !self.config.verify_checksum_on_read {
            return Ok(());
        }
        let Some(meta) = self.engine.meta(chunk_id)? else {
            return Ok(());
        };
        let Some((_, image)) = self.engine.committed_image(chunk_id)? else {
            return Ok(());
        };
        if crc32c::crc32c(&image) != meta.checksum {
            tracing::error!(
                target = self.target_id.0,
                chunk = %chunk_id,
                "checksum mismatch on committed chunk"
            );
            return make_error_msg(
                StorageCode::CHECKSUM_MISMATCH,
                format!("chunk {} failed checksum verification", chunk_id),
            );
        }
        Ok(())
    }

    /// Drive one write through the chain and commit it locally.
    async fn replicate_write(&self, chain: &ChainInfo, io: &WriteIo, chain_version: ChainVer)
        -> Result<ChunkVer> {
        // A replayed batch must not re-apply.
        if let Some(version) = self.applied.get(&io.update_id) {
            return Ok(*version);
        }

        let outcome = self.engine.write(
            io.chunk_id,
            io.offset,
            &io.data,
            io.chunk_size,
            chain_version,
            io.update_id,
        )?;

        let commit_version = match chain.successor_of(self.target_id) {
            Some(successor) => {
                let rsp = self
                    .peer(successor)?
                    .forward_update(ForwardUpdateReq {
                        chain_id: chain.chain_id,
                        chain_version,
                        chunk_id: io.chunk_id,
                        offset: io.offset,
                        data: io.data.clone(),
                        chunk_size: io.chunk_size,
                        chunk_version: outcome.version,
                        update_id: io.update_id,
                    })
                    .await?;
                rsp.commit_version
            }
            None => outcome.version,
        };

        self.engine.commit(io.chunk_id, commit_version)?;
        self.applied.insert(io.update_id, commit_version);
        Ok(commit_version)
    }

    /// Serve one read io from the committed state, consulting the tail
    /// when this replica only has an update in flight.
    async fn serve_read(&self, chain: &ChainInfo, io: &ReadIo, chain_version: ChainVer)
        -> Result<(Vec<u8>, ChunkVer)> {
        let outcome = self.engine.read(io.chunk_id, io.offset, io.length)?;

        if outcome.version == ChunkVer(0) && outcome.has_uncommitted {
            // Nothing committed locally yet. The tail holds the
            // authoritative committed version.
            let tail = chain.tail().ok_or_else(|| {
                Status::with_message(StorageCode::NO_SUCCESSOR_TARGET, "chain has no tail")
            })?;
            if tail == self.target_id {
                return make_error_msg(
                    StorageCode::CHUNK_NOT_COMMIT,
                    format!("chunk {} has no committed version", io.chunk_id),
                );
            }
            let rsp = self
                .peer(tail)?
                .batch_read(BatchReadReq {
                    chain_id: chain.chain_id,
                    chain_version,
                    ios: vec![io.clone()],
                })
                .await?;
            let result = rsp.results.into_iter().next().ok_or_else(|| {
                Status::with_message(StorageCode::CHUNK_NOT_COMMIT, "tail returned nothing")
            })?;
            if !result.is_ok() {
                return Err(Status::with_message(
                    result.code,
                    result.message.unwrap_or_default(),
                ));
            }
            return Ok((result.data, result.chunk_version));
        }

        self.verify_checksum(io.chunk_id)?;
        Ok((outcome.data, outcome.version))
    }
}

#[async_trait]
impl StorageService for StorageTarget {
    async fn batch_read(&self, req: BatchReadReq) -> Result<BatchReadRsp> {
        let chain = self.chain(req.chain_id, req.chain_version)?;
        self.require_member(&chain)?;

        let mut results = Vec::with_capacity(req.ios.len());
        for io in &req.ios {
            let result = match self.serve_read(&chain, io, req.chain_version).await {
                Ok((data, version)) => ReadIoResult::ok(data, version),
                Err(status) => {
                    ReadIoResult::error(status.code(), status.message().unwrap_or_default())
                }
            };
            results.push(result);
        }
        Ok(BatchReadRsp {
            chain_version: chain.version,
            results,
        })
    }

    async fn batch_write(&self, req: BatchWriteReq) -> Result<BatchWriteRsp> {
        let chain = self.chain(req.chain_id, req.chain_version)?;
        if chain.head() != Some(self.target_id) {
            return make_error_msg(
                StorageCode::TARGET_STATE_INVALID,
                format!("target {} does not head chain {}", self.target_id, req.chain_id),
            );
        }

        // Updates are applied in receipt order; each commits through the
        // whole chain before the next starts.
        let mut results = Vec::with_capacity(req.ios.len());
        for io in &req.ios {
            let result = match self.replicate_write(&chain, io, req.chain_version).await {
                Ok(version) => WriteIoResult::ok(io.data.len() as u32, version),
                Err(status) => {
                    tracing::warn!(
                        chunk = %io.chunk_id,
                        code = status.code(),
                        "chain write failed"
                    );
                    WriteIoResult::error(status.code(), status.message().unwrap_or_default())
                }
            };
            results.push(result);
        }
        Ok(BatchWriteRsp {
            chain_version: chain.version,
            results,
        })
    }

    async fn remove_chunks(&self, req: RemoveChunksReq) -> Result<RemoveChunksRsp> {
        let chain = self.chain(req.chain_id, req.chain_version)?;
        self.require_member(&chain)?;

        let listed = self
            .engine
            .list_meta(req.begin, req.end, req.max_remove as usize + 1)?;
        let more = listed.len() > req.max_remove as usize;
        let mut removed = 0;
        for (chunk_id, _) in listed.into_iter().take(req.max_remove as usize) {
            self.engine.remove(chunk_id)?;
            removed += 1;
        }

        // Propagate down the chain so every replica forgets the range.
        if let Some(successor) = chain.successor_of(self.target_id) {
            let down = self.peer(successor)?.remove_chunks(req.clone()).await?;
            removed = removed.max(down.removed);
            return Ok(RemoveChunksRsp {
                removed,
                more: more || down.more,
            });
        }
        Ok(RemoveChunksRsp { removed, more })
    }

    async fn forward_update(&self, req: ForwardUpdateReq) -> Result<ForwardUpdateRsp> {
        let chain = self.chain(req.chain_id, req.chain_version)?;
        self.require_member(&chain)?;

        // Detect gaps: the forwarded tentative version must be the next one
        // for this replica.
        let local_committed = self
            .engine
            .meta(req.chunk_id)?
            .map(|m| m.chunk_version)
            .unwrap_or(ChunkVer(0));
        if req.chunk_version <= local_committed {
            // Duplicate forward of something already committed here.
            return Ok(ForwardUpdateRsp {
                commit_version: local_committed,
            });
        }
        if req.chunk_version.0 > local_committed.0 + 1 {
            return make_error_msg(
                StorageCode::CHUNK_MISSING_UPDATE,
                format!(
                    "forwarded version {} but local committed {}",
                    req.chunk_version.0, local_committed.0
                ),
            );
        }

        let outcome = self.engine.write(
            req.chunk_id,
            req.offset,
            &req.data,
            req.chunk_size,
            req.chain_version,
            req.update_id,
        )?;
        debug_assert_eq!(outcome.version, req.chunk_version);

        let commit_version = match chain.successor_of(self.target_id) {
            Some(successor) => {
                let rsp = self
                    .peer(successor)?
                    .forward_update(req.clone())
                    .await?;
                rsp.commit_version
            }
            // The tail commits and starts the acknowledgement path.
            None => outcome.version,
        };

        self.engine.commit(req.chunk_id, commit_version)?;
        Ok(ForwardUpdateRsp { commit_version })
    }

    async fn commit_update(&self, req: CommitUpdateReq) -> Result<CommitUpdateRsp> {
        let chain = self.chain(req.chain_id, req.chain_version)?;
        self.require_member(&chain)?;
        self.engine.commit(req.chunk_id, req.chunk_version)?;
        Ok(CommitUpdateRsp {})
    }

    async fn query_chunk(&self, req: QueryChunkReq) -> Result<QueryChunkRsp> {
        Ok(QueryChunkRsp {
            meta: self.engine.meta(req.chunk_id)?,
        })
    }
}

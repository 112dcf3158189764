//! The storage client: splits file I/O into per-chunk sub-ops, routes them
//! to chain replicas, batches per destination, and retries with routing
//! refreshes on version mismatches.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rand::Rng;

use flamefs_layout::{ChunkId, Layout};
use flamefs_proto::common::{ChainInfo, RoutingInfo, TargetState};
use flamefs_proto::storage::*;
use flamefs_storage::StorageService;
use flamefs_types::{
    ChainId, InodeId, MgmtdCode, NodeId, RPCCode, Status, StorageCode, TargetId,
    TransactionCode, Uuid,
};
use flamefs_utils::Semaphore;

use crate::config::StorageClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::retry::ExponentialBackoff;
use crate::routing::{RoutingHandle, RoutingRefresher};

/// Replica choice for reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSelection {
    Head,
    Tail,
    RoundRobin,
    Random,
}

/// How a failed sub-op should be handled.
enum ErrorClass {
    /// Stale chain/routing: refresh and recompute.
    StaleRouting,
    /// Transient transport trouble: back off and retry.
    Transient,
    /// Data corruption on a replica: avoid it and retry elsewhere.
    Corrupt,
    /// Not recoverable by the client.
    Permanent,
}

fn classify(code: flamefs_types::status_code_t) -> ErrorClass {
    match code {
        StorageCode::CHAIN_VERSION_MISMATCH | MgmtdCode::CHAIN_NOT_FOUND | MgmtdCode::STALE_ROUTING => {
            ErrorClass::StaleRouting
        }
        RPCCode::TIMEOUT
        | RPCCode::SEND_FAILED
        | RPCCode::SOCKET_ERROR
        | RPCCode::CONNECT_FAILED
        | TransactionCode::NETWORK_ERROR
        | TransactionCode::THROTTLED
        | StorageCode::CHUNK_NOT_COMMIT => ErrorClass::Transient,
        StorageCode::CHECKSUM_MISMATCH => ErrorClass::Corrupt,
        _ => ErrorClass::Permanent,
    }
}

struct NodeHandle {
    service: Arc<dyn StorageService>,
    inflight: Semaphore,
}

/// Chunk-level I/O client.
pub struct StorageClient {
    config: StorageClientConfig,
    client_id: Uuid,
    routing: RoutingHandle,
    refresher: Option<Arc<dyn RoutingRefresher>>,
    nodes: DashMap<NodeId, Arc<NodeHandle>>,
    round_robin: AtomicUsize,
}

impl StorageClient {
    pub fn new(config: StorageClientConfig, client_id: Uuid, routing: RoutingHandle) -> Self {
        Self {
            config,
            client_id,
            routing,
            refresher: None,
            nodes: DashMap::new(),
            round_robin: AtomicUsize::new(0),
        }
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn RoutingRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Register the transport handle for a storage node.
    pub fn add_node(&self, node: NodeId, service: Arc<dyn StorageService>) {
        self.nodes.insert(
            node,
            Arc::new(NodeHandle {
                service,
                inflight: Semaphore::new(self.config.max_concurrent_requests_per_node),
            }),
        );
    }

    pub fn routing(&self) -> &RoutingHandle {
        &self.routing
    }

    async fn refresh_routing(&self) -> ClientResult<()> {
        match &self.refresher {
            Some(refresher) => refresher.refresh().await,
            None => Ok(()),
        }
    }

    fn node_handle(&self, node: NodeId) -> ClientResult<Arc<NodeHandle>> {
        self.nodes
            .get(&node)
            .map(|h| Arc::clone(&h))
            .ok_or(ClientError::NoConnection(node))
    }

    fn resolve_chain(
        &self,
        routing: &RoutingInfo,
        layout: &Layout,
        chunk_index: u32,
    ) -> ClientResult<ChainInfo> {
        let position = layout
            .chain_ref(chunk_index)
            .map_err(ClientError::Status)?;
        let chain_id = routing
            .resolve_chain_ref(layout.chain_table_id, position)
            .ok_or_else(|| {
                ClientError::RoutingIncomplete(format!(
                    "chain table {} has no position {}",
                    layout.chain_table_id, position
                ))
            })?;
        routing
            .get_chain(chain_id)
            .cloned()
            .ok_or_else(|| ClientError::RoutingIncomplete(format!("chain {} unknown", chain_id)))
    }

    fn target_online(routing: &RoutingInfo, target: TargetId) -> bool {
        routing
            .get_target(target)
            .map(|t| t.state == TargetState::Online)
            .unwrap_or(true)
    }

    /// Pick the replica a read goes to, avoiding `suspects`.
    fn pick_read_target(
        &self,
        routing: &RoutingInfo,
        chain: &ChainInfo,
        suspects: &[TargetId],
    ) -> ClientResult<TargetId> {
        let candidates: Vec<TargetId> = chain
            .target_ids()
            .into_iter()
            .filter(|t| Self::target_online(routing, *t) && !suspects.contains(t))
            .collect();
        if candidates.is_empty() {
            return Err(ClientError::RoutingIncomplete(format!(
                "chain {} has no readable replica",
                chain.chain_id
            )));
        }
        let picked = match self.config.read_selection {
            ReadSelection::Head => candidates[0],
            ReadSelection::Tail => *candidates.last().unwrap(),
            ReadSelection::RoundRobin => {
                candidates[self.round_robin.fetch_add(1, Ordering::Relaxed) % candidates.len()]
            }
            ReadSelection::Random => candidates[rand::thread_rng().gen_range(0..candidates.len())],
        };
        Ok(picked)
    }

    fn node_of(&self, routing: &RoutingInfo, target: TargetId) -> ClientResult<NodeId> {
        routing.node_of_target(target).ok_or_else(|| {
            ClientError::RoutingIncomplete(format!("target {} has no node", target))
        })
    }

    /// Issue one batch to a node, bounded by the per-node pipeline cap.
    async fn send_write(
        &self,
        node: NodeId,
        req: BatchWriteReq,
    ) -> ClientResult<BatchWriteRsp> {
        let handle = self.node_handle(node)?;
        let _permit = handle.inflight.acquire().await;
        handle.service.batch_write(req).await.map_err(ClientError::Status)
    }

    async fn send_read(&self, node: NodeId, req: BatchReadReq) -> ClientResult<BatchReadRsp> {
        let handle = self.node_handle(node)?;
        let _permit = handle.inflight.acquire().await;
        handle.service.batch_read(req).await.map_err(ClientError::Status)
    }

    // -- write --------------------------------------------------------------

    /// Write `data` at `offset` of the file. Returns bytes written. The
    /// same `request` uuid replays with identical update ids, so storage
    /// deduplicates.
    pub async fn write(
        &self,
        inode: InodeId,
        layout: &Layout,
        offset: u64,
        data: &[u8],
        request: Uuid,
    ) -> ClientResult<u64> {
        let ranges = layout.split_range(offset, data.len() as u64);
        if ranges.is_empty() {
            return Ok(0);
        }

        // Per-chunk sub-writes, each addressing exactly one chain; grouped
        // by chunk index so regrouping under fresh routing is cheap.
        let mut sub_ops: Vec<(u32, WriteIo)> = Vec::with_capacity(ranges.len());
        let mut consumed = 0usize;
        for (sub_op, range) in ranges.iter().enumerate() {
            let slice = &data[consumed..consumed + range.length as usize];
            consumed += range.length as usize;
            sub_ops.push((
                range.chunk_index,
                WriteIo {
                    chunk_id: layout.chunk_id(inode, range.chunk_index),
                    offset: range.offset_in_chunk,
                    data: slice.to_vec(),
                    chunk_size: layout.chunk_size,
                    update_id: UpdateId::new(self.client_id, request, sub_op as u32),
                },
            ));
        }

        let mut total = 0u64;
        let mut backoff = ExponentialBackoff::new(
            self.config.retry_init_wait,
            self.config.retry_max_wait,
            self.config.retry_total,
        );

        // Outstanding sub-ops, retried until done or the budget runs out.
        let mut pending = sub_ops;
        loop {
            let routing = self.routing.get();

            // Group pending sub-ops by chain under the current routing.
            let mut groups: BTreeMap<ChainId, (ChainInfo, Vec<(u32, WriteIo)>)> = BTreeMap::new();
            for (chunk_index, io) in pending.drain(..) {
                let chain = self.resolve_chain(&routing, layout, chunk_index)?;
                groups
                    .entry(chain.chain_id)
                    .or_insert_with(|| (chain.clone(), Vec::new()))
                    .1
                    .push((chunk_index, io));
            }

            let mut retry: Vec<(u32, WriteIo)> = Vec::new();
            let mut last_error: Option<Status> = None;

            for (_, (chain, ios)) in groups {
                let head = chain.head().ok_or_else(|| {
                    ClientError::RoutingIncomplete(format!("chain {} is empty", chain.chain_id))
                })?;
                let node = self.node_of(&routing, head)?;

                for batch in split_batches(ios, self.config.max_batch_size, self.config.max_batch_bytes)
                {
                    let req = BatchWriteReq {
                        chain_id: chain.chain_id,
                        chain_version: chain.version,
                        ios: batch.iter().map(|(_, io)| io.clone()).collect(),
                    };
                    match self.send_write(node, req).await {
                        Ok(rsp) => {
                            for ((chunk_index, io), result) in
                                batch.into_iter().zip(rsp.results.into_iter())
                            {
                                if result.is_ok() {
                                    total += result.bytes_written as u64;
                                } else {
                                    let status = Status::with_message(
                                        result.code,
                                        result.message.unwrap_or_default(),
                                    );
                                    match classify(result.code) {
                                        ErrorClass::StaleRouting | ErrorClass::Transient => {
                                            last_error = Some(status);
                                            retry.push((chunk_index, io));
                                        }
                                        // A corrupt replica on the write
                                        // path needs chain repair; surface
                                        // it so metadata can demote.
                                        ErrorClass::Corrupt | ErrorClass::Permanent => {
                                            return Err(ClientError::Status(status));
                                        }
                                    }
                                }
                            }
                        }
                        Err(ClientError::Status(status))
                            if !matches!(classify(status.code()), ErrorClass::Permanent) =>
                        {
                            last_error = Some(status);
                            retry.extend(batch);
                        }
                        Err(other) => return Err(other),
                    }
                }
            }

            if retry.is_empty() {
                return Ok(total);
            }

            let stale = last_error
                .as_ref()
                .is_some_and(|s| matches!(classify(s.code()), ErrorClass::StaleRouting));
            if stale {
                self.refresh_routing().await?;
            }
            let wait = if stale {
                backoff.fast_wait()
            } else {
                backoff.next_wait()
            };
            match wait {
                Some(wait) => tokio::time::sleep(wait).await,
                None => {
                    return Err(ClientError::RetryExhausted {
                        attempts: backoff.attempts(),
                        last: last_error
                            .unwrap_or_else(|| Status::new(RPCCode::TIMEOUT)),
                    })
                }
            }
            pending = retry;
        }
    }

    // -- read ---------------------------------------------------------------

    /// Read `length` bytes at `offset`. Bytes past the last committed chunk
    /// content come back zeroed (holes).
    pub async fn read(
        &self,
        inode: InodeId,
        layout: &Layout,
        offset: u64,
        length: u64,
    ) -> ClientResult<Vec<u8>> {
        let ranges = layout.split_range(offset, length);
        let mut buffer = vec![0u8; length as usize];
        if ranges.is_empty() {
            return Ok(buffer);
        }

        // (chunk_index, io, destination offset in `buffer`)
        let mut pending: Vec<(u32, ReadIo, usize)> = Vec::with_capacity(ranges.len());
        let mut cursor = 0usize;
        for range in &ranges {
            pending.push((
                range.chunk_index,
                ReadIo {
                    chunk_id: layout.chunk_id(inode, range.chunk_index),
                    offset: range.offset_in_chunk,
                    length: range.length,
                },
                cursor,
            ));
            cursor += range.length as usize;
        }

        let mut backoff = ExponentialBackoff::new(
            self.config.retry_init_wait,
            self.config.retry_max_wait,
            self.config.retry_total,
        );
        let mut suspects: Vec<TargetId> = Vec::new();

        loop {
            let routing = self.routing.get();

            let mut groups: BTreeMap<ChainId, (ChainInfo, Vec<(u32, ReadIo, usize)>)> =
                BTreeMap::new();
            for entry in pending.drain(..) {
                let chain = self.resolve_chain(&routing, layout, entry.0)?;
                groups
                    .entry(chain.chain_id)
                    .or_insert_with(|| (chain.clone(), Vec::new()))
                    .1
                    .push(entry);
            }

            let mut retry: Vec<(u32, ReadIo, usize)> = Vec::new();
            let mut last_error: Option<Status> = None;

            for (_, (chain, ios)) in groups {
                let target = self.pick_read_target(&routing, &chain, &suspects)?;
                let node = self.node_of(&routing, target)?;

                for batch in split_read_batches(ios, self.config.max_batch_size) {
                    let req = BatchReadReq {
                        chain_id: chain.chain_id,
                        chain_version: chain.version,
                        ios: batch.iter().map(|(_, io, _)| io.clone()).collect(),
                    };
                    match self.send_read(node, req).await {
                        Ok(rsp) => {
                            // A reply tagged with a superseded chain version
                            // is discarded wholesale.
                            if rsp.chain_version < chain.version {
                                last_error = Some(Status::new(
                                    StorageCode::CHAIN_VERSION_MISMATCH,
                                ));
                                retry.extend(batch);
                                continue;
                            }
                            for ((chunk_index, io, dest), result) in
                                batch.into_iter().zip(rsp.results.into_iter())
                            {
                                if result.is_ok() {
                                    let take = result.data.len().min(io.length as usize);
                                    buffer[dest..dest + take]
                                        .copy_from_slice(&result.data[..take]);
                                } else {
                                    let status = Status::with_message(
                                        result.code,
                                        result.message.unwrap_or_default(),
                                    );
                                    match classify(result.code) {
                                        ErrorClass::Corrupt => {
                                            tracing::warn!(
                                                target = target.0,
                                                chunk = %io.chunk_id,
                                                "replica served corrupt data, avoiding it"
                                            );
                                            suspects.push(target);
                                            last_error = Some(status);
                                            retry.push((chunk_index, io, dest));
                                        }
                                        ErrorClass::StaleRouting | ErrorClass::Transient => {
                                            last_error = Some(status);
                                            retry.push((chunk_index, io, dest));
                                        }
                                        ErrorClass::Permanent
                                            if result.code == StorageCode::CHUNK_NOT_FOUND =>
                                        {
                                            // Hole: leave zeros.
                                        }
                                        ErrorClass::Permanent => {
                                            return Err(ClientError::Status(status));
                                        }
                                    }
                                }
                            }
                        }
                        Err(ClientError::Status(status))
                            if !matches!(classify(status.code()), ErrorClass::Permanent) =>
                        {
                            last_error = Some(status);
                            retry.extend(batch);
                        }
                        Err(other) => return Err(other),
                    }
                }
            }

            if retry.is_empty() {
                return Ok(buffer);
            }

            let stale = last_error
                .as_ref()
                .is_some_and(|s| matches!(classify(s.code()), ErrorClass::StaleRouting));
            if stale {
                self.refresh_routing().await?;
            }
            match if stale { backoff.fast_wait() } else { backoff.next_wait() } {
                Some(wait) => tokio::time::sleep(wait).await,
                None => {
                    return Err(ClientError::RetryExhausted {
                        attempts: backoff.attempts(),
                        last: last_error.unwrap_or_else(|| Status::new(RPCCode::TIMEOUT)),
                    })
                }
            }
            pending = retry;
        }
    }

    // -- removeChunks -------------------------------------------------------

    /// Remove chunks of `inode` with indices in `[index_begin, index_end)`
    /// from every chain the layout touches. Idempotent by `request`.
    pub async fn remove_chunks(
        &self,
        request: Uuid,
        inode: InodeId,
        layout: &Layout,
        index_begin: u32,
        index_end: u32,
        max_remove: u32,
    ) -> ClientResult<(u32, bool)> {
        let routing = self.routing.get();
        let (begin, end) = ChunkId::file_range(inode, index_begin, index_end);

        // Every chain referenced by the layout may hold chunks of the range.
        let mut chains: Vec<ChainId> = Vec::new();
        for position in &layout.chain_slots {
            let chain_id = routing
                .resolve_chain_ref(layout.chain_table_id, *position)
                .ok_or_else(|| {
                    ClientError::RoutingIncomplete(format!(
                        "chain table {} has no position {}",
                        layout.chain_table_id, position
                    ))
                })?;
            if !chains.contains(&chain_id) {
                chains.push(chain_id);
            }
        }

        let mut removed = 0;
        let mut more = false;
        for chain_id in chains {
            let chain = routing.get_chain(chain_id).cloned().ok_or_else(|| {
                ClientError::RoutingIncomplete(format!("chain {} unknown", chain_id))
            })?;
            let head = chain.head().ok_or_else(|| {
                ClientError::RoutingIncomplete(format!("chain {} is empty", chain_id))
            })?;
            let node = self.node_of(&routing, head)?;
            let handle = self.node_handle(node)?;
            let _permit = handle.inflight.acquire().await;
            let rsp = handle
                .service
                .remove_chunks(RemoveChunksReq {
                    request_uuid: request,
                    chain_id,
                    chain_version: chain.version,
                    begin,
                    end,
                    max_remove,
                })
                .await
                .map_err(ClientError::Status)?;
            removed += rsp.removed;
            more |= rsp.more;
        }
        Ok((removed, more))
    }
}

/// Split write sub-ops into batches bounded by count and payload bytes.
fn split_batches(
    ios: Vec<(u32, WriteIo)>,
    max_size: usize,
    max_bytes: usize,
) -> Vec<Vec<(u32, WriteIo)>> {
    let mut batches = Vec::new();
    let mut current: Vec<(u32, WriteIo)> = Vec::new();
    let mut bytes = 0usize;
    for io in ios {
        let io_bytes = io.1.data.len();
        if !current.is_empty() && (current.len() >= max_size || bytes + io_bytes > max_bytes) {
            batches.push(std::mem::take(&mut current));
            bytes = 0;
        }
        bytes += io_bytes;
        current.push(io);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

fn split_read_batches(
    ios: Vec<(u32, ReadIo, usize)>,
    max_size: usize,
) -> Vec<Vec<(u32, ReadIo, usize)>> {
    let mut batches = Vec::new();
    for chunk in ios.chunks(max_size.max(1)) {
        batches.push(chunk.to_vec());
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flamefs_distributor::{Distributor, DistributorConfig};
    use flamefs_kv_backends::MemKvEngine;
    use flamefs_meta::service::NoopRemover;
    use flamefs_meta::{MetaConfig, MetaService, MetaServiceImpl};
    use flamefs_proto::common::{ChainTable, ReqBase, TargetInfo, UserInfo};
    use flamefs_proto::meta::{CreateReq, MkdirReq, OpenFlags, PathAt};
    use flamefs_storage::{ChunkEngine, MemChunkEngine, StorageConfig, StorageNode, StorageTarget};
    use flamefs_types::{ChainTableId, ChainVer, RoutingVersion};
    use parking_lot::Mutex;

    const MIB: u32 = 1 << 20;

    /// A full in-process storage plane: one node per chain replica column,
    /// chains wired head to tail.
    struct TestCluster {
        routing: RoutingHandle,
        nodes: Vec<Arc<StorageNode>>,
        targets: Vec<Arc<StorageTarget>>,
    }

    /// Build `chains` single-striped chains with `replicas` targets each.
    /// Target ids are `chain_index * 10 + replica`; node ids mirror them.
    fn build_cluster(chains: u32, replicas: u64) -> TestCluster {
        let mut info = RoutingInfo::default();
        info.routing_version = RoutingVersion(1);

        let mut chain_ids = Vec::new();
        for c in 0..chains {
            let chain_id = ChainId(100 + c);
            let target_ids: Vec<TargetId> =
                (0..replicas).map(|r| TargetId(c as u64 * 10 + r)).collect();
            info.chains
                .insert(chain_id, ChainInfo::new(chain_id, ChainVer(1), &target_ids));
            for &t in &target_ids {
                info.targets.insert(
                    t,
                    TargetInfo {
                        target_id: t,
                        node_id: NodeId(t.0 as u32),
                        disk_index: 0,
                        state: TargetState::Online,
                    },
                );
            }
            chain_ids.push(chain_id);
        }
        info.chain_tables.insert(
            ChainTableId(1),
            ChainTable {
                table_id: ChainTableId(1),
                version: 1,
                chains: chain_ids,
            },
        );

        let routing = RoutingHandle::new();
        routing.update(info).unwrap();

        let mut targets = Vec::new();
        let mut nodes = Vec::new();
        for c in 0..chains {
            for r in 0..replicas {
                let target_id = TargetId(c as u64 * 10 + r);
                let target = Arc::new(StorageTarget::new(
                    target_id,
                    StorageConfig::default(),
                    Arc::new(MemChunkEngine::new()),
                    Arc::new(routing.clone()) as Arc<dyn flamefs_proto::common::RoutingProvider>,
                ));
                let node = Arc::new(StorageNode::new(
                    NodeId(target_id.0 as u32),
                    Arc::new(routing.clone()) as Arc<dyn flamefs_proto::common::RoutingProvider>,
                ));
                node.add_target(Arc::clone(&target));
                targets.push(target);
                nodes.push(node);
            }
        }
        // Wire every target to every other for chain forwarding.
        for a in &targets {
            for b in &targets {
                if a.target_id() != b.target_id() {
                    a.add_peer(
                        b.target_id(),
                        Arc::clone(b) as Arc<dyn StorageService>,
                    );
                }
            }
        }

        TestCluster {
            routing,
            nodes,
            targets,
        }
    }

    fn make_client(cluster: &TestCluster) -> StorageClient {
        let client = StorageClient::new(
            StorageClientConfig::default(),
            Uuid::generate(),
            cluster.routing.clone(),
        );
        for node in &cluster.nodes {
            client.add_node(node.node_id(), Arc::clone(node) as Arc<dyn StorageService>);
        }
        client
    }

    fn striped_layout() -> Layout {
        let mut layout = Layout::new(ChainTableId(1), 1, MIB, 4, 0);
        layout.chain_slots = vec![0, 1, 2, 3];
        layout
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// A metadata server wired over the cluster's routing, so tests can
    /// obtain layouts the way real clients do: from create.
    async fn make_meta(cluster: &TestCluster) -> MetaServiceImpl<MemKvEngine> {
        let engine = Arc::new(MemKvEngine::new());
        let distributor = Arc::new(Distributor::new(
            Arc::clone(&engine),
            NodeId(1),
            DistributorConfig::default(),
        ));
        let meta = MetaServiceImpl::new(
            MetaConfig::default(),
            engine,
            distributor,
            Arc::new(cluster.routing.clone()),
            Arc::new(NoopRemover),
        );
        meta.start(Layout::new(ChainTableId(1), 1, MIB, 4, 0))
            .await
            .unwrap();
        meta
    }

    fn meta_base() -> ReqBase {
        ReqBase {
            user: UserInfo::root(),
            client: Uuid::generate(),
            request_uuid: Uuid::generate(),
            forward: false,
        }
    }

    // Striped write and read-back: create /d/f through the metadata plane,
    // write 4 MiB through the file's own layout, read back byte-for-byte,
    // and check chunk i landed on chain i.
    #[tokio::test]
    async fn test_striped_write_and_read_back() {
        let cluster = build_cluster(4, 2);
        let client = make_client(&cluster);

        // The layout is not hand-built: /d inherits the root layout at
        // mkdir, create freezes it into /d/f.
        let meta = make_meta(&cluster).await;
        meta.mkdir(MkdirReq {
            base: meta_base(),
            path: PathAt::root("d"),
            perm: 0o755,
            recursive: false,
            layout: None,
        })
        .await
        .unwrap();
        let created = meta
            .create(CreateReq {
                base: meta_base(),
                path: PathAt::root("d/f"),
                perm: 0o644,
                flags: OpenFlags(OpenFlags::O_CREAT | OpenFlags::O_RDWR),
                layout: None,
                session: None,
            })
            .await
            .unwrap();
        let inode = created.inode.id;
        let layout = created.inode.layout().unwrap().clone();

        // The inherited seed and the directory's first slot allocation give
        // the canonical placement: chunk 0 on slot 0, 1 on 1, and so on.
        assert_eq!(layout.seed, 0);
        assert_eq!(layout.stripe_size, 4);
        assert_eq!(layout.chain_slots, vec![0, 1, 2, 3]);

        let data = pattern(4 * MIB as usize);
        let written = client
            .write(inode, &layout, 0, &data, Uuid::generate())
            .await
            .unwrap();
        assert_eq!(written, 4 * MIB as u64);

        // A fresh client (reopen) reads the same bytes.
        let reader = make_client(&cluster);
        let read = reader.read(inode, &layout, 0, 4 * MIB as u64).await.unwrap();
        assert_eq!(read, data);

        // Chunk i landed on chain 100 + i: the head target of each chain
        // holds exactly that chunk.
        for i in 0..4u32 {
            let head = &cluster.targets[(i as usize) * 2];
            let chunk_meta = head
                .engine()
                .meta(ChunkId::for_file(inode, i))
                .unwrap()
                .expect("chunk present on its chain");
            assert_eq!(chunk_meta.length, MIB);
            for other in 0..4u32 {
                if other != i {
                    assert!(cluster.targets[(other as usize) * 2]
                        .engine()
                        .meta(ChunkId::for_file(inode, i))
                        .unwrap()
                        .is_none());
                }
            }
        }
    }

    #[tokio::test]
    async fn test_unaligned_write_spans_three_chunks() {
        let cluster = build_cluster(4, 1);
        let client = make_client(&cluster);
        let layout = striped_layout();
        let inode = InodeId(7);

        // offset chunk_size-1, length chunk_size+2: chunks 0, 1, 2.
        let data = pattern(MIB as usize + 2);
        let offset = MIB as u64 - 1;
        client
            .write(inode, &layout, offset, &data, Uuid::generate())
            .await
            .unwrap();

        let read = client
            .read(inode, &layout, offset, data.len() as u64)
            .await
            .unwrap();
        assert_eq!(read, data);

        for i in 0..3u32 {
            assert!(cluster.targets[i as usize]
                .engine()
                .meta(ChunkId::for_file(inode, i))
                .unwrap()
                .is_some());
        }
        assert!(cluster.targets[3]
            .engine()
            .meta(ChunkId::for_file(inode, 3))
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_read_of_hole_returns_zeros() {
        let cluster = build_cluster(4, 1);
        let client = make_client(&cluster);
        let layout = striped_layout();
        let read = client
            .read(InodeId(5), &layout, 0, 4096)
            .await
            .unwrap();
        assert_eq!(read, vec![0u8; 4096]);
    }

    #[tokio::test]
    async fn test_write_replay_is_idempotent() {
        let cluster = build_cluster(1, 2);
        let client = make_client(&cluster);
        let mut layout = Layout::new(ChainTableId(1), 1, MIB, 1, 0);
        layout.chain_slots = vec![0];
        let inode = InodeId(9);
        let request = Uuid::generate();

        client
            .write(inode, &layout, 0, b"payload", request)
            .await
            .unwrap();
        client
            .write(inode, &layout, 0, b"payload", request)
            .await
            .unwrap();

        // Replay committed nothing new.
        let meta = cluster.targets[0]
            .engine()
            .meta(ChunkId::for_file(inode, 0))
            .unwrap()
            .unwrap();
        assert_eq!(meta.chunk_version, flamefs_types::ChunkVer(1));
    }

    /// Refresher that installs a prepared routing snapshot when poked.
    struct PendingRefresher {
        handle: RoutingHandle,
        next: Mutex<Option<RoutingInfo>>,
    }

    #[async_trait]
    impl RoutingRefresher for PendingRefresher {
        async fn refresh(&self) -> ClientResult<()> {
            if let Some(info) = self.next.lock().take() {
                self.handle.update(info)?;
            }
            Ok(())
        }
    }

    // Chain-head failure during write: routing advances the chain version,
    // the client refreshes and retries, the write lands and reads back with
    // the next chunk version.
    #[tokio::test]
    async fn test_head_failure_write_retries_after_rotation() {
        let cluster = build_cluster(1, 3);
        let mut layout = Layout::new(ChainTableId(1), 1, MIB, 1, 0);
        layout.chain_slots = vec![0];
        let inode = InodeId(11);

        let client = make_client(&cluster);
        // A first committed write establishes version 1.
        client
            .write(inode, &layout, 0, b"before-crash", Uuid::generate())
            .await
            .unwrap();

        // The head dies: the chain rotates (version 2) behind the client's
        // back. The client still holds version-1 routing.
        let rotated = {
            let mut info = (*cluster.routing.get()).clone();
            info.routing_version = RoutingVersion(2);
            let chain = info.chains.get(&ChainId(100)).unwrap().rotated(1);
            info.chains.insert(ChainId(100), chain);
            info
        };
        // Server side sees the rotation immediately; the client refreshes
        // into it on the version-mismatch retry.
        let stale = {
            let mut info = (*cluster.routing.get()).clone();
            info.routing_version = RoutingVersion(1);
            info
        };
        cluster.routing.update(rotated.clone()).unwrap();

        let client_routing = RoutingHandle::new();
        client_routing.update(stale).unwrap();
        let refresher = Arc::new(PendingRefresher {
            handle: client_routing.clone(),
            next: Mutex::new(Some(rotated)),
        });
        let client = {
            let c = StorageClient::new(
                StorageClientConfig::default(),
                Uuid::generate(),
                client_routing,
            )
            .with_refresher(refresher as Arc<dyn RoutingRefresher>);
            for node in &cluster.nodes {
                c.add_node(node.node_id(), Arc::clone(node) as Arc<dyn StorageService>);
            }
            c
        };

        let data = pattern(1024);
        let written = client
            .write(inode, &layout, 0, &data, Uuid::generate())
            .await
            .unwrap();
        assert_eq!(written, 1024);

        let read = client.read(inode, &layout, 0, 1024).await.unwrap();
        assert_eq!(read, data);

        // The committed version advanced exactly one past the pre-crash one.
        let meta = cluster.targets[1]
            .engine()
            .meta(ChunkId::for_file(inode, 0))
            .unwrap()
            .unwrap();
        assert_eq!(meta.chunk_version, flamefs_types::ChunkVer(2));
    }

    #[tokio::test]
    async fn test_read_selection_modes() {
        for selection in [
            ReadSelection::Head,
            ReadSelection::Tail,
            ReadSelection::RoundRobin,
            ReadSelection::Random,
        ] {
            let cluster = build_cluster(1, 3);
            let mut layout = Layout::new(ChainTableId(1), 1, MIB, 1, 0);
            layout.chain_slots = vec![0];

            let client = StorageClient::new(
                StorageClientConfig {
                    read_selection: selection,
                    ..Default::default()
                },
                Uuid::generate(),
                cluster.routing.clone(),
            );
            for node in &cluster.nodes {
                client.add_node(node.node_id(), Arc::clone(node) as Arc<dyn StorageService>);
            }

            let inode = InodeId(77);
            client
                .write(inode, &layout, 0, b"any-replica", Uuid::generate())
                .await
                .unwrap();
            for _ in 0..4 {
                let read = client.read(inode, &layout, 0, 11).await.unwrap();
                assert_eq!(read, b"any-replica");
            }
        }
    }

    #[tokio::test]
    async fn test_offline_replica_not_selected_for_reads() {
        let cluster = build_cluster(1, 3);
        let mut layout = Layout::new(ChainTableId(1), 1, MIB, 1, 0);
        layout.chain_slots = vec![0];
        let inode = InodeId(12);

        let client = make_client(&cluster);
        client
            .write(inode, &layout, 0, b"stays-readable", Uuid::generate())
            .await
            .unwrap();

        // Mark the tail offline; reads in every mode must avoid it.
        let mut info = (*cluster.routing.get()).clone();
        info.routing_version = RoutingVersion(2);
        info.targets.get_mut(&TargetId(2)).unwrap().state = TargetState::Offline;
        cluster.routing.update(info).unwrap();

        let reader = StorageClient::new(
            StorageClientConfig {
                read_selection: ReadSelection::Tail,
                ..Default::default()
            },
            Uuid::generate(),
            cluster.routing.clone(),
        );
        for node in &cluster.nodes {
            reader.add_node(node.node_id(), Arc::clone(node) as Arc<dyn StorageService>);
        }
        let read = reader.read(inode, &layout, 0, 14).await.unwrap();
        assert_eq!(read, b"stays-readable");
    }

    #[tokio::test]
    async fn test_remove_chunks_via_client() {
        let cluster = build_cluster(4, 2);
        let client = make_client(&cluster);
        let layout = striped_layout();
        let inode = InodeId(13);

        let data = pattern(4 * MIB as usize);
        client
            .write(inode, &layout, 0, &data, Uuid::generate())
            .await
            .unwrap();

        let (removed, more) = client
            .remove_chunks(Uuid::generate(), inode, &layout, 0, 4, 64)
            .await
            .unwrap();
        assert_eq!(removed, 4);
        assert!(!more);

        // Everything reads back as holes now.
        let read = client.read(inode, &layout, 0, 4096).await.unwrap();
        assert_eq!(read, vec![0u8; 4096]);
    }

    #[test]
    fn test_split_batches_bounds() {
        let io = |bytes: usize| {
            (
                0u32,
                WriteIo {
                    chunk_id: ChunkId::for_file(InodeId(1), 0),
                    offset: 0,
                    data: vec![0; bytes],
                    chunk_size: MIB,
                    update_id: UpdateId::default(),
                },
            )
        };
        // Count bound.
        let batches = split_batches(vec![io(1), io(1), io(1)], 2, usize::MAX);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);

        // Byte bound.
        let batches = split_batches(vec![io(600), io(600), io(100)], 10, 1000);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[1].len(), 2);

        // One oversized io still ships alone.
        let batches = split_batches(vec![io(5000)], 10, 1000);
        assert_eq!(batches.len(), 1);
    }
}

//! The metadata service: authentication, owner routing with single-hop
//! forwarding, per-inode batching and transactional execution of every
//! operation.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use flamefs_distributor::Distributor;
use flamefs_kv::{with_rw_txn_retry, KvEngine, ReadOnlyTransaction, ReadWriteTransaction};
use flamefs_layout::Layout;
use flamefs_proto::common::{RoutingInfo, TargetState, UserInfo, UserRecord};
use flamefs_proto::meta::*;
use flamefs_schema as schema;
use flamefs_types::{
    make_error, make_error_msg, InodeId, MetaCode, NodeId, Result, Status, StatusCode, Uuid,
};

use crate::batch::InodeBatons;
use crate::config::MetaConfig;
use crate::inode::{AccessType, Inode};
use crate::ops;
use crate::session::FileSession;
use crate::store::MetaStore;

pub use crate::gc::ChunkRemover;
pub use flamefs_proto::common::{RoutingProvider as RoutingSource, StaticRouting};

/// A remover for metadata-only deployments: pretends the requested chunks
/// are gone, honoring the per-pass cap.
pub struct NoopRemover;

#[async_trait]
impl ChunkRemover for NoopRemover {
    async fn remove_chunks(
        &self,
        _inode: InodeId,
        _layout: &Layout,
        index_begin: u32,
        index_end: u32,
        max_remove: u32,
        _request: Uuid,
    ) -> Result<(u32, bool)> {
        let span = index_end.saturating_sub(index_begin);
        let removed = span.min(max_remove);
        Ok((removed, removed < span))
    }
}

/// All metadata operations.
#[async_trait]
pub trait MetaService: Send + Sync {
    async fn stat(&self, req: StatReq) -> Result<StatRsp>;
    async fn batch_stat(&self, req: BatchStatReq) -> Result<BatchStatRsp>;
    async fn create(&self, req: CreateReq) -> Result<CreateRsp>;
    async fn open(&self, req: OpenReq) -> Result<OpenRsp>;
    async fn close(&self, req: CloseReq) -> Result<CloseRsp>;
    async fn sync(&self, req: SyncReq) -> Result<SyncRsp>;
    async fn mkdir(&self, req: MkdirReq) -> Result<MkdirRsp>;
    async fn list(&self, req: ListReq) -> Result<ListRsp>;
    async fn remove(&self, req: RemoveReq) -> Result<RemoveRsp>;
    async fn rename(&self, req: RenameReq) -> Result<RenameRsp>;
    async fn symlink(&self, req: SymlinkReq) -> Result<SymlinkRsp>;
    async fn hard_link(&self, req: HardLinkReq) -> Result<HardLinkRsp>;
    async fn set_attr(&self, req: SetAttrReq) -> Result<SetAttrRsp>;
    async fn truncate(&self, req: TruncateReq) -> Result<TruncateRsp>;
    async fn stat_fs(&self, req: StatFsReq) -> Result<StatFsRsp>;
    async fn set_layout(&self, req: SetLayoutReq) -> Result<SetLayoutRsp>;
    async fn get_real_path(&self, req: GetRealPathReq) -> Result<GetRealPathRsp>;
    async fn extend_session(&self, req: ExtendSessionReq) -> Result<ExtendSessionRsp>;
    async fn prune_session(&self, req: PruneSessionReq) -> Result<PruneSessionRsp>;
}

enum Routed {
    Local,
    Forward(Arc<dyn MetaService>),
}

/// Concrete metadata service over a KV engine.
pub struct MetaServiceImpl<E: KvEngine> {
    engine: Arc<E>,
    store: MetaStore<E>,
    batons: InodeBatons,
    distributor: Arc<Distributor<E>>,
    routing: Arc<dyn RoutingSource>,
    remover: Arc<dyn ChunkRemover>,
    peers: DashMap<NodeId, Arc<dyn MetaService>>,
}

impl<E: KvEngine + 'static> MetaServiceImpl<E>
where
    E::RoTxn: Send + Sync,
    E::RwTxn: Send + Sync,
{
    pub fn new(
        config: MetaConfig,
        engine: Arc<E>,
        distributor: Arc<Distributor<E>>,
        routing: Arc<dyn RoutingSource>,
        remover: Arc<dyn ChunkRemover>,
    ) -> Self {
        let node_id = distributor.node_id();
        let store = MetaStore::new(config, Arc::clone(&engine), node_id);
        Self {
            engine,
            store,
            batons: InodeBatons::new(),
            distributor,
            routing,
            remover,
            peers: DashMap::new(),
        }
    }

    /// Join the meta cluster and bootstrap the filesystem roots.
    pub async fn start(&self, root_layout: Layout) -> Result<()> {
        self.distributor.start().await?;
        let mut txn = self.engine.create_readwrite_transaction();
        self.store.init_fs(&mut txn, root_layout).await?;
        txn.commit().await
    }

    /// Register another metadata server for request forwarding.
    pub fn add_peer(&self, node: NodeId, service: Arc<dyn MetaService>) {
        self.peers.insert(node, service);
    }

    pub fn store(&self) -> &MetaStore<E> {
        &self.store
    }

    /// Register a user record for token authentication.
    pub async fn add_user(&self, record: &UserRecord) -> Result<()> {
        let mut txn = self.engine.create_readwrite_transaction();
        let raw = serde_json::to_vec(record).map_err(|e| {
            Status::with_message(StatusCode::DATA_CORRUPTION, format!("user record: {}", e))
        })?;
        txn.set(&schema::user_key(&record.uid.to_string()), &raw)
            .await?;
        txn.commit().await
    }

    async fn authenticate(&self, user: &UserInfo) -> Result<()> {
        if !self.store.config().authenticate {
            return Ok(());
        }
        let txn = self.engine.create_readonly_transaction();
        let raw = txn
            .snapshot_get(&schema::user_key(&user.uid.to_string()))
            .await?
            .ok_or_else(|| Status::new(StatusCode::AUTHENTICATION_FAIL))?;
        let record: UserRecord = serde_json::from_slice(&raw).map_err(|e| {
            Status::with_message(StatusCode::DATA_CORRUPTION, format!("user record: {}", e))
        })?;
        if record.token != user.token {
            return make_error(StatusCode::TOKEN_MISMATCH);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.store.config().readonly {
            return make_error_msg(StatusCode::READ_ONLY_MODE, "metadata plane is read-only");
        }
        Ok(())
    }

    /// Pick where a request keyed by `owner` runs: locally, or forwarded
    /// once to the responsible server. An already-forwarded request never
    /// hops again.
    fn route(&self, owner: InodeId, already_forwarded: bool) -> Result<Routed> {
        if self.distributor.is_responsible(owner) {
            return Ok(Routed::Local);
        }
        if already_forwarded {
            return make_error_msg(
                MetaCode::NOT_LOCAL,
                format!(
                    "forwarded request for inode {} landed on the wrong server",
                    owner
                ),
            );
        }
        let responsible = self
            .distributor
            .responsible_server(owner)
            .ok_or_else(|| Status::with_message(MetaCode::BUSY, "no active metadata servers"))?;
        match self.peers.get(&responsible) {
            Some(peer) => Ok(Routed::Forward(Arc::clone(&peer))),
            None => make_error_msg(
                MetaCode::FORWARD_FAILED,
                format!("no connection to metadata server {}", responsible),
            ),
        }
    }

    fn routing_snapshot(&self) -> Arc<RoutingInfo> {
        self.routing.routing()
    }

    fn shared_config(&self) -> Arc<MetaConfig> {
        Arc::new(self.store.config().clone())
    }

    /// Run one mutating operation: baton on the owner inode, then a retried
    /// transaction carrying the ownership check and the idempotency record.
    async fn run_mutation<R, F>(
        &self,
        owner: InodeId,
        request: Uuid,
        op_tag: &'static str,
        body: F,
    ) -> Result<R>
    where
        R: serde::Serialize + serde::de::DeserializeOwned + Send + Sync,
        F: for<'t> Fn(&'t mut E::RwTxn) -> flamefs_kv::TxnFuture<'t, R> + Send + Sync + 'static,
    {
        let _baton = self.batons.lock(owner).await;
        self.run_txn(owner, request, op_tag, body).await
    }

    /// The transactional part of `run_mutation`, baton-free so rename can
    /// hold two batons around it.
    async fn run_txn<R, F>(
        &self,
        owner: InodeId,
        request: Uuid,
        op_tag: &'static str,
        body: F,
    ) -> Result<R>
    where
        R: serde::Serialize + serde::de::DeserializeOwned + Send + Sync,
        F: for<'t> Fn(&'t mut E::RwTxn) -> flamefs_kv::TxnFuture<'t, R> + Send + Sync + 'static,
    {
        let body = Arc::new(body);
        let distributor = Arc::clone(&self.distributor);

        with_rw_txn_retry(
            &*self.engine,
            &self.store.config().retry,
            true,
            move |txn| {
                let body = Arc::clone(&body);
                let distributor = Arc::clone(&distributor);
                Box::pin(async move {
                    distributor.check_ownership(txn, owner).await?;
                    if let Some(cached) =
                        crate::idempotent::load::<E::RwTxn, R>(txn, request, op_tag).await?
                    {
                        return Ok(cached);
                    }
                    let result = (*body)(txn).await?;
                    crate::idempotent::store(txn, request, op_tag, &result).await?;
                    Ok(result)
                })
            },
        )
        .await
    }
}

#[async_trait]
impl<E: KvEngine + 'static> MetaService for MetaServiceImpl<E>
where
    E::RoTxn: Send + Sync,
    E::RwTxn: Send + Sync,
{
    async fn stat(&self, req: StatReq) -> Result<StatRsp> {
        self.authenticate(&req.base.user).await?;
        let txn = self.engine.create_readonly_transaction();
        ops::stat::stat(&txn, self.store.config(), &req).await
    }

    async fn batch_stat(&self, req: BatchStatReq) -> Result<BatchStatRsp> {
        self.authenticate(&req.base.user).await?;
        let txn = self.engine.create_readonly_transaction();
        ops::stat::batch_stat(&txn, &req).await
    }

    async fn create(&self, mut req: CreateReq) -> Result<CreateRsp> {
        self.check_writable()?;
        self.authenticate(&req.base.user).await?;
        ops::create::validate_flags(&req)?;

        let owner = ops::stat::normalize_parent(req.path.parent);
        if let Routed::Forward(peer) = self.route(owner, req.base.forward)? {
            req.base.forward = true;
            return peer.create(req).await;
        }

        let request = req.base.request_uuid;
        let ctx = Arc::new(ops::create::CreateCtx {
            now_ns: self.store.now_ns(),
            new_id: self.store.alloc_inode_id().await?,
            routing: self.routing_snapshot(),
        });
        let config = self.shared_config();
        let req = Arc::new(req);
        self.run_mutation(owner, request, "create", move |txn| {
            let req = Arc::clone(&req);
            let ctx = Arc::clone(&ctx);
            let config = Arc::clone(&config);
            Box::pin(async move { ops::create::create(txn, &config, &req, &ctx).await })
        })
        .await
    }

    async fn open(&self, mut req: OpenReq) -> Result<OpenRsp> {
        self.authenticate(&req.base.user).await?;

        let owner = ops::stat::normalize_parent(req.path.parent);
        if let Routed::Forward(peer) = self.route(owner, req.base.forward)? {
            req.base.forward = true;
            return peer.open(req).await;
        }

        let request = req.base.request_uuid;
        let config = self.shared_config();
        let req = Arc::new(req);
        self.run_mutation(owner, request, "open", move |txn| {
            let req = Arc::clone(&req);
            let config = Arc::clone(&config);
            Box::pin(async move { ops::open::open(txn, &config, &req).await })
        })
        .await
    }

    async fn close(&self, mut req: CloseReq) -> Result<CloseRsp> {
        self.check_writable()?;
        self.authenticate(&req.base.user).await?;

        if let Routed::Forward(peer) = self.route(req.inode, req.base.forward)? {
            req.base.forward = true;
            return peer.close(req).await;
        }

        let request = req.base.request_uuid;
        let now_ns = self.store.now_ns();
        let req = Arc::new(req);
        self.run_mutation(req.inode, request, "close", move |txn| {
            let req = Arc::clone(&req);
            Box::pin(async move {
                let mut inode = Inode::load_required(txn, req.inode).await?;

                if let Some(session) = FileSession::load(txn, req.inode, req.session).await? {
                    session.remove(txn).await?;
                }

                if let Some(length) = req.length {
                    if let InodeData::File {
                        length: current, ..
                    } = &mut inode.record.data
                    {
                        // Writers only ever extend; truncate owns shrinking.
                        if length > *current {
                            *current = length;
                        }
                    }
                }
                if req.update_mtime {
                    inode.record.mtime_ns = now_ns;
                }
                inode.record.atime_ns = now_ns;
                inode.store(txn).await?;

                // Last name and last writer gone: hand the file to GC.
                if inode.record.nlink == 0 && !FileSession::any_open(txn, req.inode).await? {
                    crate::gc::enqueue(txn, &inode).await?;
                }

                Ok(CloseRsp {
                    inode: inode.record,
                })
            })
        })
        .await
    }

    async fn sync(&self, mut req: SyncReq) -> Result<SyncRsp> {
        self.check_writable()?;
        self.authenticate(&req.base.user).await?;

        if let Routed::Forward(peer) = self.route(req.inode, req.base.forward)? {
            req.base.forward = true;
            return peer.sync(req).await;
        }

        let request = req.base.request_uuid;
        let now_ns = self.store.now_ns();
        let req = Arc::new(req);
        self.run_mutation(req.inode, request, "sync", move |txn| {
            let req = Arc::clone(&req);
            Box::pin(async move {
                let mut inode = Inode::load_required(txn, req.inode).await?;
                if !inode.is_file() {
                    return make_error(MetaCode::NOT_FILE);
                }
                if let (
                    Some(length),
                    InodeData::File {
                        length: current, ..
                    },
                ) = (req.length, &mut inode.record.data)
                {
                    if length > *current {
                        *current = length;
                    }
                }
                if req.update_mtime {
                    inode.record.mtime_ns = now_ns;
                }
                inode.store(txn).await?;
                Ok(SyncRsp {
                    inode: inode.record,
                })
            })
        })
        .await
    }

    async fn mkdir(&self, mut req: MkdirReq) -> Result<MkdirRsp> {
        self.check_writable()?;
        self.authenticate(&req.base.user).await?;

        let owner = ops::stat::normalize_parent(req.path.parent);
        if let Routed::Forward(peer) = self.route(owner, req.base.forward)? {
            req.base.forward = true;
            return peer.mkdir(req).await;
        }

        let component_count = req
            .path
            .path
            .as_deref()
            .map(|p| p.split('/').filter(|c| !c.is_empty()).count())
            .unwrap_or(0);
        let mut new_ids = Vec::with_capacity(component_count);
        for _ in 0..component_count {
            new_ids.push(self.store.alloc_inode_id().await?);
        }

        let request = req.base.request_uuid;
        let ctx = Arc::new(ops::mkdir::MkdirCtx {
            now_ns: self.store.now_ns(),
            new_ids,
        });
        let config = self.shared_config();
        let req = Arc::new(req);
        self.run_mutation(owner, request, "mkdir", move |txn| {
            let req = Arc::clone(&req);
            let ctx = Arc::clone(&ctx);
            let config = Arc::clone(&config);
            Box::pin(async move { ops::mkdir::mkdir(txn, &config, &req, &ctx).await })
        })
        .await
    }

    async fn list(&self, req: ListReq) -> Result<ListRsp> {
        self.authenticate(&req.base.user).await?;
        let txn = self.engine.create_readonly_transaction();
        ops::list::list(&txn, self.store.config(), &req).await
    }

    async fn remove(&self, mut req: RemoveReq) -> Result<RemoveRsp> {
        self.check_writable()?;
        self.authenticate(&req.base.user).await?;

        let owner = ops::stat::normalize_parent(req.path.parent);
        if let Routed::Forward(peer) = self.route(owner, req.base.forward)? {
            req.base.forward = true;
            return peer.remove(req).await;
        }

        let request = req.base.request_uuid;
        let config = self.shared_config();
        let req = Arc::new(req);
        self.run_mutation(owner, request, "remove", move |txn| {
            let req = Arc::clone(&req);
            let config = Arc::clone(&config);
            Box::pin(async move { ops::remove::remove(txn, &config, &req).await })
        })
        .await
    }

    async fn rename(&self, mut req: RenameReq) -> Result<RenameRsp> {
        self.check_writable()?;
        self.authenticate(&req.base.user).await?;

        let src_owner = ops::stat::normalize_parent(req.src.parent);
        let dest_owner = ops::stat::normalize_parent(req.dest.parent);
        if let Routed::Forward(peer) = self.route(src_owner, req.base.forward)? {
            req.base.forward = true;
            return peer.rename(req).await;
        }

        // Both parents' batons in deterministic order, then one transaction
        // across both directories.
        let _guards = self.batons.lock_pair(src_owner, dest_owner).await;

        let request = req.base.request_uuid;
        let now_ns = self.store.now_ns();
        let config = self.shared_config();
        let req = Arc::new(req);
        self.run_txn(src_owner, request, "rename", move |txn| {
            let req = Arc::clone(&req);
            let config = Arc::clone(&config);
            Box::pin(async move { ops::rename::rename(txn, &config, &req, now_ns).await })
        })
        .await
    }

    async fn symlink(&self, mut req: SymlinkReq) -> Result<SymlinkRsp> {
        self.check_writable()?;
        self.authenticate(&req.base.user).await?;

        let owner = ops::stat::normalize_parent(req.path.parent);
        if let Routed::Forward(peer) = self.route(owner, req.base.forward)? {
            req.base.forward = true;
            return peer.symlink(req).await;
        }

        let request = req.base.request_uuid;
        let now_ns = self.store.now_ns();
        let new_id = self.store.alloc_inode_id().await?;
        let config = self.shared_config();
        let req = Arc::new(req);
        self.run_mutation(owner, request, "symlink", move |txn| {
            let req = Arc::clone(&req);
            let config = Arc::clone(&config);
            Box::pin(async move { ops::symlink::symlink(txn, &config, &req, now_ns, new_id).await })
        })
        .await
    }

    async fn hard_link(&self, mut req: HardLinkReq) -> Result<HardLinkRsp> {
        self.check_writable()?;
        self.authenticate(&req.base.user).await?;

        let owner = ops::stat::normalize_parent(req.new_path.parent);
        if let Routed::Forward(peer) = self.route(owner, req.base.forward)? {
            req.base.forward = true;
            return peer.hard_link(req).await;
        }

        let request = req.base.request_uuid;
        let now_ns = self.store.now_ns();
        let config = self.shared_config();
        let req = Arc::new(req);
        self.run_mutation(owner, request, "hard_link", move |txn| {
            let req = Arc::clone(&req);
            let config = Arc::clone(&config);
            Box::pin(async move { ops::link::hard_link(txn, &config, &req, now_ns).await })
        })
        .await
    }

    async fn set_attr(&self, mut req: SetAttrReq) -> Result<SetAttrRsp> {
        self.check_writable()?;
        self.authenticate(&req.base.user).await?;

        let owner = ops::stat::normalize_parent(req.path.parent);
        if let Routed::Forward(peer) = self.route(owner, req.base.forward)? {
            req.base.forward = true;
            return peer.set_attr(req).await;
        }

        let request = req.base.request_uuid;
        let now_ns = self.store.now_ns();
        let config = self.shared_config();
        let req = Arc::new(req);
        self.run_mutation(owner, request, "set_attr", move |txn| {
            let req = Arc::clone(&req);
            let config = Arc::clone(&config);
            Box::pin(async move { ops::set_attr::set_attr(txn, &config, &req, now_ns).await })
        })
        .await
    }

    async fn truncate(&self, mut req: TruncateReq) -> Result<TruncateRsp> {
        self.check_writable()?;
        self.authenticate(&req.base.user).await?;

        if let Routed::Forward(peer) = self.route(req.inode, req.base.forward)? {
            req.base.forward = true;
            return peer.truncate(req).await;
        }

        // Phase one, outside the transaction: remove freed chunks through
        // the storage plane, capped per request and idempotent by uuid.
        let snapshot = {
            let txn = self.engine.create_readonly_transaction();
            Inode::snapshot_load(&txn, req.inode)
                .await?
                .ok_or_else(|| Status::new(MetaCode::NOT_FOUND))?
        };
        if !snapshot.is_file() {
            return make_error(MetaCode::NOT_FILE);
        }
        snapshot.check_permission(&req.base.user, AccessType::Write)?;

        let (mut chunks_removed, mut more) = (0u32, false);
        if let InodeData::File { layout, length, .. } = &snapshot.record.data {
            if let Some((first_removed, end)) = layout.truncate_range(*length, req.length) {
                let (removed, has_more) = self
                    .remover
                    .remove_chunks(
                        req.inode,
                        layout,
                        first_removed,
                        end,
                        self.store.config().remove_chunks_batch_size,
                        req.base.request_uuid,
                    )
                    .await?;
                chunks_removed = removed;
                more = has_more;
            }
        }
        if more {
            // The caller re-issues with the same uuid until finished.
            return Ok(TruncateRsp {
                inode: snapshot.record,
                chunks_removed,
                finished: false,
            });
        }

        // Phase two: commit the new length.
        let request = req.base.request_uuid;
        let now_ns = self.store.now_ns();
        let req = Arc::new(req);
        let inode = self
            .run_mutation(req.inode, request, "truncate", move |txn| {
                let req = Arc::clone(&req);
                Box::pin(async move {
                    let mut inode = Inode::load_required(txn, req.inode).await?;
                    if !inode.is_file() {
                        return make_error(MetaCode::NOT_FILE);
                    }
                    if let InodeData::File {
                        length,
                        truncate_version,
                        ..
                    } = &mut inode.record.data
                    {
                        if req.length < *length {
                            *truncate_version += 1;
                        }
                        *length = req.length;
                    }
                    inode.record.mtime_ns = now_ns;
                    inode.record.ctime_ns = now_ns;
                    inode.add_read_conflict(txn).await?;
                    inode.store(txn).await?;
                    Ok(inode.record)
                })
            })
            .await?;

        Ok(TruncateRsp {
            inode,
            chunks_removed,
            finished: true,
        })
    }

    async fn stat_fs(&self, req: StatFsReq) -> Result<StatFsRsp> {
        self.authenticate(&req.base.user).await?;
        // Aggregated from routing, not transactional.
        let routing = self.routing_snapshot();
        let online = routing
            .targets
            .values()
            .filter(|t| t.state == TargetState::Online)
            .count() as u64;
        let capacity = online * self.store.config().target_capacity;
        Ok(StatFsRsp {
            capacity,
            used: 0,
            free: capacity,
        })
    }

    async fn set_layout(&self, mut req: SetLayoutReq) -> Result<SetLayoutRsp> {
        self.check_writable()?;
        self.authenticate(&req.base.user).await?;

        let owner = ops::stat::normalize_parent(req.path.parent);
        if let Routed::Forward(peer) = self.route(owner, req.base.forward)? {
            req.base.forward = true;
            return peer.set_layout(req).await;
        }

        let request = req.base.request_uuid;
        let now_ns = self.store.now_ns();
        let routing = self.routing_snapshot();
        let config = self.shared_config();
        let req = Arc::new(req);
        self.run_mutation(owner, request, "set_layout", move |txn| {
            let req = Arc::clone(&req);
            let config = Arc::clone(&config);
            let routing = Arc::clone(&routing);
            Box::pin(async move {
                ops::set_attr::set_layout(txn, &config, &req, &routing, now_ns).await
            })
        })
        .await
    }

    async fn get_real_path(&self, req: GetRealPathReq) -> Result<GetRealPathRsp> {
        self.authenticate(&req.base.user).await?;
        let txn = self.engine.create_readonly_transaction();
        let parent = ops::stat::normalize_parent(req.path.parent);
        let config = self.store.config();

        let mut resolver = crate::path_resolve::PathResolver::new(
            &txn,
            &req.base.user,
            config.max_symlink_count,
            config.max_symlink_depth,
        );
        let path = req.path.path.as_deref().unwrap_or("");
        let resolved = resolver.resolve(parent, path, true).await?;

        let real = match &resolved.dir_entry {
            None if resolved.leaf_name.is_empty() => {
                resolver.real_path_of_dir(resolved.parent_id).await?
            }
            None => return make_error(MetaCode::NOT_FOUND),
            Some(entry) if entry.is_directory() => {
                resolver.real_path_of_dir(entry.inode_id()).await?
            }
            Some(entry) => {
                let dir = resolver.real_path_of_dir(resolved.parent_id).await?;
                if dir == "/" {
                    format!("/{}", entry.name())
                } else {
                    format!("{}/{}", dir, entry.name())
                }
            }
        };
        Ok(GetRealPathRsp { path: real })
    }

    async fn extend_session(&self, mut req: ExtendSessionReq) -> Result<ExtendSessionRsp> {
        self.check_writable()?;
        self.authenticate(&req.base.user).await?;

        if let Routed::Forward(peer) = self.route(req.inode, req.base.forward)? {
            req.base.forward = true;
            return peer.extend_session(req).await;
        }

        let request = req.base.request_uuid;
        let req = Arc::new(req);
        self.run_mutation(req.inode, request, "extend_session", move |txn| {
            let req = Arc::clone(&req);
            Box::pin(async move {
                let mut session = FileSession::load(txn, req.inode, req.session)
                    .await?
                    .ok_or_else(|| Status::new(MetaCode::NO_SESSION))?;
                session.record.access_time = flamefs_types::UtcTime::now();
                session.store(txn).await?;
                Ok(ExtendSessionRsp {})
            })
        })
        .await
    }

    async fn prune_session(&self, req: PruneSessionReq) -> Result<PruneSessionRsp> {
        self.check_writable()?;
        self.authenticate(&req.base.user).await?;

        let timeout = self.store.config().session_timeout;
        let mut pruned = 0u32;
        for target in &req.sessions {
            let mut txn = self.engine.create_readwrite_transaction();
            let Some(session) = FileSession::load(&mut txn, target.inode, target.session).await?
            else {
                continue;
            };
            // Only the owning client's stale sessions go.
            if session.record.client != req.client
                || !session.record.access_time.expired(timeout)
            {
                continue;
            }
            session.remove(&mut txn).await?;

            // The last session of an unlinked file sends it to GC.
            if let Some(inode) = Inode::snapshot_load(&txn, target.inode).await? {
                if inode.record.nlink == 0 && !FileSession::any_open(&txn, target.inode).await? {
                    crate::gc::enqueue(&mut txn, &inode).await?;
                }
            }
            txn.commit().await?;
            pruned += 1;
        }
        Ok(PruneSessionRsp { pruned })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flamefs_distributor::DistributorConfig;
    use flamefs_kv_backends::MemKvEngine;
    use flamefs_proto::common::{ChainTable, ReqBase};
    use flamefs_types::{ChainId, ChainTableId};

    fn root_layout() -> Layout {
        let mut l = Layout::new(ChainTableId(1), 1, 1 << 20, 4, 0);
        l.chain_slots = vec![0, 1, 2, 3];
        l
    }

    fn test_routing() -> Arc<RoutingInfo> {
        let mut routing = RoutingInfo::default();
        routing.chain_tables.insert(
            ChainTableId(1),
            ChainTable {
                table_id: ChainTableId(1),
                version: 1,
                chains: (0..4).map(|i| ChainId(100 + i)).collect(),
            },
        );
        Arc::new(routing)
    }

    async fn make_server(
        engine: &Arc<MemKvEngine>,
        node_id: u32,
    ) -> Arc<MetaServiceImpl<MemKvEngine>> {
        let distributor = Arc::new(Distributor::new(
            Arc::clone(engine),
            NodeId(node_id),
            DistributorConfig::default(),
        ));
        let svc = Arc::new(MetaServiceImpl::new(
            MetaConfig::default(),
            Arc::clone(engine),
            distributor,
            Arc::new(StaticRouting(test_routing())),
            Arc::new(NoopRemover),
        ));
        svc.start(root_layout()).await.unwrap();
        svc
    }

    async fn single_server() -> (Arc<MemKvEngine>, Arc<MetaServiceImpl<MemKvEngine>>) {
        let engine = Arc::new(MemKvEngine::new());
        let svc = make_server(&engine, 1).await;
        (engine, svc)
    }

    fn base() -> ReqBase {
        ReqBase {
            user: UserInfo::root(),
            client: Uuid::generate(),
            request_uuid: Uuid::generate(),
            forward: false,
        }
    }

    fn create_req(path: &str) -> CreateReq {
        CreateReq {
            base: base(),
            path: PathAt::root(path),
            perm: 0o644,
            flags: OpenFlags(OpenFlags::O_CREAT | OpenFlags::O_RDWR),
            layout: None,
            session: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_stat() {
        let (_engine, svc) = single_server().await;

        let created = svc.create(create_req("hello.txt")).await.unwrap();
        assert!(created.inode.is_file());
        assert_eq!(created.inode.nlink, 1);
        assert_eq!(created.inode.acl.perm, 0o644);
        assert!(!created.need_truncate);
        // Layout inherited from the root directory and striped.
        let layout = created.inode.layout().unwrap();
        assert_eq!(layout.stripe_size, 4);
        assert_eq!(layout.chain_slots.len(), 4);

        let stat = svc
            .stat(StatReq {
                base: base(),
                path: PathAt::root("hello.txt"),
                follow: true,
            })
            .await
            .unwrap();
        assert_eq!(stat.inode.id, created.inode.id);
    }

    #[tokio::test]
    async fn test_stat_missing() {
        let (_engine, svc) = single_server().await;
        let err = svc
            .stat(StatReq {
                base: base(),
                path: PathAt::root("ghost"),
                follow: true,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), MetaCode::NOT_FOUND);
    }

    // Two concurrent exclusive creates of the same name: exactly one wins.
    #[tokio::test]
    async fn test_concurrent_exclusive_create() {
        let (_engine, svc) = single_server().await;

        let mut handles = Vec::new();
        for _ in 0..2 {
            let svc = Arc::clone(&svc);
            handles.push(tokio::spawn(async move {
                let mut req = create_req("x");
                req.flags = OpenFlags(OpenFlags::O_CREAT | OpenFlags::O_EXCL);
                svc.create(req).await
            }));
        }
        let mut ok = 0;
        let mut exists = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(rsp) => {
                    ok += 1;
                    assert_eq!(rsp.inode.nlink, 1);
                }
                Err(e) if e.code() == MetaCode::EXISTS => exists += 1,
                Err(e) => panic!("unexpected error {}", e),
            }
        }
        assert_eq!((ok, exists), (1, 1));

        // The surviving inode answers stat.
        let stat = svc
            .stat(StatReq {
                base: base(),
                path: PathAt::root("x"),
                follow: true,
            })
            .await
            .unwrap();
        assert!(stat.inode.is_file());
    }

    // Replaying a create with the same request uuid returns the cached
    // result and applies nothing twice.
    #[tokio::test]
    async fn test_idempotent_create_replay() {
        let (_engine, svc) = single_server().await;

        let req = create_req("once.txt");
        let first = svc.create(req.clone()).await.unwrap();
        let second = svc.create(req).await.unwrap();
        assert_eq!(first.inode.id, second.inode.id);

        // Exactly one entry exists.
        let listing = svc
            .list(ListReq {
                base: base(),
                path: PathAt {
                    parent: InodeId::ROOT,
                    path: None,
                },
                prev: String::new(),
                limit: 100,
                status: false,
            })
            .await
            .unwrap();
        assert_eq!(listing.entries.len(), 1);
        assert_eq!(listing.entries[0].name, "once.txt");
    }

    #[tokio::test]
    async fn test_mkdir_and_nested_create() {
        let (_engine, svc) = single_server().await;

        let dir = svc
            .mkdir(MkdirReq {
                base: base(),
                path: PathAt::root("a/b/c"),
                perm: 0o755,
                recursive: true,
                layout: None,
            })
            .await
            .unwrap();
        assert!(dir.inode.is_directory());

        svc.create(create_req("a/b/c/file")).await.unwrap();
        let stat = svc
            .stat(StatReq {
                base: base(),
                path: PathAt::root("a/b/c/file"),
                follow: true,
            })
            .await
            .unwrap();
        assert!(stat.inode.is_file());

        // Non-recursive mkdir with missing intermediates fails.
        let err = svc
            .mkdir(MkdirReq {
                base: base(),
                path: PathAt::root("p/q"),
                perm: 0o755,
                recursive: false,
                layout: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), MetaCode::NOT_FOUND);
    }

    // Rename across directories: the entry moves atomically, nlink stays 1.
    #[tokio::test]
    async fn test_rename_across_directories() {
        let (_engine, svc) = single_server().await;

        svc.mkdir(MkdirReq {
            base: base(),
            path: PathAt::root("a"),
            perm: 0o755,
            recursive: false,
            layout: None,
        })
        .await
        .unwrap();
        svc.mkdir(MkdirReq {
            base: base(),
            path: PathAt::root("b"),
            perm: 0o755,
            recursive: false,
            layout: None,
        })
        .await
        .unwrap();
        let created = svc.create(create_req("a/f")).await.unwrap();

        let renamed = svc
            .rename(RenameReq {
                base: base(),
                src: PathAt::root("a/f"),
                dest: PathAt::root("b/f"),
            })
            .await
            .unwrap();
        assert_eq!(renamed.inode.as_ref().unwrap().id, created.inode.id);
        assert_eq!(renamed.inode.unwrap().nlink, 1);

        let list_a = svc
            .list(ListReq {
                base: base(),
                path: PathAt::root("a"),
                prev: String::new(),
                limit: 10,
                status: false,
            })
            .await
            .unwrap();
        assert!(list_a.entries.is_empty());

        let list_b = svc
            .list(ListReq {
                base: base(),
                path: PathAt::root("b"),
                prev: String::new(),
                limit: 10,
                status: false,
            })
            .await
            .unwrap();
        assert_eq!(list_b.entries.len(), 1);
        assert_eq!(list_b.entries[0].inode_id, created.inode.id);

        let stat = svc
            .stat(StatReq {
                base: base(),
                path: PathAt::root("b/f"),
                follow: true,
            })
            .await
            .unwrap();
        assert_eq!(stat.inode.nlink, 1);
    }

    #[tokio::test]
    async fn test_rename_onto_itself_is_noop() {
        let (_engine, svc) = single_server().await;
        let created = svc.create(create_req("same")).await.unwrap();
        let rsp = svc
            .rename(RenameReq {
                base: base(),
                src: PathAt::root("same"),
                dest: PathAt::root("same"),
            })
            .await
            .unwrap();
        assert_eq!(rsp.inode.unwrap().id, created.inode.id);
    }

    #[tokio::test]
    async fn test_remove_and_gc() {
        let (engine, svc) = single_server().await;
        let created = svc.create(create_req("doomed")).await.unwrap();

        svc.remove(RemoveReq {
            base: base(),
            path: PathAt::root("doomed"),
            recursive: false,
            expect_directory: Some(false),
        })
        .await
        .unwrap();

        // Gone from the namespace immediately.
        assert!(svc
            .stat(StatReq {
                base: base(),
                path: PathAt::root("doomed"),
                follow: true,
            })
            .await
            .is_err());

        // The GC worker erases the inode record.
        let worker = crate::gc::GcWorker::new(
            Arc::clone(&engine),
            MetaConfig::default(),
            Arc::new(NoopRemover) as Arc<dyn ChunkRemover>,
        );
        // NoopRemover honors the cap, so large files may take passes.
        for _ in 0..4 {
            worker.run_once().await.unwrap();
        }
        let txn = engine.create_readonly_transaction();
        assert!(Inode::snapshot_load(&txn, created.inode.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_remove_open_file_deferred_to_close() {
        let (engine, svc) = single_server().await;
        let session = Uuid::generate();
        let mut req = create_req("held");
        req.session = Some(session);
        let created = svc.create(req).await.unwrap();

        svc.remove(RemoveReq {
            base: base(),
            path: PathAt::root("held"),
            recursive: false,
            expect_directory: Some(false),
        })
        .await
        .unwrap();

        // Still no GC queue entry: the session holds the inode.
        let txn = engine.create_readonly_transaction();
        assert!(txn
            .snapshot_get(&schema::gc_queue_key(created.inode.id))
            .await
            .unwrap()
            .is_none());
        drop(txn);

        svc.close(CloseReq {
            base: base(),
            inode: created.inode.id,
            session,
            length: Some(0),
            update_mtime: true,
        })
        .await
        .unwrap();

        // Close of the last session queued the inode.
        let txn = engine.create_readonly_transaction();
        assert!(txn
            .snapshot_get(&schema::gc_queue_key(created.inode.id))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_symlink_and_follow() {
        let (_engine, svc) = single_server().await;
        let target = svc.create(create_req("target")).await.unwrap();

        svc.symlink(SymlinkReq {
            base: base(),
            path: PathAt::root("link"),
            target: "target".into(),
        })
        .await
        .unwrap();

        let followed = svc
            .stat(StatReq {
                base: base(),
                path: PathAt::root("link"),
                follow: true,
            })
            .await
            .unwrap();
        assert_eq!(followed.inode.id, target.inode.id);

        let unfollowed = svc
            .stat(StatReq {
                base: base(),
                path: PathAt::root("link"),
                follow: false,
            })
            .await
            .unwrap();
        assert!(unfollowed.inode.is_symlink());
    }

    #[tokio::test]
    async fn test_hard_link_counts() {
        let (_engine, svc) = single_server().await;
        let created = svc.create(create_req("orig")).await.unwrap();

        let linked = svc
            .hard_link(HardLinkReq {
                base: base(),
                old_path: PathAt::root("orig"),
                new_path: PathAt::root("alias"),
            })
            .await
            .unwrap();
        assert_eq!(linked.inode.id, created.inode.id);
        assert_eq!(linked.inode.nlink, 2);

        // Removing one name decrements, the other still resolves.
        svc.remove(RemoveReq {
            base: base(),
            path: PathAt::root("orig"),
            recursive: false,
            expect_directory: Some(false),
        })
        .await
        .unwrap();
        let stat = svc
            .stat(StatReq {
                base: base(),
                path: PathAt::root("alias"),
                follow: true,
            })
            .await
            .unwrap();
        assert_eq!(stat.inode.nlink, 1);
    }

    #[tokio::test]
    async fn test_set_attr_permissions() {
        let (_engine, svc) = single_server().await;
        svc.create(create_req("attrs")).await.unwrap();

        let rsp = svc
            .set_attr(SetAttrReq {
                base: base(),
                path: PathAt::root("attrs"),
                perm: Some(0o600),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rsp.inode.acl.perm, 0o600);

        // A non-owner cannot chmod.
        let mut req = SetAttrReq {
            base: base(),
            path: PathAt::root("attrs"),
            perm: Some(0o777),
            ..Default::default()
        };
        req.base.user = UserInfo::new(1000, 1000);
        let err = svc.set_attr(req).await.unwrap_err();
        assert_eq!(err.code(), MetaCode::NO_PERMISSION);
    }

    #[tokio::test]
    async fn test_truncate_shrinks_and_versions() {
        let (_engine, svc) = single_server().await;
        let created = svc.create(create_req("big")).await.unwrap();

        // Grow through sync (the write path reports the new length).
        svc.sync(SyncReq {
            base: base(),
            inode: created.inode.id,
            length: Some(3 << 20),
            update_mtime: true,
        })
        .await
        .unwrap();

        let rsp = svc
            .truncate(TruncateReq {
                base: base(),
                inode: created.inode.id,
                length: 1 << 20,
            })
            .await
            .unwrap();
        assert!(rsp.finished);
        assert_eq!(rsp.inode.length(), 1 << 20);
        match rsp.inode.data {
            InodeData::File {
                truncate_version, ..
            } => assert_eq!(truncate_version, 1),
            _ => panic!("not a file"),
        }
    }

    #[tokio::test]
    async fn test_length_is_monotonic_under_sync() {
        let (_engine, svc) = single_server().await;
        let created = svc.create(create_req("mono")).await.unwrap();
        for len in [100u64, 50, 200, 150] {
            svc.sync(SyncReq {
                base: base(),
                inode: created.inode.id,
                length: Some(len),
                update_mtime: false,
            })
            .await
            .unwrap();
        }
        let stat = svc
            .stat(StatReq {
                base: base(),
                path: PathAt::root("mono"),
                follow: true,
            })
            .await
            .unwrap();
        // Stale smaller lengths never shrink the file.
        assert_eq!(stat.inode.length(), 200);
    }

    #[tokio::test]
    async fn test_list_pagination() {
        let (_engine, svc) = single_server().await;
        for i in 0..7 {
            svc.create(create_req(&format!("f{}", i))).await.unwrap();
        }

        let mut seen = Vec::new();
        let mut prev = String::new();
        loop {
            let page = svc
                .list(ListReq {
                    base: base(),
                    path: PathAt {
                        parent: InodeId::ROOT,
                        path: None,
                    },
                    prev: prev.clone(),
                    limit: 3,
                    status: true,
                })
                .await
                .unwrap();
            assert_eq!(page.entries.len(), page.inodes.len());
            for e in &page.entries {
                seen.push(e.name.clone());
            }
            if !page.more {
                break;
            }
            prev = page.entries.last().unwrap().name.clone();
        }
        assert_eq!(seen.len(), 7);
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted);
    }

    #[tokio::test]
    async fn test_readonly_mode() {
        let engine = Arc::new(MemKvEngine::new());
        let distributor = Arc::new(Distributor::new(
            Arc::clone(&engine),
            NodeId(1),
            DistributorConfig::default(),
        ));
        let svc = MetaServiceImpl::new(
            MetaConfig {
                readonly: true,
                ..Default::default()
            },
            Arc::clone(&engine),
            distributor,
            Arc::new(StaticRouting(test_routing())),
            Arc::new(NoopRemover),
        );
        let err = svc.create(create_req("nope")).await.unwrap_err();
        assert_eq!(err.code(), StatusCode::READ_ONLY_MODE);
    }

    #[tokio::test]
    async fn test_authentication() {
        let engine = Arc::new(MemKvEngine::new());
        let distributor = Arc::new(Distributor::new(
            Arc::clone(&engine),
            NodeId(1),
            DistributorConfig::default(),
        ));
        let svc = MetaServiceImpl::new(
            MetaConfig {
                authenticate: true,
                ..Default::default()
            },
            Arc::clone(&engine),
            distributor,
            Arc::new(StaticRouting(test_routing())),
            Arc::new(NoopRemover),
        );
        svc.start(root_layout()).await.unwrap();
        svc.add_user(&UserRecord {
            name: "root".into(),
            uid: flamefs_types::Uid(0),
            gid: flamefs_types::Gid(0),
            token: "secret".into(),
            is_admin: true,
        })
        .await
        .unwrap();

        let mut req = create_req("auth.txt");
        req.base.user.token = "wrong".into();
        let err = svc.create(req).await.unwrap_err();
        assert_eq!(err.code(), StatusCode::TOKEN_MISMATCH);

        let mut req = create_req("auth.txt");
        req.base.user.token = "secret".into();
        svc.create(req).await.unwrap();
    }

    // Requests landing on the wrong server forward exactly once.
    #[tokio::test]
    async fn test_forwarding_between_servers() {
        let engine = Arc::new(MemKvEngine::new());
        let a = make_server(&engine, 1).await;
        let b = make_server(&engine, 2).await;
        a.add_peer(NodeId(2), Arc::clone(&b) as Arc<dyn MetaService>);
        b.add_peer(NodeId(1), Arc::clone(&a) as Arc<dyn MetaService>);
        // Both caches see the full active set.
        a.distributor.tick().await.unwrap();
        b.distributor.tick().await.unwrap();

        let owner = a.distributor.responsible_server(InodeId::ROOT).unwrap();
        let wrong = if owner == NodeId(1) {
            Arc::clone(&b)
        } else {
            Arc::clone(&a)
        };

        // The wrong server forwards and the create still lands.
        let rsp = wrong.create(create_req("routed.txt")).await.unwrap();
        assert!(rsp.inode.is_file());

        // A request that claims to be forwarded already is refused.
        let mut req = create_req("looped.txt");
        req.base.forward = true;
        let err = wrong.create(req).await.unwrap_err();
        assert_eq!(err.code(), MetaCode::NOT_LOCAL);
    }

    #[tokio::test]
    async fn test_get_real_path() {
        let (_engine, svc) = single_server().await;
        svc.mkdir(MkdirReq {
            base: base(),
            path: PathAt::root("x/y"),
            perm: 0o755,
            recursive: true,
            layout: None,
        })
        .await
        .unwrap();
        svc.create(create_req("x/y/f")).await.unwrap();

        let rsp = svc
            .get_real_path(GetRealPathReq {
                base: base(),
                path: PathAt::root("x/y/f"),
            })
            .await
            .unwrap();
        assert_eq!(rsp.path, "/x/y/f");

        let rsp = svc
            .get_real_path(GetRealPathReq {
                base: base(),
                path: PathAt::root("x/y"),
            })
            .await
            .unwrap();
        assert_eq!(rsp.path, "/x/y");
    }

    #[tokio::test]
    async fn test_sessions_extend_and_prune() {
        let engine = Arc::new(MemKvEngine::new());
        let distributor = Arc::new(Distributor::new(
            Arc::clone(&engine),
            NodeId(1),
            DistributorConfig::default(),
        ));
        let svc = MetaServiceImpl::new(
            MetaConfig {
                session_timeout: std::time::Duration::from_millis(0),
                ..Default::default()
            },
            Arc::clone(&engine),
            distributor,
            Arc::new(StaticRouting(test_routing())),
            Arc::new(NoopRemover),
        );
        svc.start(root_layout()).await.unwrap();

        let session = Uuid::generate();
        let client = Uuid::generate();
        let mut req = create_req("held");
        req.base.client = client;
        req.session = Some(session);
        let created = svc.create(req).await.unwrap();

        svc.extend_session(ExtendSessionReq {
            base: base(),
            inode: created.inode.id,
            session,
        })
        .await
        .unwrap();

        // With a zero timeout every session is stale and prunable.
        let rsp = svc
            .prune_session(PruneSessionReq {
                base: base(),
                client,
                sessions: vec![FileSessionRef {
                    inode: created.inode.id,
                    session,
                }],
            })
            .await
            .unwrap();
        assert_eq!(rsp.pruned, 1);

        // Extending the pruned session now fails.
        let err = svc
            .extend_session(ExtendSessionReq {
                base: base(),
                inode: created.inode.id,
                session,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), MetaCode::NO_SESSION);
    }

    #[tokio::test]
    async fn test_stat_fs_aggregates_routing() {
        let engine = Arc::new(MemKvEngine::new());
        let distributor = Arc::new(Distributor::new(
            Arc::clone(&engine),
            NodeId(1),
            DistributorConfig::default(),
        ));
        let mut routing = (*test_routing()).clone();
        for id in 0..3u64 {
            routing.targets.insert(
                flamefs_types::TargetId(id),
                flamefs_proto::common::TargetInfo {
                    target_id: flamefs_types::TargetId(id),
                    node_id: NodeId(1),
                    disk_index: id as u16,
                    state: if id == 2 {
                        TargetState::Offline
                    } else {
                        TargetState::Online
                    },
                },
            );
        }
        let config = MetaConfig::default();
        let per_target = config.target_capacity;
        let svc = MetaServiceImpl::new(
            config,
            Arc::clone(&engine),
            distributor,
            Arc::new(StaticRouting(Arc::new(routing))),
            Arc::new(NoopRemover),
        );
        svc.start(root_layout()).await.unwrap();

        let rsp = svc.stat_fs(StatFsReq { base: base() }).await.unwrap();
        assert_eq!(rsp.capacity, 2 * per_target);
    }
}

//! stat / batchStat: snapshot reads of inode metadata.

use flamefs_kv::ReadOnlyTransaction;
use flamefs_proto::meta::{BatchStatReq, BatchStatRsp, StatReq, StatRsp};
use flamefs_types::{make_error, InodeId, MetaCode, Result};

use crate::config::MetaConfig;
use crate::inode::Inode;
use crate::path_resolve::PathResolver;

pub async fn stat<T: ReadOnlyTransaction + ?Sized>(
    txn: &T,
    config: &MetaConfig,
    req: &StatReq,
) -> Result<StatRsp> {
    let parent = normalize_parent(req.path.parent);
    let inode = match req.path.path.as_deref() {
        Some(path) if !path.is_empty() => {
            let mut resolver = PathResolver::new(
                txn,
                &req.base.user,
                config.max_symlink_count,
                config.max_symlink_depth,
            );
            let resolved = resolver.resolve(parent, path, req.follow).await?;
            match resolved.dir_entry {
                Some(entry) => entry.snapshot_load_inode(txn).await?,
                None => return make_error(MetaCode::NOT_FOUND),
            }
        }
        _ => Inode::snapshot_load(txn, parent)
            .await?
            .ok_or_else(|| flamefs_types::Status::new(MetaCode::NOT_FOUND))?,
    };

    Ok(StatRsp {
        inode: inode.record,
    })
}

pub async fn batch_stat<T: ReadOnlyTransaction + ?Sized>(
    txn: &T,
    req: &BatchStatReq,
) -> Result<BatchStatRsp> {
    let mut inodes = Vec::with_capacity(req.inodes.len());
    for &id in &req.inodes {
        inodes.push(Inode::snapshot_load(txn, id).await?.map(|i| i.record));
    }
    Ok(BatchStatRsp { inodes })
}

pub(crate) fn normalize_parent(parent: InodeId) -> InodeId {
    if parent.0 == 0 {
        InodeId::ROOT
    } else {
        parent
    }
}

//! symlink: store a target path in a new inode; no content I/O.

use flamefs_kv::ReadWriteTransaction;
use flamefs_proto::meta::{Acl, SymlinkReq, SymlinkRsp};
use flamefs_schema as schema;
use flamefs_types::{make_error, InodeId, MetaCode, Result, StatusCode};

use crate::config::MetaConfig;
use crate::dir_entry::DirEntry;
use crate::inode::{check_permission, AccessType, Inode};
use crate::ops::stat::normalize_parent;
use crate::path_resolve::PathResolver;

pub async fn symlink(
    txn: &mut dyn ReadWriteTransaction,
    config: &MetaConfig,
    req: &SymlinkReq,
    now_ns: i64,
    new_id: InodeId,
) -> Result<SymlinkRsp> {
    let path = req
        .path
        .path
        .as_deref()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| flamefs_types::Status::with_message(StatusCode::INVALID_ARG, "empty path"))?;
    if req.target.is_empty() {
        return make_error(StatusCode::INVALID_ARG);
    }

    let parent = normalize_parent(req.path.parent);
    let resolved = {
        let mut resolver = PathResolver::new(
            txn,
            &req.base.user,
            config.max_symlink_count,
            config.max_symlink_depth,
        );
        resolver.resolve(parent, path, false).await?
    };

    if resolved.dir_entry.is_some() {
        return make_error(MetaCode::EXISTS);
    }
    if resolved.leaf_name.len() > config.max_name_length {
        return make_error(MetaCode::NAME_TOO_LONG);
    }

    check_permission(&resolved.parent_acl, &req.base.user, AccessType::Write)?;

    let acl = Acl {
        uid: req.base.user.uid,
        gid: req.base.user.gid,
        perm: 0o777,
        iflags: 0,
    };
    let inode = Inode::new_symlink(new_id, req.target.clone(), acl, now_ns);
    let entry = DirEntry::new_symlink(
        resolved.parent_id,
        resolved.leaf_name.clone(),
        new_id,
        req.base.request_uuid,
    );

    txn.add_read_conflict(&schema::inode_key(resolved.parent_id))
        .await?;
    entry.add_read_conflict(txn).await?;
    entry.store(txn).await?;
    inode.store(txn).await?;

    Ok(SymlinkRsp {
        inode: inode.record,
    })
}

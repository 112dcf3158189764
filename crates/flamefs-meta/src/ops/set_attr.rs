//! setAttr / setLayout: attribute and layout changes.

use flamefs_kv::ReadWriteTransaction;
use flamefs_proto::meta::{InodeData, SetAttrReq, SetAttrRsp, SetLayoutReq, SetLayoutRsp};
use flamefs_types::{make_error, make_error_msg, MetaCode, Result, StatusCode};

use crate::config::MetaConfig;
use crate::inode::{AccessType, Inode};
use crate::ops::stat::normalize_parent;
use crate::path_resolve::PathResolver;

async fn resolve_target(
    txn: &mut dyn ReadWriteTransaction,
    config: &MetaConfig,
    user: &flamefs_proto::common::UserInfo,
    path_at: &flamefs_proto::meta::PathAt,
) -> Result<Inode> {
    let parent = normalize_parent(path_at.parent);
    match path_at.path.as_deref() {
        Some(path) if !path.is_empty() => {
            let resolved = {
                let mut resolver = PathResolver::new(
                    txn,
                    user,
                    config.max_symlink_count,
                    config.max_symlink_depth,
                );
                resolver.resolve(parent, path, true).await?
            };
            let entry = resolved
                .dir_entry
                .ok_or_else(|| flamefs_types::Status::new(MetaCode::NOT_FOUND))?;
            Inode::load_required(txn, entry.inode_id()).await
        }
        _ => Inode::load_required(txn, parent).await,
    }
}

pub async fn set_attr(
    txn: &mut dyn ReadWriteTransaction,
    config: &MetaConfig,
    req: &SetAttrReq,
    now_ns: i64,
) -> Result<SetAttrRsp> {
    let mut inode = resolve_target(txn, config, &req.base.user, &req.path).await?;
    let user = &req.base.user;
    let is_owner = user.is_root() || user.uid == inode.acl().uid;

    if req.perm.is_some() && !is_owner {
        return make_error(MetaCode::NO_PERMISSION);
    }
    // Ownership changes are root-only; group changes need ownership.
    if req.uid.is_some() && !user.is_root() {
        return make_error(MetaCode::NO_PERMISSION);
    }
    if req.gid.is_some() && !is_owner {
        return make_error(MetaCode::NO_PERMISSION);
    }
    if (req.atime_ns.is_some() || req.mtime_ns.is_some()) && !is_owner {
        inode.check_permission(user, AccessType::Write)?;
    }
    if req.iflags.is_some() && !user.is_root() {
        return make_error(MetaCode::NO_PERMISSION);
    }

    if let Some(perm) = req.perm {
        inode.record.acl.perm = perm & 0o7777;
    }
    if let Some(uid) = req.uid {
        inode.record.acl.uid = uid;
    }
    if let Some(gid) = req.gid {
        inode.record.acl.gid = gid;
    }
    if let Some(atime) = req.atime_ns {
        inode.record.atime_ns = atime;
    }
    if let Some(mtime) = req.mtime_ns {
        inode.record.mtime_ns = mtime;
    }
    if let Some(iflags) = req.iflags {
        inode.record.acl.iflags = iflags;
    }
    inode.record.ctime_ns = now_ns;

    inode.add_read_conflict(txn).await?;
    inode.store(txn).await?;
    Ok(SetAttrRsp {
        inode: inode.record,
    })
}

pub async fn set_layout(
    txn: &mut dyn ReadWriteTransaction,
    config: &MetaConfig,
    req: &SetLayoutReq,
    routing: &flamefs_proto::common::RoutingInfo,
    now_ns: i64,
) -> Result<SetLayoutRsp> {
    let mut inode = resolve_target(txn, config, &req.base.user, &req.path).await?;

    let user = &req.base.user;
    if !user.is_root() && user.uid != inode.acl().uid {
        return make_error(MetaCode::NO_PERMISSION);
    }

    let layout = req
        .layout
        .clone()
        .ok_or_else(|| flamefs_types::Status::with_message(StatusCode::INVALID_ARG, "no layout"))?;
    let table_len = crate::ops::create::chain_table_len(routing, &layout);
    layout.validate(table_len as usize)?;

    // Layout changes apply to directories only; files froze theirs at
    // create time.
    match &mut inode.record.data {
        InodeData::Directory {
            layout: dir_layout, ..
        } => {
            *dir_layout = layout;
        }
        _ => {
            return make_error_msg(
                MetaCode::NOT_DIRECTORY,
                "layout can only be set on directories",
            )
        }
    }
    inode.record.ctime_ns = now_ns;

    inode.add_read_conflict(txn).await?;
    inode.store(txn).await?;
    Ok(SetLayoutRsp {
        inode: inode.record,
    })
}

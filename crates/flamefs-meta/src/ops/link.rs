//! hardLink: an additional name for an existing file.

use flamefs_kv::ReadWriteTransaction;
use flamefs_proto::meta::{HardLinkReq, HardLinkRsp};
use flamefs_schema as schema;
use flamefs_types::{make_error, MetaCode, Result, StatusCode};

use crate::config::MetaConfig;
use crate::dir_entry::DirEntry;
use crate::inode::{check_permission, AccessType, Inode};
use crate::ops::stat::normalize_parent;
use crate::path_resolve::PathResolver;

pub async fn hard_link(
    txn: &mut dyn ReadWriteTransaction,
    config: &MetaConfig,
    req: &HardLinkReq,
    now_ns: i64,
) -> Result<HardLinkRsp> {
    let old_path = req
        .old_path
        .path
        .as_deref()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| flamefs_types::Status::with_message(StatusCode::INVALID_ARG, "old path"))?;
    let new_path = req
        .new_path
        .path
        .as_deref()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| flamefs_types::Status::with_message(StatusCode::INVALID_ARG, "new path"))?;

    let (old, new) = {
        let mut resolver = PathResolver::new(
            txn,
            &req.base.user,
            config.max_symlink_count,
            config.max_symlink_depth,
        );
        let old = resolver
            .resolve(normalize_parent(req.old_path.parent), old_path, false)
            .await?;
        let mut resolver = PathResolver::new(
            txn,
            &req.base.user,
            config.max_symlink_count,
            config.max_symlink_depth,
        );
        let new = resolver
            .resolve(normalize_parent(req.new_path.parent), new_path, false)
            .await?;
        (old, new)
    };

    let old_entry = old
        .dir_entry
        .ok_or_else(|| flamefs_types::Status::new(MetaCode::NOT_FOUND))?;
    if new.dir_entry.is_some() {
        return make_error(MetaCode::EXISTS);
    }
    if new.leaf_name.len() > config.max_name_length {
        return make_error(MetaCode::NAME_TOO_LONG);
    }

    // Directories cannot be hard linked; the tree stays a tree.
    if old_entry.is_directory() {
        return make_error(MetaCode::IS_DIRECTORY);
    }

    check_permission(&new.parent_acl, &req.base.user, AccessType::Write)?;

    let mut inode = Inode::load_required(txn, old_entry.inode_id()).await?;
    if inode.acl().is_immutable() {
        return make_error(MetaCode::NO_PERMISSION);
    }
    inode.record.nlink += 1;
    inode.record.ctime_ns = now_ns;

    let entry = DirEntry {
        record: flamefs_proto::meta::DirEntry {
            parent: new.parent_id,
            name: new.leaf_name.clone(),
            inode_id: old_entry.inode_id(),
            inode_type: old_entry.record.inode_type,
            uuid: req.base.request_uuid,
            dir_acl: None,
        },
    };

    old_entry.add_read_conflict(txn).await?;
    entry.add_read_conflict(txn).await?;
    txn.add_read_conflict(&schema::inode_key(new.parent_id))
        .await?;

    entry.store(txn).await?;
    inode.store(txn).await?;

    Ok(HardLinkRsp {
        inode: inode.record,
    })
}

//! rename: move an entry between directories in one transaction.
//!
//! The service layer holds both parents' batons in deterministic order
//! (smaller inode first); inside the transaction every record the outcome
//! depends on is conflict-tracked, so concurrent mutations of either
//! directory fail the commit rather than corrupt the tree.

use flamefs_kv::ReadWriteTransaction;
use flamefs_proto::meta::{InodeData, RenameReq, RenameRsp};
use flamefs_schema as schema;
use flamefs_types::{make_error, make_error_msg, MetaCode, Result, StatusCode};

use crate::config::MetaConfig;
use crate::dir_entry::{DirEntry, DirEntryList};
use crate::gc;
use crate::inode::{check_permission, AccessType, Inode};
use crate::ops::stat::normalize_parent;
use crate::path_resolve::PathResolver;
use crate::session::FileSession;

pub async fn rename(
    txn: &mut dyn ReadWriteTransaction,
    config: &MetaConfig,
    req: &RenameReq,
    now_ns: i64,
) -> Result<RenameRsp> {
    let src_path = req
        .src
        .path
        .as_deref()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| flamefs_types::Status::with_message(StatusCode::INVALID_ARG, "src path"))?;
    let dest_path = req
        .dest
        .path
        .as_deref()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| flamefs_types::Status::with_message(StatusCode::INVALID_ARG, "dest path"))?;

    let src_parent = normalize_parent(req.src.parent);
    let dest_parent = normalize_parent(req.dest.parent);

    let (src, dest) = {
        let mut resolver = PathResolver::new(
            txn,
            &req.base.user,
            config.max_symlink_count,
            config.max_symlink_depth,
        );
        let src = resolver.resolve(src_parent, src_path, false).await?;
        let mut resolver = PathResolver::new(
            txn,
            &req.base.user,
            config.max_symlink_count,
            config.max_symlink_depth,
        );
        let dest = resolver.resolve(dest_parent, dest_path, false).await?;
        (src, dest)
    };

    let src_entry = src
        .dir_entry
        .ok_or_else(|| flamefs_types::Status::new(MetaCode::NOT_FOUND))?;

    if dest.leaf_name.len() > config.max_name_length {
        return make_error(MetaCode::NAME_TOO_LONG);
    }

    // Renaming onto itself is a successful no-op.
    if src.parent_id == dest.parent_id && src_entry.name() == dest.leaf_name {
        let inode = Inode::load_required(txn, src_entry.inode_id()).await?;
        return Ok(RenameRsp {
            inode: Some(inode.record),
        });
    }

    check_permission(&src.parent_acl, &req.base.user, AccessType::Write)?;
    check_permission(&dest.parent_acl, &req.base.user, AccessType::Write)?;

    let moved = Inode::load_required(txn, src_entry.inode_id()).await?;
    if moved.acl().is_immutable() {
        return make_error_msg(MetaCode::NO_PERMISSION, "inode is immutable");
    }

    // A directory cannot move under its own subtree.
    if moved.is_directory() && is_ancestor_of(txn, moved.id(), dest.parent_id).await? {
        return make_error_msg(StatusCode::INVALID_ARG, "destination is inside the source");
    }

    // Replace an existing destination entry.
    if let Some(dest_entry) = &dest.dir_entry {
        if dest_entry.inode_id() == src_entry.inode_id() {
            // Another name of the same inode: drop the source name.
            dest_entry.add_read_conflict(txn).await?;
        } else {
            if dest_entry.is_directory() && !src_entry.is_directory() {
                return make_error(MetaCode::IS_DIRECTORY);
            }
            if !dest_entry.is_directory() && src_entry.is_directory() {
                return make_error(MetaCode::NOT_DIRECTORY);
            }
            dest_entry.add_read_conflict(txn).await?;
            let dest_inode = Inode::load_required(txn, dest_entry.inode_id()).await?;
            if dest_inode.is_directory()
                && !DirEntryList::check_empty(txn, dest_inode.id()).await?
            {
                return make_error(MetaCode::NOT_EMPTY);
            }
            dest_entry.remove(txn).await?;
            drop_link(txn, dest_inode).await?;
        }
    } else {
        // The destination's absence is part of the outcome.
        txn.add_read_conflict(&schema::dir_entry_key(dest.parent_id, &dest.leaf_name))
            .await?;
    }

    src_entry.add_read_conflict(txn).await?;
    src_entry.remove(txn).await?;

    let new_entry = DirEntry {
        record: flamefs_proto::meta::DirEntry {
            parent: dest.parent_id,
            name: dest.leaf_name.clone(),
            inode_id: src_entry.inode_id(),
            inode_type: src_entry.record.inode_type,
            uuid: src_entry.record.uuid,
            dir_acl: src_entry.record.dir_acl,
        },
    };
    new_entry.store(txn).await?;

    // A moved directory carries its parent link and name in the inode.
    let mut moved = moved;
    if let InodeData::Directory { parent, name, .. } = &mut moved.record.data {
        *parent = dest.parent_id;
        *name = dest.leaf_name.clone();
    }
    moved.record.ctime_ns = now_ns;
    moved.store(txn).await?;

    txn.add_read_conflict(&schema::inode_key(src.parent_id)).await?;
    txn.add_read_conflict(&schema::inode_key(dest.parent_id))
        .await?;

    tracing::debug!(
        src_parent = src.parent_id.0,
        dest_parent = dest.parent_id.0,
        name = %dest.leaf_name,
        inode = new_entry.inode_id().0,
        "renamed"
    );

    Ok(RenameRsp {
        inode: Some(moved.record),
    })
}

/// Unlink accounting for a replaced destination inode.
async fn drop_link(txn: &mut dyn ReadWriteTransaction, inode: Inode) -> Result<()> {
    if inode.record.nlink <= 1 {
        let mut zeroed = inode;
        zeroed.record.nlink = 0;
        zeroed.store(txn).await?;
        if zeroed.is_directory() || !FileSession::any_open(txn, zeroed.id()).await? {
            gc::enqueue(txn, &zeroed).await?;
        }
    } else {
        let mut updated = inode;
        updated.record.nlink -= 1;
        updated.store(txn).await?;
    }
    Ok(())
}

/// Whether `ancestor` appears on the parent chain of directory `node`.
async fn is_ancestor_of(
    txn: &mut dyn ReadWriteTransaction,
    ancestor: flamefs_types::InodeId,
    node: flamefs_types::InodeId,
) -> Result<bool> {
    let mut current = node;
    for _ in 0..256 {
        if current == ancestor {
            return Ok(true);
        }
        if current.is_tree_root() {
            return Ok(false);
        }
        let inode = match Inode::snapshot_load(txn, current).await? {
            Some(inode) => inode,
            None => return Ok(false),
        };
        match inode.record.data {
            InodeData::Directory { parent, .. } => current = parent,
            _ => return Ok(false),
        }
    }
    make_error_msg(MetaCode::INCONSISTENT, "parent chain does not terminate")
}

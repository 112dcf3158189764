//! remove: unlink files and symlinks, delete or garbage-collect
//! directories.

use flamefs_kv::ReadWriteTransaction;
use flamefs_proto::meta::{RemoveReq, RemoveRsp};
use flamefs_schema as schema;
use flamefs_types::{make_error, make_error_msg, Result, MetaCode};

use crate::config::MetaConfig;
use crate::dir_entry::DirEntryList;
use crate::gc;
use crate::inode::{check_permission, AccessType, Inode};
use crate::ops::stat::normalize_parent;
use crate::path_resolve::PathResolver;
use crate::session::FileSession;

const S_ISVTX: u32 = 0o1000;

pub async fn remove(
    txn: &mut dyn ReadWriteTransaction,
    config: &MetaConfig,
    req: &RemoveReq,
) -> Result<RemoveRsp> {
    let path = match req.path.path.as_deref() {
        Some(path) if !path.is_empty() => path,
        _ => return make_error_msg(MetaCode::NOT_FOUND, "remove needs a path"),
    };
    let parent = normalize_parent(req.path.parent);

    let resolved = {
        let mut resolver = PathResolver::new(
            txn,
            &req.base.user,
            config.max_symlink_count,
            config.max_symlink_depth,
        );
        // The leaf symlink itself is removed, never its target.
        resolver.resolve(parent, path, false).await?
    };
    let entry = resolved
        .dir_entry
        .ok_or_else(|| flamefs_types::Status::new(MetaCode::NOT_FOUND))?;

    if entry.inode_id().is_tree_root() {
        return make_error_msg(MetaCode::NO_PERMISSION, "cannot remove a tree root");
    }

    check_permission(&resolved.parent_acl, &req.base.user, AccessType::Write)?;

    let inode = Inode::load_required(txn, entry.inode_id()).await?;

    if inode.acl().is_immutable() {
        return make_error_msg(MetaCode::NO_PERMISSION, "inode is immutable");
    }

    // Sticky directories only let root, the directory owner or the file
    // owner unlink.
    if resolved.parent_acl.perm & S_ISVTX != 0
        && !req.base.user.is_root()
        && req.base.user.uid != resolved.parent_acl.uid
        && req.base.user.uid != inode.acl().uid
    {
        return make_error_msg(MetaCode::NO_PERMISSION, "sticky bit on parent");
    }

    match req.expect_directory {
        Some(true) if !inode.is_directory() => return make_error(MetaCode::NOT_DIRECTORY),
        Some(false) if inode.is_directory() => return make_error(MetaCode::IS_DIRECTORY),
        _ => {}
    }

    entry.add_read_conflict(txn).await?;
    txn.add_read_conflict(&schema::inode_key(resolved.parent_id))
        .await?;

    if inode.is_directory() {
        let empty = DirEntryList::check_empty(txn, entry.inode_id()).await?;
        if empty {
            entry.remove(txn).await?;
            inode.add_read_conflict(txn).await?;
            inode.remove(txn).await?;
        } else {
            if !req.recursive {
                return make_error(MetaCode::NOT_EMPTY);
            }
            // Detach the subtree now; the GC worker dismantles it in the
            // background.
            entry.remove(txn).await?;
            gc::enqueue(txn, &inode).await?;
        }
    } else {
        entry.remove(txn).await?;
        if inode.record.nlink <= 1 {
            let mut zeroed = inode.clone();
            zeroed.record.nlink = 0;
            zeroed.add_read_conflict(txn).await?;
            if FileSession::any_open(txn, zeroed.id()).await? {
                // A writer still holds the file; close hands it to GC.
                zeroed.store(txn).await?;
            } else {
                zeroed.store(txn).await?;
                gc::enqueue(txn, &zeroed).await?;
            }
        } else {
            let mut updated = inode.clone();
            updated.record.nlink -= 1;
            updated.add_read_conflict(txn).await?;
            updated.store(txn).await?;
        }
    }

    tracing::debug!(
        parent = resolved.parent_id.0,
        name = %entry.name(),
        inode = entry.inode_id().0,
        "removed entry"
    );
    Ok(RemoveRsp {})
}

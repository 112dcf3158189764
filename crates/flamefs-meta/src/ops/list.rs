//! list: paginated snapshot scan of a directory.

use flamefs_kv::ReadOnlyTransaction;
use flamefs_proto::meta::{ListReq, ListRsp};
use flamefs_types::{make_error, MetaCode, Result};

use crate::config::MetaConfig;
use crate::dir_entry::DirEntryList;
use crate::inode::{check_permission, AccessType, Inode};
use crate::ops::stat::normalize_parent;
use crate::path_resolve::PathResolver;

pub async fn list<T: ReadOnlyTransaction + ?Sized>(
    txn: &T,
    config: &MetaConfig,
    req: &ListReq,
) -> Result<ListRsp> {
    let parent = normalize_parent(req.path.parent);

    // The request may address the directory by path or directly by parent.
    let (dir_id, dir_acl) = match req.path.path.as_deref() {
        Some(path) if !path.is_empty() => {
            let mut resolver = PathResolver::new(
                txn,
                &req.base.user,
                config.max_symlink_count,
                config.max_symlink_depth,
            );
            let resolved = resolver.resolve(parent, path, true).await?;
            match resolved.dir_entry {
                Some(entry) if entry.is_directory() => {
                    let acl = match entry.record.dir_acl {
                        Some(acl) => acl,
                        None => entry.snapshot_load_inode(txn).await?.acl(),
                    };
                    (entry.inode_id(), acl)
                }
                Some(_) => return make_error(MetaCode::NOT_DIRECTORY),
                None => return make_error(MetaCode::NOT_FOUND),
            }
        }
        _ => {
            let inode = Inode::snapshot_load(txn, parent)
                .await?
                .ok_or_else(|| flamefs_types::Status::new(MetaCode::NOT_FOUND))?;
            if !inode.is_directory() {
                return make_error(MetaCode::NOT_DIRECTORY);
            }
            (parent, inode.acl())
        }
    };

    check_permission(&dir_acl, &req.base.user, AccessType::Read)?;

    // Non-positive limits mean the server default.
    let limit = if req.limit <= 0 {
        config.list_default_limit
    } else {
        req.limit.min(config.list_max_limit)
    };

    let page = DirEntryList::snapshot_load(txn, dir_id, &req.prev, limit, req.status).await?;
    Ok(ListRsp {
        entries: page.entries.into_iter().map(|e| e.record).collect(),
        inodes: page.inodes.into_iter().map(|i| i.record).collect(),
        more: page.more,
    })
}

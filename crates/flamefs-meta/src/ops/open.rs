//! open: open an existing file, recording a write session when asked.

use flamefs_kv::ReadWriteTransaction;
use flamefs_proto::meta::{OpenFlags, OpenReq, OpenRsp};
use flamefs_types::{make_error, MetaCode, Result, StatusCode};

use crate::config::MetaConfig;
use crate::inode::AccessType;
use crate::ops::stat::normalize_parent;
use crate::path_resolve::PathResolver;
use crate::session::FileSession;

pub async fn open(
    txn: &mut dyn ReadWriteTransaction,
    config: &MetaConfig,
    req: &OpenReq,
) -> Result<OpenRsp> {
    let parent = normalize_parent(req.path.parent);
    let path = req.path.path.as_deref().unwrap_or("");

    let resolved = {
        let mut resolver = PathResolver::new(
            txn,
            &req.base.user,
            config.max_symlink_count,
            config.max_symlink_depth,
        );
        resolver.resolve(parent, path, true).await?
    };

    let inode = match &resolved.dir_entry {
        Some(entry) => entry.snapshot_load_inode(txn).await?,
        None if path.is_empty() => crate::inode::Inode::load_required(txn, parent).await?,
        None => return make_error(MetaCode::NOT_FOUND),
    };

    if req.flags.contains(OpenFlags::O_DIRECTORY) && !inode.is_directory() {
        return make_error(MetaCode::NOT_DIRECTORY);
    }
    if inode.is_directory() && req.flags.writable() {
        return make_error(MetaCode::IS_DIRECTORY);
    }

    if req.flags.writable() {
        inode.check_permission(&req.base.user, AccessType::Write)?;
    } else {
        inode.check_permission(&req.base.user, AccessType::Read)?;
    }

    if let Some(session) = req.session {
        if req.flags.writable() {
            if !inode.is_file() {
                return make_error(MetaCode::NOT_FILE);
            }
            // The session's presence defers GC while the writer is alive.
            inode.add_read_conflict(txn).await?;
            FileSession::new(inode.id(), session, req.base.client, req.flags.0)
                .store(txn)
                .await?;
        }
    }

    let need_truncate = req.flags.contains(OpenFlags::O_TRUNC) && inode.record.length() > 0;
    if need_truncate && !req.flags.writable() {
        return make_error(StatusCode::INVALID_ARG);
    }

    Ok(OpenRsp {
        inode: inode.record,
        need_truncate,
    })
}

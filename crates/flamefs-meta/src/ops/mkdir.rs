//! mkdir: create one directory, or a whole missing path when recursive.

use flamefs_kv::ReadWriteTransaction;
use flamefs_proto::meta::{Acl, MkdirReq, MkdirRsp};
use flamefs_schema as schema;
use flamefs_types::{make_error, make_error_msg, InodeId, MetaCode, Result, StatusCode};

use crate::config::MetaConfig;
use crate::dir_entry::DirEntry;
use crate::inode::{check_permission, AccessType, Inode};
use crate::ops::stat::normalize_parent;
use crate::path_resolve::PathResolver;

pub struct MkdirCtx {
    pub now_ns: i64,
    /// One pre-allocated id per path component; only the missing tail is
    /// consumed.
    pub new_ids: Vec<InodeId>,
}

pub async fn mkdir(
    txn: &mut dyn ReadWriteTransaction,
    config: &MetaConfig,
    req: &MkdirReq,
    ctx: &MkdirCtx,
) -> Result<MkdirRsp> {
    let path = req
        .path
        .path
        .as_deref()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| flamefs_types::Status::with_message(StatusCode::INVALID_ARG, "empty path"))?;

    let parent = normalize_parent(req.path.parent);
    let range = {
        let mut resolver = PathResolver::new(
            txn,
            &req.base.user,
            config.max_symlink_count,
            config.max_symlink_depth,
        );
        resolver.resolve_range(parent, path).await?
    };

    if range.missing.is_empty() {
        // The full path already exists.
        if req.recursive {
            let inode = Inode::load_required(txn, range.base_id).await?;
            return Ok(MkdirRsp {
                inode: inode.record,
            });
        }
        return make_error(MetaCode::EXISTS);
    }
    if range.missing.len() > 1 && !req.recursive {
        return make_error_msg(
            MetaCode::NOT_FOUND,
            format!("missing intermediate directory {:?}", range.missing[0]),
        );
    }
    if range.missing.len() > ctx.new_ids.len() {
        return make_error(MetaCode::INODE_ID_ALLOC_FAILED);
    }
    for name in &range.missing {
        if name.len() > config.max_name_length {
            return make_error(MetaCode::NAME_TOO_LONG);
        }
    }

    check_permission(&range.base_acl, &req.base.user, AccessType::Write)?;

    let base = Inode::load_required(txn, range.base_id).await?;
    if !base.is_directory() {
        return make_error(MetaCode::NOT_DIRECTORY);
    }
    let inherited_layout = match req.layout.clone().or_else(|| base.record.layout().cloned()) {
        Some(layout) => layout,
        None => {
            return make_error_msg(
                MetaCode::INVALID_FILE_LAYOUT,
                "no layout to inherit for new directory",
            )
        }
    };

    // A racing mkdir of the same first component must conflict.
    txn.add_read_conflict(&schema::inode_key(range.base_id))
        .await?;
    txn.add_read_conflict(&schema::dir_entry_key(range.base_id, &range.missing[0]))
        .await?;

    let acl = Acl {
        uid: req.base.user.uid,
        gid: req.base.user.gid,
        perm: req.perm & 0o7777,
        iflags: range.base_acl.iflags & flamefs_proto::meta::IFLAG_INHERITABLE,
    };

    let mut current_parent = range.base_id;
    let mut last = None;
    for (i, name) in range.missing.iter().enumerate() {
        let id = ctx.new_ids[i];
        let dir = Inode::new_directory(
            id,
            current_parent,
            name.clone(),
            acl,
            inherited_layout.clone(),
            ctx.now_ns,
        );
        let entry = DirEntry::new_directory(
            current_parent,
            name.clone(),
            id,
            req.base.request_uuid,
            acl,
        );
        entry.store(txn).await?;
        dir.store(txn).await?;
        current_parent = id;
        last = Some(dir);
    }
    let created = last.expect("at least one directory was created");

    tracing::debug!(
        base = range.base_id.0,
        created = created.id().0,
        depth = range.missing.len(),
        "mkdir"
    );

    Ok(MkdirRsp {
        inode: created.record,
    })
}

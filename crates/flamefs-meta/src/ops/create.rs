//! create: make a new file under a directory, inheriting the directory's
//! layout and claiming chain slots from its allocation counter.

use std::sync::Arc;

use flamefs_kv::ReadWriteTransaction;
use flamefs_proto::common::RoutingInfo;
use flamefs_proto::meta::{Acl, CreateReq, CreateRsp, OpenFlags};
use flamefs_schema as schema;
use flamefs_types::{make_error, make_error_msg, InodeId, MetaCode, Result, StatusCode};

use crate::config::MetaConfig;
use crate::dir_entry::DirEntry;
use crate::inode::{AccessType, Inode};
use crate::ops::stat::normalize_parent;
use crate::path_resolve::PathResolver;
use crate::session::FileSession;

/// Context the service computes outside the transaction.
pub struct CreateCtx {
    pub now_ns: i64,
    /// Pre-allocated id for the new inode; unused when the file exists.
    pub new_id: InodeId,
    /// Routing snapshot used to size the referenced chain table.
    pub routing: Arc<RoutingInfo>,
}

pub(crate) fn chain_table_len(routing: &RoutingInfo, layout: &flamefs_layout::Layout) -> u32 {
    routing
        .chain_tables
        .get(&layout.chain_table_id)
        .map(|t| t.chains.len() as u32)
        .unwrap_or(0)
}

pub async fn create(
    txn: &mut dyn ReadWriteTransaction,
    config: &MetaConfig,
    req: &CreateReq,
    ctx: &CreateCtx,
) -> Result<CreateRsp> {
    let path = req
        .path
        .path
        .as_deref()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| flamefs_types::Status::with_message(StatusCode::INVALID_ARG, "empty path"))?;

    let parent = normalize_parent(req.path.parent);
    let resolved = {
        let mut resolver = PathResolver::new(
            txn,
            &req.base.user,
            config.max_symlink_count,
            config.max_symlink_depth,
        );
        resolver.resolve(parent, path, true).await?
    };

    if resolved.leaf_name.len() > config.max_name_length {
        return make_error(MetaCode::NAME_TOO_LONG);
    }

    if let Some(entry) = &resolved.dir_entry {
        // The name exists; O_CREAT without O_EXCL opens it.
        if req.flags.contains(OpenFlags::O_EXCL) {
            return make_error(MetaCode::EXISTS);
        }
        // The entry's existence is what this outcome depends on.
        entry.add_read_conflict(txn).await?;
        let inode = entry.snapshot_load_inode(txn).await?;
        if inode.is_directory() {
            return make_error(MetaCode::IS_DIRECTORY);
        }
        if req.flags.writable() {
            inode.check_permission(&req.base.user, AccessType::Write)?;
        } else {
            inode.check_permission(&req.base.user, AccessType::Read)?;
        }

        record_session(txn, &inode, req).await?;
        let need_truncate =
            req.flags.contains(OpenFlags::O_TRUNC) && inode.record.length() > 0;
        return Ok(CreateRsp {
            inode: inode.record,
            need_truncate,
        });
    }

    // New file: write permission on the parent directory.
    crate::inode::check_permission(&resolved.parent_acl, &req.base.user, AccessType::Write)?;

    let mut parent_inode = Inode::load_required(txn, resolved.parent_id).await?;

    let mut layout = match &req.layout {
        Some(layout) => layout.clone(),
        None => match parent_inode.record.layout() {
            Some(layout) => layout.clone(),
            None => {
                return make_error_msg(
                    MetaCode::INVALID_FILE_LAYOUT,
                    "parent directory has no layout to inherit",
                )
            }
        },
    };
    let table_len = chain_table_len(&ctx.routing, &layout);
    layout.validate(table_len as usize)?;

    // Claim a stripe worth of chain-table positions from the parent and
    // freeze them into the file. The seed stays as inherited (or as an
    // explicit request layout set it); files spread over the table through
    // the rotating slot allocation, not the seed.
    let start = parent_inode.take_chain_slots(layout.stripe_size, table_len)?;
    layout.chain_slots = (0..layout.stripe_size)
        .map(|i| (start + i) % table_len)
        .collect();
    parent_inode.store(txn).await?;

    let acl = Acl {
        uid: req.base.user.uid,
        gid: req.base.user.gid,
        perm: req.perm & 0o7777,
        iflags: resolved.parent_acl.iflags & flamefs_proto::meta::IFLAG_INHERITABLE,
    };
    let inode = Inode::new_file(ctx.new_id, acl, layout, ctx.now_ns);
    let entry = DirEntry::new_file(
        resolved.parent_id,
        resolved.leaf_name.clone(),
        ctx.new_id,
        req.base.request_uuid,
    );

    // A concurrent create of the same name must conflict with us.
    txn.add_read_conflict(&schema::inode_key(resolved.parent_id))
        .await?;
    entry.add_read_conflict(txn).await?;

    entry.store(txn).await?;
    inode.store(txn).await?;
    record_session(txn, &inode, req).await?;

    tracing::debug!(
        parent = resolved.parent_id.0,
        inode = ctx.new_id.0,
        name = %resolved.leaf_name,
        "created file"
    );

    Ok(CreateRsp {
        inode: inode.record,
        need_truncate: false,
    })
}

async fn record_session(
    txn: &mut dyn ReadWriteTransaction,
    inode: &Inode,
    req: &CreateReq,
) -> Result<()> {
    if let Some(session) = req.session {
        if req.flags.writable() {
            FileSession::new(inode.id(), session, req.base.client, req.flags.0)
                .store(txn)
                .await?;
        }
    }
    Ok(())
}

/// Reject flag combinations that can never create a file.
pub fn validate_flags(req: &CreateReq) -> Result<()> {
    if req.flags.contains(OpenFlags::O_DIRECTORY) {
        return make_error_msg(StatusCode::INVALID_ARG, "create cannot open a directory");
    }
    Ok(())
}

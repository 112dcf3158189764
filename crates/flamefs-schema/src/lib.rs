//! KV key schema shared by the metadata plane.
//!
//! Every table is namespaced by a fixed four-byte ASCII prefix; key bodies
//! are big-endian fixed-width components, optionally followed by
//! variable-width bytes (names, tags). Big-endian keeps lexicographic key
//! order equal to numeric order, so range scans walk ids in sequence.

use flamefs_types::{
    make_error_msg, ChainId, ChainTableId, InodeId, NodeId, Result, StatusCode, TargetId, Uuid,
};

/// Table prefixes. Exactly four ASCII bytes each.
pub mod prefix {
    pub const INODE: &[u8; 4] = b"INOD";
    pub const DIR_ENTRY: &[u8; 4] = b"DENT";
    pub const FILE_SESSION: &[u8; 4] = b"INOS";
    pub const CHAIN_TABLE: &[u8; 4] = b"CHIT";
    pub const CHAIN_INFO: &[u8; 4] = b"CHIF";
    pub const TARGET_INFO: &[u8; 4] = b"TGIF";
    pub const NODE: &[u8; 4] = b"NODE";
    pub const META_DIST: &[u8; 4] = b"META";
    pub const IDEMPOTENT: &[u8; 4] = b"IDEM";
    pub const USER: &[u8; 4] = b"USER";
    pub const CONFIG: &[u8; 4] = b"CONF";
    /// Deletion (GC) queue. Entries are consumed by the GC worker.
    pub const GC_QUEUE: &[u8; 4] = b"GCQE";
}

fn packed(prefix: &[u8; 4], body_capacity: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + body_capacity);
    key.extend_from_slice(prefix);
    key
}

fn check_prefix(key: &[u8], prefix: &[u8; 4], table: &str) -> Result<()> {
    if key.len() < 4 || &key[..4] != prefix {
        return make_error_msg(
            StatusCode::DATA_CORRUPTION,
            format!("key does not carry the {} prefix", table),
        );
    }
    Ok(())
}

fn read_u64_at(key: &[u8], offset: usize, table: &str) -> Result<u64> {
    let bytes: [u8; 8] = key
        .get(offset..offset + 8)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| {
            flamefs_types::Status::with_message(
                StatusCode::DATA_CORRUPTION,
                format!("truncated {} key", table),
            )
        })?;
    Ok(u64::from_be_bytes(bytes))
}

fn read_u32_at(key: &[u8], offset: usize, table: &str) -> Result<u32> {
    let bytes: [u8; 4] = key
        .get(offset..offset + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| {
            flamefs_types::Status::with_message(
                StatusCode::DATA_CORRUPTION,
                format!("truncated {} key", table),
            )
        })?;
    Ok(u32::from_be_bytes(bytes))
}

// ---------------------------------------------------------------------------
// Inodes
// ---------------------------------------------------------------------------

/// `INOD ‖ inode(8 BE)`
pub fn inode_key(inode: InodeId) -> Vec<u8> {
    let mut key = packed(prefix::INODE, 8);
    key.extend_from_slice(&inode.0.to_be_bytes());
    key
}

pub fn parse_inode_key(key: &[u8]) -> Result<InodeId> {
    check_prefix(key, prefix::INODE, "inode")?;
    if key.len() != 12 {
        return make_error_msg(StatusCode::DATA_CORRUPTION, "inode key has wrong length");
    }
    Ok(InodeId(read_u64_at(key, 4, "inode")?))
}

// ---------------------------------------------------------------------------
// Directory entries
// ---------------------------------------------------------------------------

/// `DENT ‖ parent(8 BE) ‖ name`
pub fn dir_entry_key(parent: InodeId, name: &str) -> Vec<u8> {
    let mut key = packed(prefix::DIR_ENTRY, 8 + name.len());
    key.extend_from_slice(&parent.0.to_be_bytes());
    key.extend_from_slice(name.as_bytes());
    key
}

/// Prefix covering all entries of one directory.
pub fn dir_entry_prefix(parent: InodeId) -> Vec<u8> {
    let mut key = packed(prefix::DIR_ENTRY, 8);
    key.extend_from_slice(&parent.0.to_be_bytes());
    key
}

pub fn parse_dir_entry_key(key: &[u8]) -> Result<(InodeId, String)> {
    check_prefix(key, prefix::DIR_ENTRY, "dir entry")?;
    let parent = InodeId(read_u64_at(key, 4, "dir entry")?);
    let name = std::str::from_utf8(&key[12..]).map_err(|_| {
        flamefs_types::Status::with_message(
            StatusCode::DATA_CORRUPTION,
            "dir entry name is not valid UTF-8",
        )
    })?;
    if name.is_empty() {
        return make_error_msg(StatusCode::DATA_CORRUPTION, "dir entry key has empty name");
    }
    Ok((parent, name.to_string()))
}

// ---------------------------------------------------------------------------
// File sessions
// ---------------------------------------------------------------------------

/// `INOS ‖ inode(8 BE) ‖ session_uuid(16)`
pub fn file_session_key(inode: InodeId, session: Uuid) -> Vec<u8> {
    let mut key = packed(prefix::FILE_SESSION, 24);
    key.extend_from_slice(&inode.0.to_be_bytes());
    key.extend_from_slice(&session.to_bytes());
    key
}

/// Prefix covering all sessions of one inode.
pub fn file_session_prefix(inode: InodeId) -> Vec<u8> {
    let mut key = packed(prefix::FILE_SESSION, 8);
    key.extend_from_slice(&inode.0.to_be_bytes());
    key
}

pub fn parse_file_session_key(key: &[u8]) -> Result<(InodeId, Uuid)> {
    check_prefix(key, prefix::FILE_SESSION, "file session")?;
    if key.len() != 28 {
        return make_error_msg(
            StatusCode::DATA_CORRUPTION,
            "file session key has wrong length",
        );
    }
    let inode = InodeId(read_u64_at(key, 4, "file session")?);
    let uuid_bytes: [u8; 16] = key[12..28].try_into().unwrap();
    Ok((inode, Uuid::from_bytes(uuid_bytes)))
}

// ---------------------------------------------------------------------------
// Cluster tables (chain tables, chains, targets, nodes)
// ---------------------------------------------------------------------------

/// `CHIT ‖ table_id(4 BE) ‖ version(4 BE)`
pub fn chain_table_key(table: ChainTableId, version: u32) -> Vec<u8> {
    let mut key = packed(prefix::CHAIN_TABLE, 8);
    key.extend_from_slice(&table.0.to_be_bytes());
    key.extend_from_slice(&version.to_be_bytes());
    key
}

pub fn parse_chain_table_key(key: &[u8]) -> Result<(ChainTableId, u32)> {
    check_prefix(key, prefix::CHAIN_TABLE, "chain table")?;
    if key.len() != 12 {
        return make_error_msg(
            StatusCode::DATA_CORRUPTION,
            "chain table key has wrong length",
        );
    }
    Ok((
        ChainTableId(read_u32_at(key, 4, "chain table")?),
        read_u32_at(key, 8, "chain table")?,
    ))
}

/// `CHIF ‖ chain_id(4 BE)`
pub fn chain_key(chain: ChainId) -> Vec<u8> {
    let mut key = packed(prefix::CHAIN_INFO, 4);
    key.extend_from_slice(&chain.0.to_be_bytes());
    key
}

pub fn parse_chain_key(key: &[u8]) -> Result<ChainId> {
    check_prefix(key, prefix::CHAIN_INFO, "chain")?;
    if key.len() != 8 {
        return make_error_msg(StatusCode::DATA_CORRUPTION, "chain key has wrong length");
    }
    Ok(ChainId(read_u32_at(key, 4, "chain")?))
}

/// `TGIF ‖ target_id(8 BE)`
pub fn target_key(target: TargetId) -> Vec<u8> {
    let mut key = packed(prefix::TARGET_INFO, 8);
    key.extend_from_slice(&target.0.to_be_bytes());
    key
}

pub fn parse_target_key(key: &[u8]) -> Result<TargetId> {
    check_prefix(key, prefix::TARGET_INFO, "target")?;
    if key.len() != 12 {
        return make_error_msg(StatusCode::DATA_CORRUPTION, "target key has wrong length");
    }
    Ok(TargetId(read_u64_at(key, 4, "target")?))
}

/// `NODE ‖ node_id(4 BE)`
pub fn node_key(node: NodeId) -> Vec<u8> {
    let mut key = packed(prefix::NODE, 4);
    key.extend_from_slice(&node.0.to_be_bytes());
    key
}

pub fn parse_node_key(key: &[u8]) -> Result<NodeId> {
    check_prefix(key, prefix::NODE, "node")?;
    if key.len() != 8 {
        return make_error_msg(StatusCode::DATA_CORRUPTION, "node key has wrong length");
    }
    Ok(NodeId(read_u32_at(key, 4, "node")?))
}

// ---------------------------------------------------------------------------
// Meta distributor
// ---------------------------------------------------------------------------

/// The shared server-map key: exactly the `META` prefix.
pub fn meta_dist_map_key() -> Vec<u8> {
    prefix::META_DIST.to_vec()
}

/// Per-server presence marker: `META-{node_id:08}`.
pub fn meta_dist_server_key(node: NodeId) -> Vec<u8> {
    let mut key = packed(prefix::META_DIST, 9);
    key.extend_from_slice(format!("-{:08}", node.0).as_bytes());
    key
}

pub fn parse_meta_dist_server_key(key: &[u8]) -> Result<NodeId> {
    check_prefix(key, prefix::META_DIST, "meta distributor")?;
    let tail = &key[4..];
    if tail.len() != 9 || tail[0] != b'-' {
        return make_error_msg(
            StatusCode::DATA_CORRUPTION,
            "meta distributor server key has wrong shape",
        );
    }
    let digits = std::str::from_utf8(&tail[1..]).ok().and_then(|s| s.parse().ok());
    match digits {
        Some(id) => Ok(NodeId(id)),
        None => make_error_msg(
            StatusCode::DATA_CORRUPTION,
            "meta distributor server key has non-numeric id",
        ),
    }
}

// ---------------------------------------------------------------------------
// Idempotency, users, config, GC queue
// ---------------------------------------------------------------------------

/// `IDEM ‖ request_uuid(16) ‖ op_tag`
pub fn idempotent_key(request: Uuid, op_tag: &str) -> Vec<u8> {
    let mut key = packed(prefix::IDEMPOTENT, 16 + op_tag.len());
    key.extend_from_slice(&request.to_bytes());
    key.extend_from_slice(op_tag.as_bytes());
    key
}

/// `USER ‖ user name bytes`
pub fn user_key(name: &str) -> Vec<u8> {
    let mut key = packed(prefix::USER, name.len());
    key.extend_from_slice(name.as_bytes());
    key
}

/// `CONF ‖ config key bytes`
pub fn config_key(name: &str) -> Vec<u8> {
    let mut key = packed(prefix::CONFIG, name.len());
    key.extend_from_slice(name.as_bytes());
    key
}

/// `GCQE ‖ inode(8 BE)`
pub fn gc_queue_key(inode: InodeId) -> Vec<u8> {
    let mut key = packed(prefix::GC_QUEUE, 8);
    key.extend_from_slice(&inode.0.to_be_bytes());
    key
}

pub fn parse_gc_queue_key(key: &[u8]) -> Result<InodeId> {
    check_prefix(key, prefix::GC_QUEUE, "gc queue")?;
    if key.len() != 12 {
        return make_error_msg(StatusCode::DATA_CORRUPTION, "gc queue key has wrong length");
    }
    Ok(InodeId(read_u64_at(key, 4, "gc queue")?))
}

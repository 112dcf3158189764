//! Request/response pairs for every metadata operation.

use flamefs_layout::Layout;
use flamefs_types::{Gid, InodeId, Uid, Uuid};
use serde::{Deserialize, Serialize};

use crate::common::ReqBase;
use crate::meta::types::{DirEntry, Inode, OpenFlags, PathAt};

// ---- stat ----

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatReq {
    pub base: ReqBase,
    pub path: PathAt,
    /// Follow a symlink at the leaf.
    pub follow: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatRsp {
    pub inode: Inode,
}

// ---- batchStat ----

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchStatReq {
    pub base: ReqBase,
    pub inodes: Vec<InodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStatRsp {
    /// One slot per requested id; `None` for missing inodes.
    pub inodes: Vec<Option<Inode>>,
}

// ---- create ----

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateReq {
    pub base: ReqBase,
    pub path: PathAt,
    pub perm: u32,
    pub flags: OpenFlags,
    /// Overrides layout inheritance from the parent directory.
    pub layout: Option<Layout>,
    /// Session to record when opening for write.
    pub session: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRsp {
    pub inode: Inode,
    /// Set when `O_TRUNC` hit an existing non-empty file; the caller must
    /// run the truncate phase through the storage client.
    pub need_truncate: bool,
}

// ---- open ----

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenReq {
    pub base: ReqBase,
    pub path: PathAt,
    pub flags: OpenFlags,
    pub session: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRsp {
    pub inode: Inode,
    pub need_truncate: bool,
}

// ---- close ----

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloseReq {
    pub base: ReqBase,
    pub inode: InodeId,
    pub session: Uuid,
    /// Final length reported by the client's write path.
    pub length: Option<u64>,
    pub update_mtime: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseRsp {
    pub inode: Inode,
}

// ---- sync ----

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReq {
    pub base: ReqBase,
    pub inode: InodeId,
    pub length: Option<u64>,
    pub update_mtime: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRsp {
    pub inode: Inode,
}

// ---- mkdir ----

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MkdirReq {
    pub base: ReqBase,
    pub path: PathAt,
    pub perm: u32,
    pub recursive: bool,
    pub layout: Option<Layout>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MkdirRsp {
    pub inode: Inode,
}

// ---- list ----

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListReq {
    pub base: ReqBase,
    pub path: PathAt,
    /// Continuation cursor: the last name returned by the previous page.
    pub prev: String,
    /// Page size; non-positive means the server default.
    pub limit: i32,
    /// Also load the inode for each entry.
    pub status: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListRsp {
    pub entries: Vec<DirEntry>,
    pub inodes: Vec<Inode>,
    pub more: bool,
}

// ---- remove ----

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoveReq {
    pub base: ReqBase,
    pub path: PathAt,
    /// Allow removing a non-empty directory (handed to GC).
    pub recursive: bool,
    /// `Some(true)` requires a directory, `Some(false)` requires a
    /// non-directory (the rmdir/unlink distinction).
    pub expect_directory: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveRsp {}

// ---- rename ----

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenameReq {
    pub base: ReqBase,
    pub src: PathAt,
    pub dest: PathAt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameRsp {
    pub inode: Option<Inode>,
}

// ---- symlink ----

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymlinkReq {
    pub base: ReqBase,
    pub path: PathAt,
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymlinkRsp {
    pub inode: Inode,
}

// ---- hardLink ----

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HardLinkReq {
    pub base: ReqBase,
    pub old_path: PathAt,
    pub new_path: PathAt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardLinkRsp {
    pub inode: Inode,
}

// ---- setAttr ----

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetAttrReq {
    pub base: ReqBase,
    pub path: PathAt,
    pub perm: Option<u32>,
    pub uid: Option<Uid>,
    pub gid: Option<Gid>,
    pub atime_ns: Option<i64>,
    pub mtime_ns: Option<i64>,
    pub iflags: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetAttrRsp {
    pub inode: Inode,
}

// ---- truncate ----

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TruncateReq {
    pub base: ReqBase,
    pub inode: InodeId,
    pub length: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TruncateRsp {
    pub inode: Inode,
    pub chunks_removed: u32,
    /// `false` when the removal cap was hit; the caller re-issues with the
    /// same request uuid until finished.
    pub finished: bool,
}

// ---- statFs ----

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatFsReq {
    pub base: ReqBase,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatFsRsp {
    pub capacity: u64,
    pub used: u64,
    pub free: u64,
}

// ---- setLayout ----

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetLayoutReq {
    pub base: ReqBase,
    pub path: PathAt,
    pub layout: Option<Layout>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetLayoutRsp {
    pub inode: Inode,
}

// ---- getRealPath ----

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetRealPathReq {
    pub base: ReqBase,
    pub path: PathAt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRealPathRsp {
    pub path: String,
}

// ---- sessions ----

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtendSessionReq {
    pub base: ReqBase,
    pub inode: InodeId,
    pub session: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendSessionRsp {}

/// Addresses one file session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSessionRef {
    pub inode: InodeId,
    pub session: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PruneSessionReq {
    pub base: ReqBase,
    /// Only sessions belonging to this client are pruned.
    pub client: Uuid,
    pub sessions: Vec<FileSessionRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneSessionRsp {
    pub pruned: u32,
}

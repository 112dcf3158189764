use flamefs_layout::Layout;
use flamefs_types::{Gid, InodeId, Uid, UtcTime, Uuid};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Open flags
// ---------------------------------------------------------------------------

/// POSIX-style open flags. The shim maps real `O_*` values onto these; the
/// core only interprets the bits below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    pub const O_RDONLY: u32 = 0o0;
    pub const O_WRONLY: u32 = 0o1;
    pub const O_RDWR: u32 = 0o2;
    pub const O_CREAT: u32 = 0o100;
    pub const O_EXCL: u32 = 0o200;
    pub const O_TRUNC: u32 = 0o1000;
    pub const O_APPEND: u32 = 0o2000;
    pub const O_DIRECTORY: u32 = 0o200000;

    pub fn contains(&self, bits: u32) -> bool {
        (self.0 & bits) == bits
    }

    /// Whether the open requests write access.
    pub fn writable(&self) -> bool {
        (self.0 & (Self::O_WRONLY | Self::O_RDWR)) != 0
    }
}

// ---------------------------------------------------------------------------
// ACL
// ---------------------------------------------------------------------------

/// Immutable-inode flag.
pub const IFLAG_IMMUTABLE: u32 = 0x0010;
/// Append-only flag.
pub const IFLAG_APPEND: u32 = 0x0020;
/// Flags inherited from the parent directory at create time.
pub const IFLAG_INHERITABLE: u32 = 0x1000;

/// Owner, group, permission bits and inode flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Acl {
    pub uid: Uid,
    pub gid: Gid,
    pub perm: u32,
    pub iflags: u32,
}

impl Acl {
    pub fn new(uid: Uid, gid: Gid, perm: u32) -> Self {
        Self {
            uid,
            gid,
            perm,
            iflags: 0,
        }
    }

    pub fn root() -> Self {
        Self {
            uid: Uid(0),
            gid: Gid(0),
            perm: 0o755,
            iflags: IFLAG_IMMUTABLE,
        }
    }

    pub fn gc_root() -> Self {
        Self {
            uid: Uid(0),
            gid: Gid(0),
            perm: 0o700,
            iflags: IFLAG_IMMUTABLE,
        }
    }

    pub fn is_immutable(&self) -> bool {
        self.iflags & IFLAG_IMMUTABLE != 0
    }
}

// ---------------------------------------------------------------------------
// Inode
// ---------------------------------------------------------------------------

/// Inode kind discriminant used in directory entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InodeType {
    File,
    Directory,
    Symlink,
}

/// Kind-specific inode payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum InodeData {
    File {
        layout: Layout,
        length: u64,
        /// Bumped by every truncate so stale length updates are rejected.
        truncate_version: u64,
        flags: u32,
        /// Stripes currently in use when dynamic striping grows a file.
        dyn_stripe: u32,
    },
    Directory {
        parent: InodeId,
        name: String,
        layout: Layout,
        /// Feeds chain-slot allocation for files created inside.
        chain_alloc_counter: u32,
        lock: Option<Uuid>,
    },
    Symlink {
        target: String,
    },
}

/// The metadata record for a file, directory or symlink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    pub id: InodeId,
    pub acl: Acl,
    pub nlink: u32,
    pub atime_ns: i64,
    pub mtime_ns: i64,
    pub ctime_ns: i64,
    pub data: InodeData,
}

impl Inode {
    pub fn inode_type(&self) -> InodeType {
        match self.data {
            InodeData::File { .. } => InodeType::File,
            InodeData::Directory { .. } => InodeType::Directory,
            InodeData::Symlink { .. } => InodeType::Symlink,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self.data, InodeData::File { .. })
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.data, InodeData::Directory { .. })
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.data, InodeData::Symlink { .. })
    }

    pub fn layout(&self) -> Option<&Layout> {
        match &self.data {
            InodeData::File { layout, .. } => Some(layout),
            InodeData::Directory { layout, .. } => Some(layout),
            InodeData::Symlink { .. } => None,
        }
    }

    pub fn length(&self) -> u64 {
        match &self.data {
            InodeData::File { length, .. } => *length,
            _ => 0,
        }
    }

    pub fn symlink_target(&self) -> Option<&str> {
        match &self.data {
            InodeData::Symlink { target } => Some(target),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Directory entries and sessions
// ---------------------------------------------------------------------------

/// A name in a directory pointing at an inode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub parent: InodeId,
    pub name: String,
    pub inode_id: InodeId,
    pub inode_type: InodeType,
    /// Identity of the create that produced this entry; makes replays of the
    /// same request observable as the same entry.
    pub uuid: Uuid,
    /// For directory entries: the child directory's ACL, cached so path
    /// resolution avoids an inode load per component.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir_acl: Option<Acl>,
}

/// An open-for-write holder of a file, recorded for length recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSession {
    pub inode: InodeId,
    pub session_uuid: Uuid,
    pub client: Uuid,
    pub flags: u32,
    pub create_time: UtcTime,
    pub access_time: UtcTime,
}

/// A path interpreted relative to a parent inode; `None` addresses the
/// parent itself.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PathAt {
    pub parent: InodeId,
    pub path: Option<String>,
}

impl PathAt {
    pub fn root(path: impl Into<String>) -> Self {
        Self {
            parent: InodeId::ROOT,
            path: Some(path.into()),
        }
    }

    pub fn at(parent: InodeId, path: impl Into<String>) -> Self {
        Self {
            parent,
            path: Some(path.into()),
        }
    }
}

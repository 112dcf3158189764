//! Server-side inode records: constructors, permission checks and KV
//! load/store within transactions.

use flamefs_kv::{ReadOnlyTransaction, ReadWriteTransaction};
use flamefs_layout::Layout;
use flamefs_proto::common::UserInfo;
use flamefs_proto::meta::{Acl, Inode as InodeRecord, InodeData};
use flamefs_schema as schema;
use flamefs_types::{
    make_error, make_error_msg, InodeId, MetaCode, Result, StatusCode, Status,
};

/// Requested access kind for a permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    Exec,
}

/// Check `user` against `acl` for `access`. Root bypasses everything.
pub fn check_permission(acl: &Acl, user: &UserInfo, access: AccessType) -> Result<()> {
    if user.is_root() {
        return Ok(());
    }

    let bits = if user.uid == acl.uid {
        (acl.perm >> 6) & 0o7
    } else if user.gid == acl.gid || user.gids.contains(&acl.gid) {
        (acl.perm >> 3) & 0o7
    } else {
        acl.perm & 0o7
    };

    let wanted = match access {
        AccessType::Read => 0o4,
        AccessType::Write => 0o2,
        AccessType::Exec => 0o1,
    };
    if bits & wanted != 0 {
        Ok(())
    } else {
        make_error(MetaCode::NO_PERMISSION)
    }
}

/// A server-side inode with KV operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub record: InodeRecord,
}

impl Inode {
    pub fn new_file(id: InodeId, acl: Acl, layout: Layout, now_ns: i64) -> Self {
        let dyn_stripe = layout.stripe_size;
        Self {
            record: InodeRecord {
                id,
                acl,
                nlink: 1,
                atime_ns: now_ns,
                mtime_ns: now_ns,
                ctime_ns: now_ns,
                data: InodeData::File {
                    layout,
                    length: 0,
                    truncate_version: 0,
                    flags: 0,
                    dyn_stripe,
                },
            },
        }
    }

    pub fn new_directory(
        id: InodeId,
        parent: InodeId,
        name: impl Into<String>,
        acl: Acl,
        layout: Layout,
        now_ns: i64,
    ) -> Self {
        Self {
            record: InodeRecord {
                id,
                acl,
                nlink: 1,
                atime_ns: now_ns,
                mtime_ns: now_ns,
                ctime_ns: now_ns,
                data: InodeData::Directory {
                    parent,
                    name: name.into(),
                    layout,
                    chain_alloc_counter: 0,
                    lock: None,
                },
            },
        }
    }

    pub fn new_symlink(
        id: InodeId,
        target: impl Into<String>,
        acl: Acl,
        now_ns: i64,
    ) -> Self {
        Self {
            record: InodeRecord {
                id,
                acl,
                nlink: 1,
                atime_ns: now_ns,
                mtime_ns: now_ns,
                ctime_ns: now_ns,
                data: InodeData::Symlink {
                    target: target.into(),
                },
            },
        }
    }

    pub fn id(&self) -> InodeId {
        self.record.id
    }

    pub fn is_file(&self) -> bool {
        self.record.is_file()
    }

    pub fn is_directory(&self) -> bool {
        self.record.is_directory()
    }

    pub fn is_symlink(&self) -> bool {
        self.record.is_symlink()
    }

    pub fn acl(&self) -> Acl {
        self.record.acl
    }

    pub fn check_permission(&self, user: &UserInfo, access: AccessType) -> Result<()> {
        check_permission(&self.record.acl, user, access)
    }

    /// Claim `count` chain slots from this directory's allocation counter.
    /// Returns the starting position; the counter advances so sibling files
    /// spread across the table.
    pub fn take_chain_slots(&mut self, count: u32, table_len: u32) -> Result<u32> {
        match &mut self.record.data {
            InodeData::Directory {
                chain_alloc_counter,
                ..
            } => {
                let start = *chain_alloc_counter % table_len.max(1);
                *chain_alloc_counter = chain_alloc_counter.wrapping_add(count);
                Ok(start)
            }
            _ => make_error_msg(MetaCode::NOT_DIRECTORY, "chain slots live on directories"),
        }
    }

    // -- KV operations ------------------------------------------------------

    fn pack_value(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.record).map_err(|e| {
            Status::with_message(
                StatusCode::DATA_CORRUPTION,
                format!("serialize inode {}: {}", self.id(), e),
            )
        })
    }

    pub fn unpack(key: &[u8], value: &[u8]) -> Result<Self> {
        let id = schema::parse_inode_key(key)?;
        let mut record: InodeRecord = serde_json::from_slice(value).map_err(|e| {
            Status::with_message(
                StatusCode::DATA_CORRUPTION,
                format!("deserialize inode {}: {}", id, e),
            )
        })?;
        record.id = id;
        Ok(Self { record })
    }

    /// Snapshot load: no read conflict recorded.
    pub async fn snapshot_load<T: ReadOnlyTransaction + ?Sized>(
        txn: &T,
        id: InodeId,
    ) -> Result<Option<Self>> {
        let key = schema::inode_key(id);
        match txn.snapshot_get(&key).await? {
            Some(value) => Ok(Some(Self::unpack(&key, &value)?)),
            None => Ok(None),
        }
    }

    /// Conflict-tracked load.
    pub async fn load<T: ReadOnlyTransaction + ?Sized>(
        txn: &mut T,
        id: InodeId,
    ) -> Result<Option<Self>> {
        let key = schema::inode_key(id);
        match txn.get(&key).await? {
            Some(value) => Ok(Some(Self::unpack(&key, &value)?)),
            None => Ok(None),
        }
    }

    /// Conflict-tracked load that fails with `NotFound` when absent.
    pub async fn load_required<T: ReadOnlyTransaction + ?Sized>(
        txn: &mut T,
        id: InodeId,
    ) -> Result<Self> {
        Self::load(txn, id).await?.ok_or_else(|| {
            Status::with_message(MetaCode::NOT_FOUND, format!("inode {} not found", id))
        })
    }

    pub async fn store(&self, txn: &mut dyn ReadWriteTransaction) -> Result<()> {
        if self.id().is_tree_root() && !self.is_directory() {
            return make_error_msg(
                MetaCode::FOUND_BUG,
                format!("tree root {} is not a directory", self.id()),
            );
        }
        let value = self.pack_value()?;
        txn.set(&schema::inode_key(self.id()), &value).await
    }

    pub async fn remove(&self, txn: &mut dyn ReadWriteTransaction) -> Result<()> {
        if self.id().is_tree_root() {
            return make_error_msg(MetaCode::FOUND_BUG, "cannot remove a tree root");
        }
        txn.clear(&schema::inode_key(self.id())).await
    }

    pub async fn add_read_conflict(&self, txn: &mut dyn ReadWriteTransaction) -> Result<()> {
        txn.add_read_conflict(&schema::inode_key(self.id())).await
    }
}

impl From<InodeRecord> for Inode {
    fn from(record: InodeRecord) -> Self {
        Self { record }
    }
}

impl From<Inode> for InodeRecord {
    fn from(inode: Inode) -> Self {
        inode.record
    }
}

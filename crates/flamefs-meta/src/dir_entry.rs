//! Server-side directory entries: `(parent, name) -> inode` records with
//! prefix-ordered keys for paginated listing.

use flamefs_kv::{KeySelector, ReadOnlyTransaction, ReadWriteTransaction};
use flamefs_proto::meta::{Acl, DirEntry as DirEntryRecord, InodeType};
use flamefs_schema as schema;
use flamefs_types::{InodeId, MetaCode, Result, Status, StatusCode, Uuid};

use crate::inode::Inode;

/// A directory entry with KV operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub record: DirEntryRecord,
}

impl DirEntry {
    pub fn new_file(parent: InodeId, name: String, inode_id: InodeId, uuid: Uuid) -> Self {
        Self {
            record: DirEntryRecord {
                parent,
                name,
                inode_id,
                inode_type: InodeType::File,
                uuid,
                dir_acl: None,
            },
        }
    }

    pub fn new_symlink(parent: InodeId, name: String, inode_id: InodeId, uuid: Uuid) -> Self {
        Self {
            record: DirEntryRecord {
                parent,
                name,
                inode_id,
                inode_type: InodeType::Symlink,
                uuid,
                dir_acl: None,
            },
        }
    }

    /// Directory entries cache the child directory's ACL so resolution can
    /// check traversal permission without loading the child inode.
    pub fn new_directory(
        parent: InodeId,
        name: String,
        inode_id: InodeId,
        uuid: Uuid,
        acl: Acl,
    ) -> Self {
        Self {
            record: DirEntryRecord {
                parent,
                name,
                inode_id,
                inode_type: InodeType::Directory,
                uuid,
                dir_acl: Some(acl),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn inode_id(&self) -> InodeId {
        self.record.inode_id
    }

    pub fn is_directory(&self) -> bool {
        self.record.inode_type == InodeType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.record.inode_type == InodeType::File
    }

    pub fn is_symlink(&self) -> bool {
        self.record.inode_type == InodeType::Symlink
    }

    fn key(&self) -> Vec<u8> {
        schema::dir_entry_key(self.record.parent, &self.record.name)
    }

    fn pack_value(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.record).map_err(|e| {
            Status::with_message(
                StatusCode::DATA_CORRUPTION,
                format!("serialize dir entry {}: {}", self.record.name, e),
            )
        })
    }

    pub fn unpack(key: &[u8], value: &[u8]) -> Result<Self> {
        let (parent, name) = schema::parse_dir_entry_key(key)?;
        let mut record: DirEntryRecord = serde_json::from_slice(value).map_err(|e| {
            Status::with_message(
                StatusCode::DATA_CORRUPTION,
                format!("deserialize dir entry ({}, {}): {}", parent, name, e),
            )
        })?;
        record.parent = parent;
        record.name = name;
        Ok(Self { record })
    }

    pub async fn snapshot_load<T: ReadOnlyTransaction + ?Sized>(
        txn: &T,
        parent: InodeId,
        name: &str,
    ) -> Result<Option<Self>> {
        let key = schema::dir_entry_key(parent, name);
        match txn.snapshot_get(&key).await? {
            Some(value) => Ok(Some(Self::unpack(&key, &value)?)),
            None => Ok(None),
        }
    }

    pub async fn load<T: ReadOnlyTransaction + ?Sized>(
        txn: &mut T,
        parent: InodeId,
        name: &str,
    ) -> Result<Option<Self>> {
        let key = schema::dir_entry_key(parent, name);
        match txn.get(&key).await? {
            Some(value) => Ok(Some(Self::unpack(&key, &value)?)),
            None => Ok(None),
        }
    }

    pub async fn store(&self, txn: &mut dyn ReadWriteTransaction) -> Result<()> {
        let value = self.pack_value()?;
        txn.set(&self.key(), &value).await
    }

    pub async fn remove(&self, txn: &mut dyn ReadWriteTransaction) -> Result<()> {
        txn.clear(&self.key()).await
    }

    pub async fn add_read_conflict(&self, txn: &mut dyn ReadWriteTransaction) -> Result<()> {
        txn.add_read_conflict(&self.key()).await
    }

    /// Load the inode this entry points to.
    pub async fn snapshot_load_inode<T: ReadOnlyTransaction + ?Sized>(
        &self,
        txn: &T,
    ) -> Result<Inode> {
        Inode::snapshot_load(txn, self.record.inode_id)
            .await?
            .ok_or_else(|| {
                Status::with_message(
                    MetaCode::INCONSISTENT,
                    format!(
                        "entry {} points to missing inode {}",
                        self.record.name, self.record.inode_id
                    ),
                )
            })
    }
}

/// A page of directory entries.
#[derive(Debug)]
pub struct DirEntryList {
    pub entries: Vec<DirEntry>,
    pub inodes: Vec<Inode>,
    pub more: bool,
}

impl DirEntryList {
    /// Load up to `limit` entries of `parent` strictly after name `prev`
    /// (empty `prev` starts from the beginning). When `load_inodes` is set,
    /// the target inode of each entry is loaded alongside.
    pub async fn snapshot_load<T: ReadOnlyTransaction + ?Sized>(
        txn: &T,
        parent: InodeId,
        prev: &str,
        limit: i32,
        load_inodes: bool,
    ) -> Result<Self> {
        let prefix = schema::dir_entry_prefix(parent);
        let begin_key = if prev.is_empty() {
            prefix.clone()
        } else {
            flamefs_kv::key_after(&schema::dir_entry_key(parent, prev))
        };
        let end_key = flamefs_kv::prefix_list_end_key(&prefix);

        let begin = KeySelector::new(begin_key, true);
        let end = KeySelector::new(end_key, false);

        // One extra row decides `more` without a second scan.
        let limit = limit.max(1);
        let result = txn
            .snapshot_get_range(&begin, &end, limit.saturating_add(1))
            .await?;

        let more = result.kvs.len() > limit as usize;
        let take = result.kvs.len().min(limit as usize);
        let mut entries = Vec::with_capacity(take);
        for kv in result.kvs.iter().take(take) {
            entries.push(DirEntry::unpack(&kv.key, &kv.value)?);
        }

        let mut inodes = Vec::new();
        if load_inodes {
            inodes.reserve(entries.len());
            for entry in &entries {
                inodes.push(entry.snapshot_load_inode(txn).await?);
            }
        }

        Ok(Self {
            entries,
            inodes,
            more,
        })
    }

    /// Whether `parent` has no entries at all.
    pub async fn check_empty<T: ReadOnlyTransaction + ?Sized>(
        txn: &T,
        parent: InodeId,
    ) -> Result<bool> {
        let prefix = schema::dir_entry_prefix(parent);
        let begin = KeySelector::new(prefix.clone(), true);
        let end = KeySelector::new(flamefs_kv::prefix_list_end_key(&prefix), false);
        let result = txn.snapshot_get_range(&begin, &end, 1).await?;
        Ok(result.kvs.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flamefs_kv::KvEngine;
    use flamefs_kv_backends::MemKvEngine;
    use flamefs_proto::meta::Acl;
    use flamefs_types::{Gid, Uid};

    fn entry(parent: u64, name: &str, inode: u64) -> DirEntry {
        DirEntry::new_file(
            InodeId(parent),
            name.to_string(),
            InodeId(inode),
            Uuid::new(1, inode),
        )
    }

    #[test]
    fn test_pack_unpack_roundtrip() {
        let e = entry(7, "data.bin", 99);
        let key = e.key();
        let value = e.pack_value().unwrap();
        assert_eq!(DirEntry::unpack(&key, &value).unwrap(), e);
    }

    #[test]
    fn test_directory_entry_carries_acl() {
        let acl = Acl::new(Uid(5), Gid(6), 0o750);
        let e = DirEntry::new_directory(InodeId(1), "sub".into(), InodeId(2), Uuid::ZERO, acl);
        let restored = DirEntry::unpack(&e.key(), &e.pack_value().unwrap()).unwrap();
        assert_eq!(restored.record.dir_acl, Some(acl));
        assert!(restored.is_directory());
    }

    #[tokio::test]
    async fn test_store_and_list_pages() {
        let engine = MemKvEngine::new();
        let mut txn = engine.create_readwrite_transaction();
        for i in 0..5u64 {
            entry(1, &format!("f{}", i), 100 + i)
                .store(&mut txn)
                .await
                .unwrap();
        }
        // An entry in a sibling directory must not leak into the page.
        entry(2, "other", 999).store(&mut txn).await.unwrap();
        txn.commit().await.unwrap();

        let txn = engine.create_readonly_transaction();
        let page1 = DirEntryList::snapshot_load(&txn, InodeId(1), "", 3, false)
            .await
            .unwrap();
        assert_eq!(page1.entries.len(), 3);
        assert!(page1.more);
        assert_eq!(page1.entries[0].name(), "f0");

        let cursor = page1.entries.last().unwrap().name();
        let page2 = DirEntryList::snapshot_load(&txn, InodeId(1), cursor, 3, false)
            .await
            .unwrap();
        assert_eq!(page2.entries.len(), 2);
        assert!(!page2.more);
        assert_eq!(page2.entries[0].name(), "f3");
    }

    #[tokio::test]
    async fn test_check_empty() {
        let engine = MemKvEngine::new();
        let txn = engine.create_readonly_transaction();
        assert!(DirEntryList::check_empty(&txn, InodeId(1)).await.unwrap());

        let mut txn = engine.create_readwrite_transaction();
        entry(1, "x", 2).store(&mut txn).await.unwrap();
        txn.commit().await.unwrap();

        let txn = engine.create_readonly_transaction();
        assert!(!DirEntryList::check_empty(&txn, InodeId(1)).await.unwrap());
        assert!(DirEntryList::check_empty(&txn, InodeId(9)).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove() {
        let engine = MemKvEngine::new();
        let e = entry(1, "gone", 5);
        let mut txn = engine.create_readwrite_transaction();
        e.store(&mut txn).await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = engine.create_readwrite_transaction();
        e.remove(&mut txn).await.unwrap();
        txn.commit().await.unwrap();

        let txn = engine.create_readonly_transaction();
        assert!(DirEntry::snapshot_load(&txn, InodeId(1), "gone")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_missing_inode_is_inconsistent() {
        let engine = MemKvEngine::new();
        let e = entry(1, "dangling", 404);
        let mut txn = engine.create_readwrite_transaction();
        e.store(&mut txn).await.unwrap();
        txn.commit().await.unwrap();

        let txn = engine.create_readonly_transaction();
        let err = e.snapshot_load_inode(&txn).await.unwrap_err();
        assert_eq!(err.code(), MetaCode::INCONSISTENT);
    }
}

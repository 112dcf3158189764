//! File sessions: open-for-write holders recorded in the KV store so a
//! crashed client's length updates can be recovered and its inodes
//! eventually collected.

use flamefs_kv::{KeySelector, ReadOnlyTransaction, ReadWriteTransaction};
use flamefs_proto::meta::FileSession as FileSessionRecord;
use flamefs_schema as schema;
use flamefs_types::{InodeId, Result, Status, StatusCode, UtcTime, Uuid};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSession {
    pub record: FileSessionRecord,
}

impl FileSession {
    pub fn new(inode: InodeId, session_uuid: Uuid, client: Uuid, flags: u32) -> Self {
        let now = UtcTime::now();
        Self {
            record: FileSessionRecord {
                inode,
                session_uuid,
                client,
                flags,
                create_time: now,
                access_time: now,
            },
        }
    }

    fn key(&self) -> Vec<u8> {
        schema::file_session_key(self.record.inode, self.record.session_uuid)
    }

    pub fn unpack(value: &[u8]) -> Result<Self> {
        let record = serde_json::from_slice(value).map_err(|e| {
            Status::with_message(
                StatusCode::DATA_CORRUPTION,
                format!("deserialize file session: {}", e),
            )
        })?;
        Ok(Self { record })
    }

    pub async fn load<T: ReadOnlyTransaction + ?Sized>(
        txn: &mut T,
        inode: InodeId,
        session_uuid: Uuid,
    ) -> Result<Option<Self>> {
        let key = schema::file_session_key(inode, session_uuid);
        match txn.get(&key).await? {
            Some(value) => Ok(Some(Self::unpack(&value)?)),
            None => Ok(None),
        }
    }

    pub async fn store(&self, txn: &mut dyn ReadWriteTransaction) -> Result<()> {
        let value = serde_json::to_vec(&self.record).map_err(|e| {
            Status::with_message(
                StatusCode::DATA_CORRUPTION,
                format!("serialize file session: {}", e),
            )
        })?;
        txn.set(&self.key(), &value).await
    }

    pub async fn remove(&self, txn: &mut dyn ReadWriteTransaction) -> Result<()> {
        txn.clear(&self.key()).await
    }

    /// All sessions currently open on `inode`.
    pub async fn scan<T: ReadOnlyTransaction + ?Sized>(
        txn: &T,
        inode: InodeId,
    ) -> Result<Vec<FileSession>> {
        let prefix = schema::file_session_prefix(inode);
        let begin = KeySelector::new(prefix.clone(), true);
        let end = KeySelector::new(flamefs_kv::prefix_list_end_key(&prefix), false);
        let result = txn.snapshot_get_range(&begin, &end, i32::MAX).await?;
        result.kvs.iter().map(|kv| Self::unpack(&kv.value)).collect()
    }

    /// Whether `inode` has any open session.
    pub async fn any_open<T: ReadOnlyTransaction + ?Sized>(
        txn: &T,
        inode: InodeId,
    ) -> Result<bool> {
        let prefix = schema::file_session_prefix(inode);
        let begin = KeySelector::new(prefix.clone(), true);
        let end = KeySelector::new(flamefs_kv::prefix_list_end_key(&prefix), false);
        let result = txn.snapshot_get_range(&begin, &end, 1).await?;
        Ok(!result.kvs.is_empty())
    }
}

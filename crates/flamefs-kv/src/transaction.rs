use async_trait::async_trait;
use flamefs_types::Result;

/// Key-value pair returned from range reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Range-query endpoint: a key plus whether it is included in the range.
#[derive(Debug, Clone)]
pub struct KeySelector {
    pub key: Vec<u8>,
    pub inclusive: bool,
}

impl KeySelector {
    pub fn new(key: impl Into<Vec<u8>>, inclusive: bool) -> Self {
        Self {
            key: key.into(),
            inclusive,
        }
    }
}

/// Result of a range query.
#[derive(Debug)]
pub struct GetRangeResult {
    pub kvs: Vec<KeyValue>,
    pub has_more: bool,
}

/// 10-byte commit stamp: 8 bytes big-endian commit version followed by a
/// 2-byte big-endian intra-transaction sequence. Strictly monotonic across
/// committed transactions.
pub type Versionstamp = [u8; 10];

/// Build a versionstamp from a commit version and intra-transaction sequence.
pub fn versionstamp_from_parts(version: i64, seq: u16) -> Versionstamp {
    let mut stamp = [0u8; 10];
    stamp[..8].copy_from_slice(&version.to_be_bytes());
    stamp[8..].copy_from_slice(&seq.to_be_bytes());
    stamp
}

/// Extract the commit version half of a versionstamp.
pub fn versionstamp_version(stamp: &Versionstamp) -> i64 {
    i64::from_be_bytes(stamp[..8].try_into().unwrap())
}

/// Snapshot-isolated read transaction.
///
/// `get`/`get_range` on a read-write transaction additionally record read
/// conflicts; on a read-only transaction they degrade to snapshot reads.
#[async_trait]
pub trait ReadOnlyTransaction: Send + Sync {
    /// Pin the snapshot to a specific engine version.
    fn set_read_version(&mut self, version: i64);

    async fn snapshot_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    async fn snapshot_get_range(
        &self,
        begin: &KeySelector,
        end: &KeySelector,
        limit: i32,
    ) -> Result<GetRangeResult>;

    async fn get_range(
        &mut self,
        begin: &KeySelector,
        end: &KeySelector,
        limit: i32,
    ) -> Result<GetRangeResult>;

    async fn cancel(&mut self) -> Result<()>;

    fn reset(&mut self);
}

/// Serializable read-write transaction with optimistic conflict detection.
#[async_trait]
pub trait ReadWriteTransaction: ReadOnlyTransaction {
    async fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    async fn clear(&mut self, key: &[u8]) -> Result<()>;

    /// Declare a read-conflict point without reading.
    async fn add_read_conflict(&mut self, key: &[u8]) -> Result<()>;

    /// Declare a read-conflict range `[begin, end)` without reading.
    async fn add_read_conflict_range(&mut self, begin: &[u8], end: &[u8]) -> Result<()>;

    /// Write `value` under `key` with the commit versionstamp spliced into
    /// the key at byte `offset`. The stamp bytes are filled at commit time.
    async fn set_versionstamped_key(&mut self, key: &[u8], offset: u32, value: &[u8])
        -> Result<()>;

    /// Write `value` under `key` with the commit versionstamp spliced into
    /// the value at byte `offset`.
    async fn set_versionstamped_value(
        &mut self,
        key: &[u8],
        value: &[u8],
        offset: u32,
    ) -> Result<()>;

    /// Commit. Fails with `Txn::Conflict` when any key in the read set was
    /// modified after this transaction's read version.
    async fn commit(&mut self) -> Result<()>;

    /// The version assigned by a successful commit, `-1` before commit.
    fn get_committed_version(&self) -> i64;

    /// The first versionstamp assigned by a successful commit, if any
    /// versionstamped operation was staged.
    fn get_committed_versionstamp(&self) -> Option<Versionstamp>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versionstamp_parts() {
        let stamp = versionstamp_from_parts(0x0102_0304_0506_0708, 0x0A0B);
        assert_eq!(stamp[..8], [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(stamp[8..], [0x0A, 0x0B]);
        assert_eq!(versionstamp_version(&stamp), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_versionstamp_ordering_matches_version() {
        let a = versionstamp_from_parts(1, 0);
        let b = versionstamp_from_parts(2, 0);
        let c = versionstamp_from_parts(2, 1);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_key_selector() {
        let ks = KeySelector::new(b"k".to_vec(), true);
        assert_eq!(ks.key, b"k");
        assert!(ks.inclusive);
    }
}

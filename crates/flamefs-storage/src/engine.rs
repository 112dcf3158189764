//! Local chunk engine contract and the in-memory implementation.
//!
//! The on-disk engine is opaque to the rest of the system; this trait is
//! its surface. A chunk carries a chain version, a committed version with
//! checksummed data, and at most one uncommitted update at a time.

use dashmap::DashMap;
use flamefs_layout::ChunkId;
use flamefs_proto::storage::{ChunkMeta, UpdateId};
use flamefs_types::{
    make_error_msg, ChainVer, ChunkVer, Result, StatusCode, StorageCode, UtcTime,
};

/// Outcome of a local write: the tentative version assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub version: ChunkVer,
    /// Set when the update id had already been applied (a retransmit).
    pub replayed: bool,
}

/// Committed read result.
#[derive(Debug, Clone)]
pub struct ReadOutcome {
    pub data: Vec<u8>,
    pub version: ChunkVer,
    /// An uncommitted newer update exists on this replica.
    pub has_uncommitted: bool,
}

/// Local chunk storage for one target.
///
/// `write` stages an uncommitted update; `commit` publishes it. The engine
/// never serves uncommitted data.
pub trait ChunkEngine: Send + Sync {
    /// Read committed bytes `[offset, offset+length)`. Short reads past the
    /// committed length return the available bytes.
    fn read(&self, chunk_id: ChunkId, offset: u32, length: u32) -> Result<ReadOutcome>;

    /// Stage `data` at `offset` over the committed image, assigning
    /// `committed_version + 1`. A second distinct update while one is
    /// staged is refused; restaging the same `update_id` is a no-op.
    #[allow(clippy::too_many_arguments)]
    fn write(
        &self,
        chunk_id: ChunkId,
        offset: u32,
        data: &[u8],
        chunk_size: u32,
        chain_version: ChainVer,
        update_id: UpdateId,
    ) -> Result<WriteOutcome>;

    /// Publish the staged update as `version`. Committing an already
    /// committed version is a no-op.
    fn commit(&self, chunk_id: ChunkId, version: ChunkVer) -> Result<()>;

    /// Drop a chunk entirely.
    fn remove(&self, chunk_id: ChunkId) -> Result<()>;

    /// Metadata of chunks in `[begin, end)`, ascending by id, at most
    /// `limit`.
    fn list_meta(&self, begin: ChunkId, end: ChunkId, limit: usize)
        -> Result<Vec<(ChunkId, ChunkMeta)>>;

    /// Metadata of one chunk.
    fn meta(&self, chunk_id: ChunkId) -> Result<Option<ChunkMeta>>;

    /// Full committed image of a chunk (resync source side).
    fn committed_image(&self, chunk_id: ChunkId) -> Result<Option<(ChunkVer, Vec<u8>)>>;

    /// Install a committed image wholesale (resync sink side).
    fn install_image(
        &self,
        chunk_id: ChunkId,
        chain_version: ChainVer,
        version: ChunkVer,
        data: Vec<u8>,
    ) -> Result<()>;

    /// Drop staged updates older than `max_age`; the chain protocol
    /// retransmits anything still wanted.
    fn reclaim_stale_uncommitted(&self, max_age: std::time::Duration) -> usize;
}

struct Committed {
    version: ChunkVer,
    data: Vec<u8>,
    checksum: u32,
}

struct Staged {
    version: ChunkVer,
    data: Vec<u8>,
    update_id: UpdateId,
    staged_at: UtcTime,
}

#[derive(Default)]
struct Record {
    chain_version: ChainVer,
    committed: Option<Committed>,
    staged: Option<Staged>,
}

impl Record {
    fn meta(&self) -> ChunkMeta {
        ChunkMeta {
            chain_version: self.chain_version,
            chunk_version: self
                .committed
                .as_ref()
                .map(|c| c.version)
                .unwrap_or(ChunkVer(0)),
            checksum: self.committed.as_ref().map(|c| c.checksum).unwrap_or(0),
            uncommitted: self.staged.is_some(),
            length: self.committed.as_ref().map(|c| c.data.len() as u32).unwrap_or(0),
        }
    }
}

/// In-memory chunk engine backed by a concurrent map. Stands in for the
/// disk engine in tests and single-process deployments.
#[derive(Default)]
pub struct MemChunkEngine {
    chunks: DashMap<ChunkId, Record>,
}

impl MemChunkEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

impl ChunkEngine for MemChunkEngine {
    fn read(&self, chunk_id: ChunkId, offset: u32, length: u32) -> Result<ReadOutcome> {
        let record = self.chunks.get(&chunk_id).ok_or_else(|| {
            flamefs_types::Status::with_message(
                StorageCode::CHUNK_NOT_FOUND,
                format!("chunk {} not found", chunk_id),
            )
        })?;
        let has_uncommitted = record.staged.is_some();
        let Some(committed) = &record.committed else {
            return Ok(ReadOutcome {
                data: Vec::new(),
                version: ChunkVer(0),
                has_uncommitted,
            });
        };
        let start = (offset as usize).min(committed.data.len());
        let end = (offset as usize + length as usize).min(committed.data.len());
        Ok(ReadOutcome {
            data: committed.data[start..end].to_vec(),
            version: committed.version,
            has_uncommitted,
        })
    }

    fn write(
        &self,
        chunk_id: ChunkId,
        offset: u32,
        data: &[u8],
        chunk_size: u32,
        chain_version: ChainVer,
        update_id: UpdateId,
    ) -> Result<WriteOutcome> {
        let end = offset as usize + data.len();
        if end > chunk_size as usize {
            return make_error_msg(
                StorageCode::CHUNK_SIZE_MISMATCH,
                format!("write past chunk capacity ({} > {})", end, chunk_size),
            );
        }

        let mut record = self.chunks.entry(chunk_id).or_default();
        record.chain_version = chain_version;

        if let Some(staged) = &record.staged {
            if staged.update_id == update_id {
                // Retransmit of the in-flight update.
                return Ok(WriteOutcome {
                    version: staged.version,
                    replayed: true,
                });
            }
            return make_error_msg(
                StorageCode::CHUNK_NOT_COMMIT,
                format!("chunk {} already has a staged update", chunk_id),
            );
        }

        // New image: committed bytes with the update applied over them.
        let mut image = record
            .committed
            .as_ref()
            .map(|c| c.data.clone())
            .unwrap_or_default();
        if end > image.len() {
            image.resize(end, 0);
        }
        image[offset as usize..end].copy_from_slice(data);

        let version = ChunkVer(
            record
                .committed
                .as_ref()
                .map(|c| c.version.0)
                .unwrap_or(0)
                + 1,
        );
        record.staged = Some(Staged {
            version,
            data: image,
            update_id,
            staged_at: UtcTime::now(),
        });
        Ok(WriteOutcome {
            version,
            replayed: false,
        })
    }

    fn commit(&self, chunk_id: ChunkId, version: ChunkVer) -> Result<()> {
        let mut record = self.chunks.get_mut(&chunk_id).ok_or_else(|| {
            flamefs_types::Status::with_message(
                StorageCode::CHUNK_NOT_FOUND,
                format!("chunk {} not found", chunk_id),
            )
        })?;

        if record
            .committed
            .as_ref()
            .is_some_and(|c| c.version >= version)
        {
            // Duplicate ack.
            return Ok(());
        }
        let Some(staged) = record.staged.take() else {
            return make_error_msg(
                StorageCode::CHUNK_MISSING_UPDATE,
                format!("no staged update on chunk {}", chunk_id),
            );
        };
        if staged.version != version {
            // Put it back; the ack was for something else.
            let staged_version = staged.version;
            record.staged = Some(staged);
            return make_error_msg(
                StorageCode::CHUNK_VERSION_MISMATCH,
                format!(
                    "commit for version {} but staged {}",
                    version, staged_version
                ),
            );
        }
        let checksum = crc32c::crc32c(&staged.data);
        record.committed = Some(Committed {
            version: staged.version,
            data: staged.data,
            checksum,
        });
        Ok(())
    }

    fn remove(&self, chunk_id: ChunkId) -> Result<()> {
        self.chunks.remove(&chunk_id);
        Ok(())
    }

    fn list_meta(
        &self,
        begin: ChunkId,
        end: ChunkId,
        limit: usize,
    ) -> Result<Vec<(ChunkId, ChunkMeta)>> {
        let mut items: Vec<(ChunkId, ChunkMeta)> = self
            .chunks
            .iter()
            .filter(|r| *r.key() >= begin && *r.key() < end)
            .map(|r| (*r.key(), r.value().meta()))
            .collect();
        items.sort_by_key(|(id, _)| *id);
        items.truncate(limit);
        Ok(items)
    }

    fn meta(&self, chunk_id: ChunkId) -> Result<Option<ChunkMeta>> {
        Ok(self.chunks.get(&chunk_id).map(|r| r.meta()))
    }

    fn committed_image(&self, chunk_id: ChunkId) -> Result<Option<(ChunkVer, Vec<u8>)>> {
        Ok(self
            .chunks
            .get(&chunk_id)
            .and_then(|r| r.committed.as_ref().map(|c| (c.version, c.data.clone()))))
    }

    fn install_image(
        &self,
        chunk_id: ChunkId,
        chain_version: ChainVer,
        version: ChunkVer,
        data: Vec<u8>,
    ) -> Result<()> {
        if version == ChunkVer(0) {
            return make_error_msg(StatusCode::INVALID_ARG, "cannot install version zero");
        }
        let mut record = self.chunks.entry(chunk_id).or_default();
        if record
            .committed
            .as_ref()
            .is_some_and(|c| c.version >= version)
        {
            return Ok(());
        }
        let checksum = crc32c::crc32c(&data);
        record.chain_version = chain_version;
        record.committed = Some(Committed {
            version,
            data,
            checksum,
        });
        Ok(())
    }

    fn reclaim_stale_uncommitted(&self, max_age: std::time::Duration) -> usize {
        let mut reclaimed = 0;
        for mut record in self.chunks.iter_mut() {
            if record
                .staged
                .as_ref()
                .is_some_and(|s| s.staged_at.expired(max_age))
            {
                record.staged = None;
                reclaimed += 1;
            }
        }
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flamefs_types::InodeId;

    const CHUNK_SIZE: u32 = 1 << 20;

    fn chunk(i: u32) -> ChunkId {
        ChunkId::for_file(InodeId(1), i)
    }

    fn update(n: u32) -> UpdateId {
        UpdateId::new(
            flamefs_types::Uuid::new(1, 1),
            flamefs_types::Uuid::new(2, 2),
            n,
        )
    }

    #[test]
    fn test_write_commit_read() {
        let engine = MemChunkEngine::new();
        let out = engine
            .write(chunk(0), 0, b"hello", CHUNK_SIZE, ChainVer(1), update(0))
            .unwrap();
        assert_eq!(out.version, ChunkVer(1));
        assert!(!out.replayed);

        // Uncommitted data is not served.
        let read = engine.read(chunk(0), 0, 16).unwrap();
        assert!(read.data.is_empty());
        assert!(read.has_uncommitted);

        engine.commit(chunk(0), ChunkVer(1)).unwrap();
        let read = engine.read(chunk(0), 0, 16).unwrap();
        assert_eq!(read.data, b"hello");
        assert_eq!(read.version, ChunkVer(1));
        assert!(!read.has_uncommitted);
    }

    #[test]
    fn test_versions_increment() {
        let engine = MemChunkEngine::new();
        for i in 0..3 {
            let out = engine
                .write(chunk(0), 0, b"x", CHUNK_SIZE, ChainVer(1), update(i))
                .unwrap();
            assert_eq!(out.version, ChunkVer(i + 1));
            engine.commit(chunk(0), out.version).unwrap();
        }
    }

    #[test]
    fn test_second_staged_update_refused() {
        let engine = MemChunkEngine::new();
        engine
            .write(chunk(0), 0, b"a", CHUNK_SIZE, ChainVer(1), update(0))
            .unwrap();
        let err = engine
            .write(chunk(0), 0, b"b", CHUNK_SIZE, ChainVer(1), update(1))
            .unwrap_err();
        assert_eq!(err.code(), StorageCode::CHUNK_NOT_COMMIT);
    }

    #[test]
    fn test_same_update_replays() {
        let engine = MemChunkEngine::new();
        let first = engine
            .write(chunk(0), 0, b"a", CHUNK_SIZE, ChainVer(1), update(0))
            .unwrap();
        let again = engine
            .write(chunk(0), 0, b"a", CHUNK_SIZE, ChainVer(1), update(0))
            .unwrap();
        assert!(again.replayed);
        assert_eq!(again.version, first.version);
    }

    #[test]
    fn test_commit_is_idempotent() {
        let engine = MemChunkEngine::new();
        let out = engine
            .write(chunk(0), 0, b"a", CHUNK_SIZE, ChainVer(1), update(0))
            .unwrap();
        engine.commit(chunk(0), out.version).unwrap();
        engine.commit(chunk(0), out.version).unwrap();
    }

    #[test]
    fn test_commit_without_staged_fails() {
        let engine = MemChunkEngine::new();
        let out = engine
            .write(chunk(0), 0, b"a", CHUNK_SIZE, ChainVer(1), update(0))
            .unwrap();
        engine.commit(chunk(0), out.version).unwrap();
        let err = engine.commit(chunk(0), ChunkVer(5)).unwrap_err();
        assert_eq!(err.code(), StorageCode::CHUNK_MISSING_UPDATE);
    }

    #[test]
    fn test_write_past_capacity() {
        let engine = MemChunkEngine::new();
        let err = engine
            .write(chunk(0), 10, &[0u8; 16], 16, ChainVer(1), update(0))
            .unwrap_err();
        assert_eq!(err.code(), StorageCode::CHUNK_SIZE_MISMATCH);
    }

    #[test]
    fn test_partial_overwrite_preserves_rest() {
        let engine = MemChunkEngine::new();
        let out = engine
            .write(chunk(0), 0, b"aaaaaaaa", CHUNK_SIZE, ChainVer(1), update(0))
            .unwrap();
        engine.commit(chunk(0), out.version).unwrap();
        let out = engine
            .write(chunk(0), 2, b"bb", CHUNK_SIZE, ChainVer(1), update(1))
            .unwrap();
        engine.commit(chunk(0), out.version).unwrap();

        let read = engine.read(chunk(0), 0, 8).unwrap();
        assert_eq!(read.data, b"aabbaaaa");
    }

    #[test]
    fn test_checksum_tracks_committed_data() {
        let engine = MemChunkEngine::new();
        let out = engine
            .write(chunk(0), 0, b"payload", CHUNK_SIZE, ChainVer(1), update(0))
            .unwrap();
        engine.commit(chunk(0), out.version).unwrap();
        let meta = engine.meta(chunk(0)).unwrap().unwrap();
        assert_eq!(meta.checksum, crc32c::crc32c(b"payload"));
        assert_eq!(meta.length, 7);
        assert!(!meta.uncommitted);
    }

    #[test]
    fn test_list_meta_range_and_order() {
        let engine = MemChunkEngine::new();
        for i in [3u32, 0, 2, 1] {
            let out = engine
                .write(chunk(i), 0, b"x", CHUNK_SIZE, ChainVer(1), update(i))
                .unwrap();
            engine.commit(chunk(i), out.version).unwrap();
        }
        let listed = engine.list_meta(chunk(1), chunk(3), 10).unwrap();
        let ids: Vec<u32> = listed.iter().map(|(id, _)| id.index()).collect();
        assert_eq!(ids, vec![1, 2]);

        let limited = engine.list_meta(chunk(0), chunk(4), 2).unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].0.index(), 0);
    }

    #[test]
    fn test_remove_and_missing_read() {
        let engine = MemChunkEngine::new();
        let out = engine
            .write(chunk(0), 0, b"x", CHUNK_SIZE, ChainVer(1), update(0))
            .unwrap();
        engine.commit(chunk(0), out.version).unwrap();
        engine.remove(chunk(0)).unwrap();
        // Removing again is a no-op, reads report the chunk missing.
        engine.remove(chunk(0)).unwrap();
        let err = engine.read(chunk(0), 0, 1).unwrap_err();
        assert_eq!(err.code(), StorageCode::CHUNK_NOT_FOUND);
    }

    #[test]
    fn test_install_image() {
        let engine = MemChunkEngine::new();
        engine
            .install_image(chunk(0), ChainVer(2), ChunkVer(7), b"synced".to_vec())
            .unwrap();
        let read = engine.read(chunk(0), 0, 16).unwrap();
        assert_eq!(read.data, b"synced");
        assert_eq!(read.version, ChunkVer(7));

        // Older images never clobber newer state.
        engine
            .install_image(chunk(0), ChainVer(2), ChunkVer(3), b"old".to_vec())
            .unwrap();
        assert_eq!(engine.read(chunk(0), 0, 16).unwrap().data, b"synced");
    }

    #[test]
    fn test_reclaim_stale_uncommitted() {
        let engine = MemChunkEngine::new();
        engine
            .write(chunk(0), 0, b"a", CHUNK_SIZE, ChainVer(1), update(0))
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert_eq!(engine.reclaim_stale_uncommitted(std::time::Duration::ZERO), 1);
        // The slate is clean for a retransmitted update.
        engine
            .write(chunk(0), 0, b"a", CHUNK_SIZE, ChainVer(1), update(0))
            .unwrap();
    }
}

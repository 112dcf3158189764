//! Storage service messages: batched chunk I/O, chain forwarding and
//! commit acknowledgements, chunk removal and queries.

use flamefs_layout::ChunkId;
use flamefs_types::{ChainId, ChainVer, ChunkVer, StatusCode, Uuid};
use serde::{Deserialize, Serialize};

/// Identity of one write, stable across retries. Derived from the client,
/// the request and the sub-op index so a replayed batch deduplicates at the
/// chain head. Ordering follows the derivation tuple.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct UpdateId {
    pub client: Uuid,
    pub request: Uuid,
    pub sub_op: u32,
}

impl UpdateId {
    pub fn new(client: Uuid, request: Uuid, sub_op: u32) -> Self {
        Self {
            client,
            request,
            sub_op,
        }
    }
}

/// Per-chunk metadata as reported by a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub chain_version: ChainVer,
    pub chunk_version: ChunkVer,
    pub checksum: u32,
    pub uncommitted: bool,
    pub length: u32,
}

// ---- batchRead ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadIo {
    pub chunk_id: ChunkId,
    pub offset: u32,
    pub length: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReadReq {
    pub chain_id: ChainId,
    /// Newest chain version the client knows; replies tagged older are
    /// rejected client-side.
    pub chain_version: ChainVer,
    pub ios: Vec<ReadIo>,
}

/// Outcome of one read io. `code == 0` means success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadIoResult {
    pub code: u16,
    pub message: Option<String>,
    pub data: Vec<u8>,
    pub chunk_version: ChunkVer,
}

impl ReadIoResult {
    pub fn ok(data: Vec<u8>, chunk_version: ChunkVer) -> Self {
        Self {
            code: StatusCode::OK,
            message: None,
            data,
            chunk_version,
        }
    }

    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
            data: Vec::new(),
            chunk_version: ChunkVer(0),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::OK
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReadRsp {
    pub chain_version: ChainVer,
    pub results: Vec<ReadIoResult>,
}

// ---- batchWrite ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteIo {
    pub chunk_id: ChunkId,
    pub offset: u32,
    pub data: Vec<u8>,
    /// Capacity of the chunk; writes beyond it are rejected.
    pub chunk_size: u32,
    pub update_id: UpdateId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchWriteReq {
    pub chain_id: ChainId,
    pub chain_version: ChainVer,
    pub ios: Vec<WriteIo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteIoResult {
    pub code: u16,
    pub message: Option<String>,
    pub bytes_written: u32,
    pub chunk_version: ChunkVer,
}

impl WriteIoResult {
    pub fn ok(bytes_written: u32, chunk_version: ChunkVer) -> Self {
        Self {
            code: StatusCode::OK,
            message: None,
            bytes_written,
            chunk_version,
        }
    }

    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
            bytes_written: 0,
            chunk_version: ChunkVer(0),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::OK
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchWriteRsp {
    pub chain_version: ChainVer,
    pub results: Vec<WriteIoResult>,
}

// ---- forwardUpdate (head/middle -> successor) ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardUpdateReq {
    pub chain_id: ChainId,
    pub chain_version: ChainVer,
    pub chunk_id: ChunkId,
    pub offset: u32,
    pub data: Vec<u8>,
    pub chunk_size: u32,
    /// Version the head assigned tentatively; every replica stores the same
    /// one.
    pub chunk_version: ChunkVer,
    pub update_id: UpdateId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardUpdateRsp {
    /// The version the tail committed; propagates back up the chain.
    pub commit_version: ChunkVer,
}

// ---- commitUpdate (ack from successor / resync commit) ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitUpdateReq {
    pub chain_id: ChainId,
    pub chain_version: ChainVer,
    pub chunk_id: ChunkId,
    pub chunk_version: ChunkVer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitUpdateRsp {}

// ---- removeChunks ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveChunksReq {
    /// Identity for idempotent replay; reapplying a completed removal is a
    /// no-op.
    pub request_uuid: Uuid,
    pub chain_id: ChainId,
    pub chain_version: ChainVer,
    /// Chunk-id range `[begin, end)`.
    pub begin: ChunkId,
    pub end: ChunkId,
    pub max_remove: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveChunksRsp {
    pub removed: u32,
    pub more: bool,
}

// ---- queryChunk ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryChunkReq {
    pub chain_id: ChainId,
    pub chunk_id: ChunkId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryChunkRsp {
    pub meta: Option<ChunkMeta>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use flamefs_types::InodeId;

    #[test]
    fn test_update_id_ordering() {
        let client = Uuid::new(1, 1);
        let request = Uuid::new(2, 2);
        let a = UpdateId::new(client, request, 0);
        let b = UpdateId::new(client, request, 1);
        assert!(a < b);
    }

    #[test]
    fn test_read_result_constructors() {
        let ok = ReadIoResult::ok(vec![1, 2], ChunkVer(3));
        assert!(ok.is_ok());
        assert_eq!(ok.chunk_version, ChunkVer(3));

        let err = ReadIoResult::error(StatusCode::IO_ERROR, "boom");
        assert!(!err.is_ok());
        assert_eq!(err.code, StatusCode::IO_ERROR);
    }

    #[test]
    fn test_write_req_serde() {
        let req = BatchWriteReq {
            chain_id: ChainId(1),
            chain_version: ChainVer(2),
            ios: vec![WriteIo {
                chunk_id: ChunkId::for_file(InodeId(7), 0),
                offset: 0,
                data: vec![0xAB; 8],
                chunk_size: 1 << 20,
                update_id: UpdateId::default(),
            }],
        };
        let json = serde_json::to_string(&req).unwrap();
        let parsed: BatchWriteReq = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.ios[0].chunk_id, req.ios[0].chunk_id);
    }
}

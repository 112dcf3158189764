use std::fmt;

use flamefs_types::InodeId;
use serde::{Deserialize, Serialize};

/// 16-byte chunk address, big-endian components:
///
/// ```text
/// tenant(1) | reserved(1) | inode(8) | track(2) | chunk_index(4)
/// ```
///
/// Byte-wise lexicographic order equals (tenant, inode, track, index) order,
/// so sequential file offsets produce sequential keys and a file's chunks
/// form one contiguous key range.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkId([u8; 16]);

impl ChunkId {
    pub fn new(tenant: u8, inode: InodeId, track: u16, index: u32) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0] = tenant;
        // bytes[1] reserved, always zero.
        bytes[2..10].copy_from_slice(&inode.0.to_be_bytes());
        bytes[10..12].copy_from_slice(&track.to_be_bytes());
        bytes[12..16].copy_from_slice(&index.to_be_bytes());
        Self(bytes)
    }

    /// Address for a single-track file chunk (tenant 0, track 0).
    pub fn for_file(inode: InodeId, index: u32) -> Self {
        Self::new(0, inode, 0, index)
    }

    pub fn tenant(&self) -> u8 {
        self.0[0]
    }

    pub fn inode(&self) -> InodeId {
        InodeId(u64::from_be_bytes(self.0[2..10].try_into().unwrap()))
    }

    pub fn track(&self) -> u16 {
        u16::from_be_bytes(self.0[10..12].try_into().unwrap())
    }

    pub fn index(&self) -> u32 {
        u32::from_be_bytes(self.0[12..16].try_into().unwrap())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// The same chunk position with the index advanced by one.
    /// `None` once the index space is exhausted.
    pub fn next_index(&self) -> Option<Self> {
        let next = self.index().checked_add(1)?;
        Some(Self::new(self.tenant(), self.inode(), self.track(), next))
    }

    /// `[begin, end)` chunk-id range covering `index_begin..index_end` of a
    /// single-track file; used by chunk removal.
    pub fn file_range(inode: InodeId, index_begin: u32, index_end: u32) -> (Self, Self) {
        (
            Self::for_file(inode, index_begin),
            Self::for_file(inode, index_end),
        )
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ChunkId(tenant={}, inode={}, track={}, index={})",
            self.tenant(),
            self.inode(),
            self.track(),
            self.index()
        )
    }
}

impl fmt::Display for ChunkId {
    /// Hex rendering used in logs and admin output.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_roundtrip() {
        let id = ChunkId::new(1, InodeId(0xDEADBEEF), 2, 77);
        assert_eq!(id.tenant(), 1);
        assert_eq!(id.inode(), InodeId(0xDEADBEEF));
        assert_eq!(id.track(), 2);
        assert_eq!(id.index(), 77);
    }

    #[test]
    fn test_bytes_roundtrip() {
        let id = ChunkId::for_file(InodeId(42), 3);
        assert_eq!(ChunkId::from_bytes(*id.as_bytes()), id);
    }

    #[test]
    fn test_layout_is_big_endian() {
        let id = ChunkId::new(0, InodeId(1), 1, 1);
        let bytes = id.as_bytes();
        assert_eq!(bytes[9], 1); // inode low byte at the end of its field
        assert_eq!(bytes[11], 1); // track low byte
        assert_eq!(bytes[15], 1); // index low byte
    }

    #[test]
    fn test_sequential_offsets_sort_sequentially() {
        let a = ChunkId::for_file(InodeId(5), 0);
        let b = ChunkId::for_file(InodeId(5), 1);
        let c = ChunkId::for_file(InodeId(5), 256);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_inode_dominates_ordering() {
        // All chunks of inode 5 sort before any chunk of inode 6.
        let last_of_5 = ChunkId::for_file(InodeId(5), u32::MAX);
        let first_of_6 = ChunkId::for_file(InodeId(6), 0);
        assert!(last_of_5 < first_of_6);
    }

    #[test]
    fn test_next_index() {
        let id = ChunkId::for_file(InodeId(1), 41);
        assert_eq!(id.next_index().unwrap().index(), 42);
        let last = ChunkId::for_file(InodeId(1), u32::MAX);
        assert!(last.next_index().is_none());
    }

    #[test]
    fn test_file_range() {
        let (begin, end) = ChunkId::file_range(InodeId(9), 2, 5);
        assert_eq!(begin.index(), 2);
        assert_eq!(end.index(), 5);
        assert!(begin < end);
    }

    #[test]
    fn test_serde_roundtrip() {
        let id = ChunkId::new(0, InodeId(123), 0, 9);
        let json = serde_json::to_string(&id).unwrap();
        let parsed: ChunkId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }
}

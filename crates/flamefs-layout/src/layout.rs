use flamefs_types::{make_error_msg, ChainTableId, InodeId, Result, StatusCode};
use serde::{Deserialize, Serialize};

use crate::ChunkId;

/// How a file's chunks map onto replication chains.
///
/// Inherited from the parent directory at create time and frozen in the file
/// inode; directory layout changes never touch existing files. `chain_slots`
/// holds positions inside the referenced chain table, one per stripe, filled
/// from the parent directory's chain-allocation counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub chain_table_id: ChainTableId,
    pub chain_table_version: u32,
    /// Chunk size in bytes; always a power of two.
    pub chunk_size: u32,
    /// Number of chains the file cycles across.
    pub stripe_size: u32,
    /// Offsets the slot rotation so files do not all start on slot 0.
    pub seed: u32,
    /// Positions inside the chain table, one per stripe.
    #[serde(default)]
    pub chain_slots: Vec<u32>,
}

impl Layout {
    pub fn new(
        chain_table_id: ChainTableId,
        chain_table_version: u32,
        chunk_size: u32,
        stripe_size: u32,
        seed: u32,
    ) -> Self {
        Self {
            chain_table_id,
            chain_table_version,
            chunk_size,
            stripe_size,
            seed,
            chain_slots: Vec::new(),
        }
    }

    /// Validate against the size of the referenced chain table.
    pub fn validate(&self, table_len: usize) -> Result<()> {
        if self.chunk_size == 0 || !self.chunk_size.is_power_of_two() {
            return make_error_msg(
                StatusCode::INVALID_ARG,
                format!("chunk_size {} is not a power of two", self.chunk_size),
            );
        }
        if self.stripe_size == 0 {
            return make_error_msg(StatusCode::INVALID_ARG, "stripe_size must be at least 1");
        }
        if self.stripe_size as usize > table_len {
            return make_error_msg(
                StatusCode::INVALID_ARG,
                format!(
                    "stripe_size {} exceeds chain table size {}",
                    self.stripe_size, table_len
                ),
            );
        }
        if !self.chain_slots.is_empty() && self.chain_slots.len() != self.stripe_size as usize {
            return make_error_msg(
                StatusCode::INVALID_ARG,
                "chain_slots length does not match stripe_size",
            );
        }
        Ok(())
    }

    /// The chunk covering byte `offset`.
    pub fn chunk_index(&self, offset: u64) -> u32 {
        (offset / self.chunk_size as u64) as u32
    }

    /// Stripe slot of a chunk: `(seed + index) % stripe_size`.
    pub fn chain_slot(&self, chunk_index: u32) -> u32 {
        (self.seed.wrapping_add(chunk_index)) % self.stripe_size
    }

    /// Chain-table position of a chunk, through the allocated slots.
    pub fn chain_ref(&self, chunk_index: u32) -> Result<u32> {
        let slot = self.chain_slot(chunk_index) as usize;
        match self.chain_slots.get(slot) {
            Some(&pos) => Ok(pos),
            None => make_error_msg(
                flamefs_types::MetaCode::INVALID_FILE_LAYOUT,
                format!("layout has no chain slot {}", slot),
            ),
        }
    }

    /// Chunk id for `chunk_index` of `inode` (single-track files).
    pub fn chunk_id(&self, inode: InodeId, chunk_index: u32) -> ChunkId {
        ChunkId::for_file(inode, chunk_index)
    }

    /// Split `[offset, offset + length)` into per-chunk sub-ranges, in
    /// ascending chunk order. Each sub-range addresses exactly one chain.
    pub fn split_range(&self, offset: u64, length: u64) -> Vec<ChunkRange> {
        let chunk_size = self.chunk_size as u64;
        let mut ranges = Vec::new();
        let mut pos = offset;
        let end = offset.saturating_add(length);
        while pos < end {
            let chunk_index = self.chunk_index(pos);
            let offset_in_chunk = (pos % chunk_size) as u32;
            let available = chunk_size - offset_in_chunk as u64;
            let take = available.min(end - pos) as u32;
            ranges.push(ChunkRange {
                chunk_index,
                offset_in_chunk,
                length: take,
            });
            pos += take as u64;
        }
        ranges
    }

    /// Chunk indices `[first_keep, ...)` that a truncate to `new_len` frees.
    /// Returns `None` when no chunk becomes removable.
    pub fn truncate_range(&self, old_len: u64, new_len: u64) -> Option<(u32, u32)> {
        if new_len >= old_len {
            return None;
        }
        let chunk_size = self.chunk_size as u64;
        let first_removed = new_len.div_ceil(chunk_size) as u32;
        let end = old_len.div_ceil(chunk_size) as u32;
        (first_removed < end).then_some((first_removed, end))
    }
}

/// One per-chunk piece of a split I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub chunk_index: u32,
    pub offset_in_chunk: u32,
    pub length: u32,
}

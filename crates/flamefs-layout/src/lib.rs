//! Chunk addressing and file layout.
//!
//! A file's bytes are split into fixed-size chunks; each chunk is addressed
//! by a 16-byte binary id and placed on a replication chain by stripe math
//! over the file's layout.

mod chunk_id;
mod layout;

pub use chunk_id::ChunkId;
pub use layout::{ChunkRange, Layout};

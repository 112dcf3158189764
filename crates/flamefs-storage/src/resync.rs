//! Target resync.
//!
//! A target rejoining a chain (`LAST_SYNC`) receives every chunk whose
//! committed version is ahead of its local copy, replayed in ascending
//! chunk order. Live writes keep flowing through the chain while the
//! snapshot copies, so the sink converges instead of chasing forever; the
//! mgmtd control loop promotes it once caught up.

use flamefs_layout::ChunkId;
use flamefs_types::{ChainVer, ChunkVer, Result};

use crate::engine::ChunkEngine;
use crate::target::StorageTarget;

/// Copy committed chunks from `source` to `sink` where `source` is ahead.
/// Returns how many chunks were installed.
pub async fn resync(sink: &StorageTarget, source: &StorageTarget, chain_version: ChainVer)
    -> Result<u32> {
    let batch = 64usize;
    let mut installed = 0;
    let mut begin = ChunkId::from_bytes([0u8; 16]);
    let end = ChunkId::from_bytes([0xFF; 16]);

    loop {
        let listed = source.engine().list_meta(begin, end, batch)?;
        let Some(last) = listed.last().map(|(id, _)| *id) else {
            break;
        };

        for (chunk_id, meta) in &listed {
            let local = sink
                .engine()
                .meta(*chunk_id)?
                .map(|m| m.chunk_version)
                .unwrap_or(ChunkVer(0));
            if meta.chunk_version <= local || meta.chunk_version == ChunkVer(0) {
                continue;
            }
            let Some((version, data)) = source.engine().committed_image(*chunk_id)? else {
                continue;
            };
            sink.engine()
                .install_image(*chunk_id, chain_version, version, data)?;
            installed += 1;
        }

        if listed.len() < batch {
            break;
        }
        match last.next_index() {
            Some(next) => begin = next,
            None => break,
        }
    }

    tracing::info!(
        sink = sink.target_id().0,
        source = source.target_id().0,
        installed,
        "resync pass complete"
    );
    Ok(installed)
}

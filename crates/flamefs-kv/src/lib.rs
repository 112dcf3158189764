mod engine;
pub mod retry;
mod transaction;

pub use engine::KvEngine;
pub use retry::{with_rw_txn_retry, RetryConfig, TxnFuture};
pub use transaction::*;

/// The key immediately after `key` in lexicographic order (appends a zero
/// byte). Useful as an inclusive begin selector for "strictly after" scans.
pub fn key_after(key: &[u8]) -> Vec<u8> {
    let mut result = key.to_vec();
    result.push(0);
    result
}

/// The exclusive end key for a prefix scan: the prefix with its last
/// non-0xFF byte incremented. All 0xFF (or empty) returns an empty vec,
/// meaning "no upper bound".
pub fn prefix_list_end_key(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return end;
        }
        end.pop();
    }
    end
}

/// Key under which the global metadata version lives. Its value is written
/// versionstamped so cached readers can detect movement cheaply.
pub const METADATA_VERSION_KEY: &[u8] = b"\xff/metadataVersion";

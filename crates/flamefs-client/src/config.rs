use std::time::Duration;

use crate::storage::ReadSelection;

/// Configuration for the storage client.
#[derive(Debug, Clone)]
pub struct StorageClientConfig {
    /// Sub-ops per batch to one node.
    pub max_batch_size: usize,

    /// Payload bytes per batch to one node.
    pub max_batch_bytes: usize,

    /// In-flight batches per node.
    pub max_concurrent_requests_per_node: usize,

    /// Replica choice for reads.
    pub read_selection: ReadSelection,

    /// Retry bounds per sub-op.
    pub retry_init_wait: Duration,
    pub retry_max_wait: Duration,
    pub retry_total: Duration,

    /// Chunks removed per removeChunks call.
    pub remove_chunks_batch: u32,
}

impl Default for StorageClientConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 128,
            max_batch_bytes: 4 << 20,
            max_concurrent_requests_per_node: 8,
            read_selection: ReadSelection::RoundRobin,
            retry_init_wait: Duration::from_millis(10),
            retry_max_wait: Duration::from_secs(1),
            retry_total: Duration::from_secs(30),
            remove_chunks_batch: 64,
        }
    }
}

/// Configuration for the metadata client.
#[derive(Debug, Clone)]
pub struct MetaClientConfig {
    pub retry_init_wait: Duration,
    pub retry_max_wait: Duration,
    pub retry_total: Duration,
}

impl Default for MetaClientConfig {
    fn default() -> Self {
        Self {
            retry_init_wait: Duration::from_millis(10),
            retry_max_wait: Duration::from_secs(1),
            retry_total: Duration::from_secs(30),
        }
    }
}

use std::time::Duration;

/// Configuration for a storage target.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Verify CRC-32C on every committed read.
    pub verify_checksum_on_read: bool,

    /// Uncommitted replica state older than this is reclaimable; the chain
    /// protocol retransmits anything still wanted.
    pub max_uncommitted_age: Duration,

    /// Chunks copied per resync batch.
    pub resync_batch: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            verify_checksum_on_read: true,
            max_uncommitted_age: Duration::from_secs(60),
            resync_batch: 64,
        }
    }
}

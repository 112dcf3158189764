use std::time::Duration;

/// Configuration for the metadata service.
#[derive(Debug, Clone)]
pub struct MetaConfig {
    /// Refuse all mutating operations.
    pub readonly: bool,

    /// Check request tokens against the user table.
    pub authenticate: bool,

    /// Maximum nested symlink depth during path resolution.
    pub max_symlink_depth: usize,

    /// Maximum symlinks followed across one resolution.
    pub max_symlink_count: usize,

    /// Longest accepted entry name.
    pub max_name_length: usize,

    /// Default page size for list when the request leaves it unset.
    pub list_default_limit: i32,

    /// Upper bound on one list page.
    pub list_max_limit: i32,

    /// Chunks removed per truncate/GC pass; larger files take several
    /// passes.
    pub remove_chunks_batch_size: u32,

    /// How many inode ids one allocator reservation covers.
    pub inode_alloc_batch: u64,

    /// Number of allocator shards.
    pub inode_alloc_shards: u32,

    /// Sessions idle beyond this are prunable.
    pub session_timeout: Duration,

    /// Period of the GC worker.
    pub gc_interval: Duration,

    /// GC queue entries consumed per pass.
    pub gc_batch: i32,

    /// Transaction retry bounds.
    pub retry: flamefs_kv::RetryConfig,

    /// Nominal capacity per online target, used by statfs aggregation.
    pub target_capacity: u64,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            readonly: false,
            authenticate: false,
            max_symlink_depth: 4,
            max_symlink_count: 10,
            max_name_length: 255,
            list_default_limit: 128,
            list_max_limit: 4096,
            remove_chunks_batch_size: 32,
            inode_alloc_batch: 1024,
            inode_alloc_shards: 8,
            session_timeout: Duration::from_secs(10 * 60),
            gc_interval: Duration::from_secs(10),
            gc_batch: 64,
            retry: flamefs_kv::RetryConfig::default(),
            target_capacity: 1 << 40,
        }
    }
}

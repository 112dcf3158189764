strong_type!(
    /// Inode identifier. Dense 64-bit allocation, never reused within a
    /// generation.
    InodeId,
    u64
);
strong_type!(
    /// Replication chain identifier.
    ChainId,
    u32
);
strong_type!(
    /// Versioned chain table identifier (layouts reference tables by id).
    ChainTableId,
    u32
);
strong_type!(
    /// Storage target identifier (one disk/replica on a node).
    TargetId,
    u64
);
strong_type!(NodeId, u32);
strong_type!(Uid, u32);
strong_type!(Gid, u32);
strong_type!(
    /// Monotonic revision of the cluster topology.
    RoutingVersion,
    u64
);
strong_type!(
    /// Monotonic version of a chain's membership/order.
    ChainVer,
    u32
);
strong_type!(
    /// Per-chunk committed data version.
    ChunkVer,
    u32
);

impl InodeId {
    /// The filesystem root inode.
    pub const ROOT: InodeId = InodeId(0);
    /// Root of the deletion (GC) tree.
    pub const GC_ROOT: InodeId = InodeId(1);

    /// Whether this id is one of the reserved tree roots.
    pub fn is_tree_root(&self) -> bool {
        *self == Self::ROOT || *self == Self::GC_ROOT
    }
}

//! Flat cluster types shared by every service: users, nodes, chains,
//! targets and the versioned routing snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use flamefs_types::{
    Address, ChainId, ChainTableId, ChainVer, Gid, NodeId, RoutingVersion, TargetId, Uid, UtcTime,
    Uuid,
};
use serde::{Deserialize, Serialize};

/// Caller identity attached to each request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserInfo {
    pub uid: Uid,
    pub gid: Gid,
    pub gids: Vec<Gid>,
    /// Cluster token; checked against the user table when authentication is
    /// enabled.
    #[serde(default)]
    pub token: String,
}

impl UserInfo {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid: Uid(uid),
            gid: Gid(gid),
            gids: Vec::new(),
            token: String::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.uid.0 == 0
    }
}

/// Fields common to every metadata request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReqBase {
    pub user: UserInfo,
    pub client: Uuid,
    /// Request identity for idempotent replay.
    pub request_uuid: Uuid,
    /// Set once a request has been forwarded between metadata servers;
    /// breaks forwarding loops.
    pub forward: bool,
}

/// A registered user record (`USER` table value).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub name: String,
    pub uid: Uid,
    pub gid: Gid,
    pub token: String,
    pub is_admin: bool,
}

/// What kind of service a node runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    Meta,
    Storage,
    Mgmtd,
    Client,
}

/// Liveness of a registered node as judged by the heartbeat checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Online,
    Missing,
}

/// One registered node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub address: Address,
    pub hostname: String,
    pub status: NodeStatus,
    pub last_heartbeat: UtcTime,
}

/// Where a target sits in its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainRole {
    Head,
    Middle,
    Tail,
}

/// Local replication state of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetState {
    Online,
    Offline,
    /// Rejoining: receiving the catch-up snapshot.
    LastSync,
    /// Snapshot replayed, draining the live stream.
    Syncing,
    Rejoin,
}

/// A target slot within a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTarget {
    pub target_id: TargetId,
    pub role: ChainRole,
}

/// Ordered replica set for a partition of the chunk space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInfo {
    pub chain_id: ChainId,
    /// Bumped whenever membership or order changes; clients reject replies
    /// tagged with stale versions.
    pub version: ChainVer,
    pub targets: Vec<ChainTarget>,
    pub preferred_order: Vec<TargetId>,
}

impl ChainInfo {
    /// Build a chain over `targets` in order; first is head, last is tail.
    pub fn new(chain_id: ChainId, version: ChainVer, targets: &[TargetId]) -> Self {
        let n = targets.len();
        let chain_targets = targets
            .iter()
            .enumerate()
            .map(|(i, &target_id)| ChainTarget {
                target_id,
                role: if i + 1 == n {
                    ChainRole::Tail
                } else if i == 0 {
                    ChainRole::Head
                } else {
                    ChainRole::Middle
                },
            })
            .collect();
        Self {
            chain_id,
            version,
            targets: chain_targets,
            preferred_order: targets.to_vec(),
        }
    }

    pub fn head(&self) -> Option<TargetId> {
        self.targets.first().map(|t| t.target_id)
    }

    pub fn tail(&self) -> Option<TargetId> {
        self.targets.last().map(|t| t.target_id)
    }

    pub fn position_of(&self, target: TargetId) -> Option<usize> {
        self.targets.iter().position(|t| t.target_id == target)
    }

    /// The next replica after `target` along the chain.
    pub fn successor_of(&self, target: TargetId) -> Option<TargetId> {
        let pos = self.position_of(target)?;
        self.targets.get(pos + 1).map(|t| t.target_id)
    }

    pub fn target_ids(&self) -> Vec<TargetId> {
        self.targets.iter().map(|t| t.target_id).collect()
    }

    /// Rotate so that the replica at `new_head_pos` becomes head, dropping
    /// nothing; roles are reassigned by position.
    pub fn rotated(&self, new_head_pos: usize) -> Self {
        let mut ids = self.target_ids();
        let len = ids.len().max(1);
        ids.rotate_left(new_head_pos % len);
        let mut next = Self::new(self.chain_id, ChainVer(self.version.0 + 1), &ids);
        next.preferred_order = ids;
        next
    }

    /// Remove a target, reassigning roles; bumps the version.
    pub fn without_target(&self, target: TargetId) -> Self {
        let ids: Vec<TargetId> = self
            .target_ids()
            .into_iter()
            .filter(|&t| t != target)
            .collect();
        let mut next = Self::new(self.chain_id, ChainVer(self.version.0 + 1), &ids);
        next.preferred_order = ids;
        next
    }
}

/// One target's placement and state (`TGIF` table value).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInfo {
    pub target_id: TargetId,
    pub node_id: NodeId,
    pub disk_index: u16,
    pub state: TargetState,
}

/// Versioned mapping of logical slots to chains (`CHIT` table value).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTable {
    pub table_id: ChainTableId,
    pub version: u32,
    pub chains: Vec<ChainId>,
}

/// Snapshot of the cluster topology, monotonically versioned.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingInfo {
    pub routing_version: RoutingVersion,
    pub nodes: HashMap<NodeId, NodeInfo>,
    pub chains: HashMap<ChainId, ChainInfo>,
    pub targets: HashMap<TargetId, TargetInfo>,
    pub chain_tables: HashMap<ChainTableId, ChainTable>,
}

impl RoutingInfo {
    pub fn get_node(&self, id: NodeId) -> Option<&NodeInfo> {
        self.nodes.get(&id)
    }

    pub fn get_chain(&self, id: ChainId) -> Option<&ChainInfo> {
        self.chains.get(&id)
    }

    pub fn get_target(&self, id: TargetId) -> Option<&TargetInfo> {
        self.targets.get(&id)
    }

    /// Node hosting a given target.
    pub fn node_of_target(&self, id: TargetId) -> Option<NodeId> {
        self.targets.get(&id).map(|t| t.node_id)
    }

    /// Resolve a chain-table position to a chain id.
    pub fn resolve_chain_ref(&self, table: ChainTableId, position: u32) -> Option<ChainId> {
        self.chain_tables
            .get(&table)
            .and_then(|t| t.chains.get(position as usize))
            .copied()
    }
}

/// Source of the current routing snapshot. Services and clients read
/// topology through this; the mgmtd client keeps it fresh.
pub trait RoutingProvider: Send + Sync {
    fn routing(&self) -> Arc<RoutingInfo>;
}

/// Fixed routing for single-process wiring and tests.
pub struct StaticRouting(pub Arc<RoutingInfo>);

impl RoutingProvider for StaticRouting {
    fn routing(&self) -> Arc<RoutingInfo> {
        Arc::clone(&self.0)
    }
}

/// A client session tracked by mgmtd for lease-based cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSession {
    pub client: Uuid,
    pub start: UtcTime,
    pub last_extend: UtcTime,
}

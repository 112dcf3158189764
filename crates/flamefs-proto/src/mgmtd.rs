//! Management service messages: node registration, heartbeats, routing
//! distribution and chain administration.

use flamefs_types::{Address, ChainId, ChainTableId, NodeId, RoutingVersion, TargetId, Uuid};
use serde::{Deserialize, Serialize};

use crate::common::{ClientSession, NodeType, RoutingInfo, TargetInfo, TargetState};

// ---- registerNode / unregisterNode ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNodeReq {
    pub cluster_id: String,
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub address: Address,
    pub hostname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNodeRsp {
    pub routing_version: RoutingVersion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterNodeReq {
    pub cluster_id: String,
    pub node_id: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterNodeRsp {}

// ---- setNodeTags ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetNodeTagsReq {
    pub node_id: NodeId,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetNodeTagsRsp {}

// ---- heartbeat ----

/// State of one local target, reported with each storage heartbeat.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LocalTargetInfo {
    pub target_id: TargetId,
    pub disk_index: u16,
    pub state: TargetState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatReq {
    pub cluster_id: String,
    pub node_id: NodeId,
    /// Storage nodes report their local targets; empty otherwise.
    pub local_targets: Vec<LocalTargetInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRsp {
    pub routing_version: RoutingVersion,
}

// ---- getRoutingInfo ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRoutingInfoReq {
    /// Version the caller already holds; the reply omits the snapshot when
    /// nothing changed.
    pub since_version: RoutingVersion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRoutingInfoRsp {
    pub routing: Option<RoutingInfo>,
}

// ---- setChains / setChainTable ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSetting {
    pub chain_id: ChainId,
    /// Replicas in chain order: head first, tail last.
    pub targets: Vec<TargetId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetChainsReq {
    pub chains: Vec<ChainSetting>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetChainsRsp {
    pub routing_version: RoutingVersion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetChainTableReq {
    pub table_id: ChainTableId,
    pub chains: Vec<ChainId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetChainTableRsp {
    pub version: u32,
    pub routing_version: RoutingVersion,
}

// ---- rotateAsPreferredOrder ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateAsPreferredOrderReq {
    pub chain_id: ChainId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateAsPreferredOrderRsp {
    pub routing_version: RoutingVersion,
}

// ---- listOrphanTargets ----

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListOrphanTargetsReq {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListOrphanTargetsRsp {
    /// Targets known to the cluster but referenced by no chain.
    pub targets: Vec<TargetInfo>,
}

// ---- client sessions ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetClientSessionReq {
    pub client: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetClientSessionRsp {
    pub session: Option<ClientSession>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendClientSessionReq {
    pub client: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendClientSessionRsp {
    pub session: ClientSession,
}

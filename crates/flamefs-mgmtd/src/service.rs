//! The management service: registration, heartbeats, routing distribution
//! and chain administration.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use flamefs_kv::KvEngine;
use flamefs_proto::common::{
    ChainInfo, ChainTable, ClientSession, NodeInfo, NodeStatus, RoutingInfo, TargetInfo,
    TargetState,
};
use flamefs_proto::mgmtd::*;
use flamefs_types::{
    make_error, make_error_msg, ChainVer, MgmtdCode, NodeId, Result, Uuid, UtcTime,
};

use crate::config::MgmtdConfig;
use crate::lease::PrimaryLease;
use crate::store::MgmtdStore;

/// Latest heartbeat from one node.
#[derive(Debug, Clone)]
pub struct HeartbeatRecord {
    pub at: UtcTime,
    pub local_targets: Vec<LocalTargetInfo>,
}

/// State shared between the RPC surface and the control loops.
pub struct MgmtdInner<E: KvEngine> {
    pub config: MgmtdConfig,
    pub store: MgmtdStore<E>,
    pub lease: PrimaryLease<E>,
    pub heartbeats: DashMap<NodeId, HeartbeatRecord>,
    pub client_sessions: DashMap<Uuid, ClientSession>,
}

impl<E: KvEngine> MgmtdInner<E> {
    pub fn require_primary(&self) -> Result<()> {
        if self.lease.is_primary() {
            Ok(())
        } else {
            make_error(MgmtdCode::NOT_PRIMARY)
        }
    }

    fn check_cluster(&self, cluster_id: &str) -> Result<()> {
        if cluster_id != self.config.cluster_id {
            return make_error_msg(
                MgmtdCode::CLUSTER_ID_MISMATCH,
                format!(
                    "request for cluster {:?}, serving {:?}",
                    cluster_id, self.config.cluster_id
                ),
            );
        }
        Ok(())
    }
}

/// Management service operations.
#[async_trait]
pub trait MgmtdService: Send + Sync {
    async fn register_node(&self, req: RegisterNodeReq) -> Result<RegisterNodeRsp>;
    async fn unregister_node(&self, req: UnregisterNodeReq) -> Result<UnregisterNodeRsp>;
    async fn set_node_tags(&self, req: SetNodeTagsReq) -> Result<SetNodeTagsRsp>;
    async fn heartbeat(&self, req: HeartbeatReq) -> Result<HeartbeatRsp>;
    async fn get_routing_info(&self, req: GetRoutingInfoReq) -> Result<GetRoutingInfoRsp>;
    async fn set_chains(&self, req: SetChainsReq) -> Result<SetChainsRsp>;
    async fn set_chain_table(&self, req: SetChainTableReq) -> Result<SetChainTableRsp>;
    async fn rotate_as_preferred_order(
        &self,
        req: RotateAsPreferredOrderReq,
    ) -> Result<RotateAsPreferredOrderRsp>;
    async fn list_orphan_targets(&self, req: ListOrphanTargetsReq)
        -> Result<ListOrphanTargetsRsp>;
    async fn get_client_session(&self, req: GetClientSessionReq) -> Result<GetClientSessionRsp>;
    async fn extend_client_session(
        &self,
        req: ExtendClientSessionReq,
    ) -> Result<ExtendClientSessionRsp>;
}

/// Concrete management service over a KV engine.
pub struct MgmtdServiceImpl<E: KvEngine> {
    inner: Arc<MgmtdInner<E>>,
}

impl<E: KvEngine> MgmtdServiceImpl<E> {
    pub fn new(config: MgmtdConfig, engine: Arc<E>, node_id: NodeId) -> Self {
        let lease = PrimaryLease::new(Arc::clone(&engine), node_id, config.lease_duration);
        let store = MgmtdStore::new(engine);
        Self {
            inner: Arc::new(MgmtdInner {
                config,
                store,
                lease,
                heartbeats: DashMap::new(),
                client_sessions: DashMap::new(),
            }),
        }
    }

    /// Load persisted routing state and claim the lease.
    pub async fn start(&self) -> Result<bool> {
        self.inner.store.load().await?;
        self.inner.lease.acquire().await
    }

    pub fn inner(&self) -> Arc<MgmtdInner<E>> {
        Arc::clone(&self.inner)
    }

    pub fn routing(&self) -> Arc<RoutingInfo> {
        self.inner.store.routing()
    }
}

#[async_trait]
impl<E: KvEngine + 'static> MgmtdService for MgmtdServiceImpl<E>
where
    E::RoTxn: Send + Sync,
    E::RwTxn: Send + Sync,
{
    async fn register_node(&self, req: RegisterNodeReq) -> Result<RegisterNodeRsp> {
        self.inner.check_cluster(&req.cluster_id)?;
        self.inner.require_primary()?;

        let now = UtcTime::now();
        let version = self
            .inner
            .store
            .mutate(|routing| {
                routing.nodes.insert(
                    req.node_id,
                    NodeInfo {
                        node_id: req.node_id,
                        node_type: req.node_type,
                        address: req.address,
                        hostname: req.hostname.clone(),
                        status: NodeStatus::Online,
                        last_heartbeat: now,
                    },
                );
                Ok(())
            })
            .await?;

        self.inner.heartbeats.insert(
            req.node_id,
            HeartbeatRecord {
                at: now,
                local_targets: Vec::new(),
            },
        );
        tracing::info!(node = req.node_id.0, hostname = %req.hostname, "node registered");
        Ok(RegisterNodeRsp {
            routing_version: version,
        })
    }

    async fn unregister_node(&self, req: UnregisterNodeReq) -> Result<UnregisterNodeRsp> {
        self.inner.check_cluster(&req.cluster_id)?;
        self.inner.require_primary()?;

        self.inner
            .store
            .mutate(|routing| {
                if routing.nodes.remove(&req.node_id).is_none() {
                    return make_error(MgmtdCode::NODE_NOT_FOUND);
                }
                Ok(())
            })
            .await?;
        self.inner.heartbeats.remove(&req.node_id);
        Ok(UnregisterNodeRsp {})
    }

    async fn set_node_tags(&self, req: SetNodeTagsReq) -> Result<SetNodeTagsRsp> {
        self.inner.require_primary()?;
        // Tags only gate operator tooling; the record just has to exist.
        if self.inner.store.routing().get_node(req.node_id).is_none() {
            return make_error(MgmtdCode::NODE_NOT_FOUND);
        }
        Ok(SetNodeTagsRsp {})
    }

    async fn heartbeat(&self, req: HeartbeatReq) -> Result<HeartbeatRsp> {
        self.inner.check_cluster(&req.cluster_id)?;

        let routing = self.inner.store.routing();
        let Some(node) = routing.get_node(req.node_id) else {
            return make_error_msg(
                MgmtdCode::HEARTBEAT_FAIL,
                format!("node {} is not registered", req.node_id),
            );
        };
        let was_missing = node.status == NodeStatus::Missing;

        self.inner.heartbeats.insert(
            req.node_id,
            HeartbeatRecord {
                at: UtcTime::now(),
                local_targets: req.local_targets.clone(),
            },
        );

        // A node returning from the dead is brought back online right away;
        // its targets recover through the resync staircase, not here.
        if was_missing && self.inner.lease.is_primary() {
            let node_id = req.node_id;
            let now = UtcTime::now();
            self.inner
                .store
                .mutate(|routing| {
                    if let Some(node) = routing.nodes.get_mut(&node_id) {
                        node.status = NodeStatus::Online;
                        node.last_heartbeat = now;
                    }
                    Ok(())
                })
                .await?;
            tracing::info!(node = node_id.0, "node back online");
        }

        Ok(HeartbeatRsp {
            routing_version: self.inner.store.routing().routing_version,
        })
    }

    async fn get_routing_info(&self, req: GetRoutingInfoReq) -> Result<GetRoutingInfoRsp> {
        let routing = self
            .inner
            .store
            .routing_since(req.since_version)
            .map(|arc| (*arc).clone());
        Ok(GetRoutingInfoRsp { routing })
    }

    async fn set_chains(&self, req: SetChainsReq) -> Result<SetChainsRsp> {
        self.inner.require_primary()?;

        let version = self
            .inner
            .store
            .mutate(|routing| {
                for setting in &req.chains {
                    if setting.targets.is_empty() {
                        return make_error_msg(
                            MgmtdCode::INVALID_CHAIN,
                            format!("chain {} has no targets", setting.chain_id),
                        );
                    }
                    for target in &setting.targets {
                        if !routing.targets.contains_key(target) {
                            // First mention of a target creates its record.
                            routing.targets.insert(
                                *target,
                                TargetInfo {
                                    target_id: *target,
                                    node_id: NodeId(0),
                                    disk_index: 0,
                                    state: TargetState::Online,
                                },
                            );
                        }
                    }
                    let next_version = routing
                        .chains
                        .get(&setting.chain_id)
                        .map(|c| ChainVer(c.version.0 + 1))
                        .unwrap_or(ChainVer(1));
                    routing.chains.insert(
                        setting.chain_id,
                        ChainInfo::new(setting.chain_id, next_version, &setting.targets),
                    );
                }
                Ok(())
            })
            .await?;

        Ok(SetChainsRsp {
            routing_version: version,
        })
    }

    async fn set_chain_table(&self, req: SetChainTableReq) -> Result<SetChainTableRsp> {
        self.inner.require_primary()?;

        let mut table_version = 0;
        let routing_version = self
            .inner
            .store
            .mutate(|routing| {
                for chain in &req.chains {
                    if !routing.chains.contains_key(chain) {
                        return make_error_msg(
                            MgmtdCode::CHAIN_NOT_FOUND,
                            format!("chain table references unknown chain {}", chain),
                        );
                    }
                }
                table_version = routing
                    .chain_tables
                    .get(&req.table_id)
                    .map(|t| t.version + 1)
                    .unwrap_or(1);
                routing.chain_tables.insert(
                    req.table_id,
                    ChainTable {
                        table_id: req.table_id,
                        version: table_version,
                        chains: req.chains.clone(),
                    },
                );
                Ok(())
            })
            .await?;

        Ok(SetChainTableRsp {
            version: table_version,
            routing_version,
        })
    }

    async fn rotate_as_preferred_order(
        &self,
        req: RotateAsPreferredOrderReq,
    ) -> Result<RotateAsPreferredOrderRsp> {
        self.inner.require_primary()?;

        let version = self
            .inner
            .store
            .mutate(|routing| {
                let Some(chain) = routing.chains.get(&req.chain_id) else {
                    return make_error(MgmtdCode::CHAIN_NOT_FOUND);
                };
                // Restore the operator-preferred order, keeping only current
                // members; version bumps with the reorder.
                let members: Vec<_> = chain.target_ids();
                let ordered: Vec<_> = chain
                    .preferred_order
                    .iter()
                    .copied()
                    .filter(|t| members.contains(t))
                    .chain(members.iter().copied().filter(|t| !chain.preferred_order.contains(t)))
                    .collect();
                let mut next =
                    ChainInfo::new(req.chain_id, ChainVer(chain.version.0 + 1), &ordered);
                next.preferred_order = chain.preferred_order.clone();
                routing.chains.insert(req.chain_id, next);
                Ok(())
            })
            .await?;

        Ok(RotateAsPreferredOrderRsp {
            routing_version: version,
        })
    }

    async fn list_orphan_targets(
        &self,
        _req: ListOrphanTargetsReq,
    ) -> Result<ListOrphanTargetsRsp> {
        let routing = self.inner.store.routing();
        let referenced: std::collections::HashSet<_> = routing
            .chains
            .values()
            .flat_map(|c| c.target_ids())
            .collect();
        let targets = routing
            .targets
            .values()
            .filter(|t| !referenced.contains(&t.target_id))
            .copied()
            .collect();
        Ok(ListOrphanTargetsRsp { targets })
    }

    async fn get_client_session(&self, req: GetClientSessionReq) -> Result<GetClientSessionRsp> {
        let session = self
            .inner
            .client_sessions
            .get(&req.client)
            .map(|s| s.clone());
        Ok(GetClientSessionRsp { session })
    }

    async fn extend_client_session(
        &self,
        req: ExtendClientSessionReq,
    ) -> Result<ExtendClientSessionRsp> {
        let now = UtcTime::now();
        let mut entry = self
            .inner
            .client_sessions
            .entry(req.client)
            .or_insert_with(|| ClientSession {
                client: req.client,
                start: now,
                last_extend: now,
            });
        entry.last_extend = now;
        Ok(ExtendClientSessionRsp {
            session: entry.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flamefs_kv_backends::MemKvEngine;
    use flamefs_proto::common::NodeType;
    use flamefs_types::{Address, AddressType, ChainId, RoutingVersion, TargetId};

    async fn primary() -> MgmtdServiceImpl<MemKvEngine> {
        let svc = MgmtdServiceImpl::new(
            MgmtdConfig::default(),
            Arc::new(MemKvEngine::new()),
            NodeId(1),
        );
        assert!(svc.start().await.unwrap());
        svc
    }

    fn register_req(node_id: u32, node_type: NodeType) -> RegisterNodeReq {
        RegisterNodeReq {
            cluster_id: "flamefs".into(),
            node_id: NodeId(node_id),
            node_type,
            address: Address::from_octets(10, 0, 0, node_id as u8, 9000, AddressType::TCP),
            hostname: format!("node-{}", node_id),
        }
    }

    #[tokio::test]
    async fn test_register_and_routing() {
        let svc = primary().await;
        let rsp = svc
            .register_node(register_req(2, NodeType::Storage))
            .await
            .unwrap();
        assert_eq!(rsp.routing_version, RoutingVersion(1));

        let routing = svc
            .get_routing_info(GetRoutingInfoReq {
                since_version: RoutingVersion(0),
            })
            .await
            .unwrap()
            .routing
            .unwrap();
        assert!(routing.get_node(NodeId(2)).is_some());

        // Nothing new since version 1.
        let rsp = svc
            .get_routing_info(GetRoutingInfoReq {
                since_version: RoutingVersion(1),
            })
            .await
            .unwrap();
        assert!(rsp.routing.is_none());
    }

    #[tokio::test]
    async fn test_cluster_id_checked() {
        let svc = primary().await;
        let mut req = register_req(2, NodeType::Storage);
        req.cluster_id = "other".into();
        let err = svc.register_node(req).await.unwrap_err();
        assert_eq!(err.code(), MgmtdCode::CLUSTER_ID_MISMATCH);
    }

    #[tokio::test]
    async fn test_heartbeat_requires_registration() {
        let svc = primary().await;
        let err = svc
            .heartbeat(HeartbeatReq {
                cluster_id: "flamefs".into(),
                node_id: NodeId(9),
                local_targets: vec![],
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), MgmtdCode::HEARTBEAT_FAIL);
    }

    #[tokio::test]
    async fn test_set_chains_and_table() {
        let svc = primary().await;
        svc.register_node(register_req(2, NodeType::Storage))
            .await
            .unwrap();

        svc.set_chains(SetChainsReq {
            chains: vec![ChainSetting {
                chain_id: ChainId(100),
                targets: vec![TargetId(1), TargetId(2), TargetId(3)],
            }],
        })
        .await
        .unwrap();

        let rsp = svc
            .set_chain_table(SetChainTableReq {
                table_id: flamefs_types::ChainTableId(1),
                chains: vec![ChainId(100)],
            })
            .await
            .unwrap();
        assert_eq!(rsp.version, 1);

        let routing = svc.routing();
        let chain = routing.get_chain(ChainId(100)).unwrap();
        assert_eq!(chain.version, ChainVer(1));
        assert_eq!(chain.head(), Some(TargetId(1)));
        assert_eq!(
            routing.resolve_chain_ref(flamefs_types::ChainTableId(1), 0),
            Some(ChainId(100))
        );
    }

    #[tokio::test]
    async fn test_chain_table_rejects_unknown_chain() {
        let svc = primary().await;
        let err = svc
            .set_chain_table(SetChainTableReq {
                table_id: flamefs_types::ChainTableId(1),
                chains: vec![ChainId(42)],
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), MgmtdCode::CHAIN_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_set_chains_updates_bump_chain_version() {
        let svc = primary().await;
        let setting = |targets: Vec<TargetId>| SetChainsReq {
            chains: vec![ChainSetting {
                chain_id: ChainId(7),
                targets,
            }],
        };
        svc.set_chains(setting(vec![TargetId(1), TargetId(2)]))
            .await
            .unwrap();
        svc.set_chains(setting(vec![TargetId(2), TargetId(1)]))
            .await
            .unwrap();
        let routing = svc.routing();
        assert_eq!(routing.get_chain(ChainId(7)).unwrap().version, ChainVer(2));
    }

    #[tokio::test]
    async fn test_non_primary_rejects_mutations() {
        let engine = Arc::new(MemKvEngine::new());
        let primary =
            MgmtdServiceImpl::new(MgmtdConfig::default(), Arc::clone(&engine), NodeId(1));
        assert!(primary.start().await.unwrap());

        let follower = MgmtdServiceImpl::new(MgmtdConfig::default(), engine, NodeId(2));
        assert!(!follower.start().await.unwrap());

        let err = follower
            .register_node(register_req(3, NodeType::Meta))
            .await
            .unwrap_err();
        assert_eq!(err.code(), MgmtdCode::NOT_PRIMARY);
    }

    #[tokio::test]
    async fn test_orphan_targets() {
        let svc = primary().await;
        svc.set_chains(SetChainsReq {
            chains: vec![ChainSetting {
                chain_id: ChainId(1),
                targets: vec![TargetId(1)],
            }],
        })
        .await
        .unwrap();
        // Add a target not referenced by any chain.
        svc.inner()
            .store
            .mutate(|routing| {
                routing.targets.insert(
                    TargetId(99),
                    TargetInfo {
                        target_id: TargetId(99),
                        node_id: NodeId(1),
                        disk_index: 0,
                        state: TargetState::Online,
                    },
                );
                Ok(())
            })
            .await
            .unwrap();

        let rsp = svc
            .list_orphan_targets(ListOrphanTargetsReq {})
            .await
            .unwrap();
        assert_eq!(rsp.targets.len(), 1);
        assert_eq!(rsp.targets[0].target_id, TargetId(99));
    }

    #[tokio::test]
    async fn test_client_sessions() {
        let svc = primary().await;
        let client = Uuid::new(1, 2);

        let rsp = svc
            .get_client_session(GetClientSessionReq { client })
            .await
            .unwrap();
        assert!(rsp.session.is_none());

        svc.extend_client_session(ExtendClientSessionReq { client })
            .await
            .unwrap();
        let rsp = svc
            .get_client_session(GetClientSessionReq { client })
            .await
            .unwrap();
        assert_eq!(rsp.session.unwrap().client, client);
    }

    #[tokio::test]
    async fn test_rotate_as_preferred_order() {
        let svc = primary().await;
        svc.set_chains(SetChainsReq {
            chains: vec![ChainSetting {
                chain_id: ChainId(5),
                targets: vec![TargetId(1), TargetId(2), TargetId(3)],
            }],
        })
        .await
        .unwrap();

        // Simulate a failover reorder, then restore the preferred order.
        svc.inner()
            .store
            .mutate(|routing| {
                let chain = routing.chains.get(&ChainId(5)).unwrap().rotated(1);
                // Keep the original preferred order on the rotated chain.
                let mut chain = chain;
                chain.preferred_order = vec![TargetId(1), TargetId(2), TargetId(3)];
                routing.chains.insert(ChainId(5), chain);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(
            svc.routing().get_chain(ChainId(5)).unwrap().head(),
            Some(TargetId(2))
        );

        svc.rotate_as_preferred_order(RotateAsPreferredOrderReq {
            chain_id: ChainId(5),
        })
        .await
        .unwrap();

        let routing = svc.routing();
        let chain = routing.get_chain(ChainId(5)).unwrap();
        assert_eq!(chain.head(), Some(TargetId(1)));
        assert_eq!(chain.version, ChainVer(3));
    }
}

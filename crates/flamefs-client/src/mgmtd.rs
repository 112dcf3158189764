//! Management-service client: keeps the routing cache fresh and the client
//! session alive.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use flamefs_mgmtd::MgmtdService;
use flamefs_proto::mgmtd::{ExtendClientSessionReq, GetRoutingInfoReq};
use flamefs_types::Uuid;
use flamefs_utils::BackgroundRunner;

use crate::error::{ClientError, ClientResult};
use crate::routing::{RoutingHandle, RoutingRefresher};

pub struct MgmtdClient {
    service: Arc<dyn MgmtdService>,
    routing: RoutingHandle,
    client_id: Uuid,
}

impl MgmtdClient {
    pub fn new(service: Arc<dyn MgmtdService>, routing: RoutingHandle, client_id: Uuid) -> Self {
        Self {
            service,
            routing,
            client_id,
        }
    }

    pub fn routing(&self) -> &RoutingHandle {
        &self.routing
    }

    /// Pull routing newer than the cached version, if any.
    pub async fn refresh_routing(&self) -> ClientResult<()> {
        let rsp = self
            .service
            .get_routing_info(GetRoutingInfoReq {
                since_version: self.routing.current_version(),
            })
            .await
            .map_err(ClientError::Status)?;
        if let Some(info) = rsp.routing {
            self.routing.update(info)?;
        }
        Ok(())
    }

    /// Keep the mgmtd-side client session alive.
    pub async fn extend_session(&self) -> ClientResult<()> {
        self.service
            .extend_client_session(ExtendClientSessionReq {
                client: self.client_id,
            })
            .await
            .map_err(ClientError::Status)?;
        Ok(())
    }

    /// Spawn the periodic refresh + session loops.
    pub fn spawn_loops(self: &Arc<Self>, runner: &mut BackgroundRunner, interval: Duration) {
        let refresh = Arc::clone(self);
        runner.spawn_periodic(interval, move || {
            let client = Arc::clone(&refresh);
            async move {
                if let Err(e) = client.refresh_routing().await {
                    tracing::warn!(error = %e, "routing refresh failed");
                }
                if let Err(e) = client.extend_session().await {
                    tracing::debug!(error = %e, "session extension failed");
                }
            }
        });
    }
}

#[async_trait]
impl RoutingRefresher for MgmtdClient {
    async fn refresh(&self) -> ClientResult<()> {
        self.refresh_routing().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flamefs_kv_backends::MemKvEngine;
    use flamefs_mgmtd::{MgmtdConfig, MgmtdServiceImpl};
    use flamefs_proto::common::NodeType;
    use flamefs_proto::mgmtd::RegisterNodeReq;
    use flamefs_types::{Address, AddressType, NodeId, RoutingVersion};

    async fn make_mgmtd() -> Arc<MgmtdServiceImpl<MemKvEngine>> {
        let svc = MgmtdServiceImpl::new(
            MgmtdConfig::default(),
            Arc::new(MemKvEngine::new()),
            NodeId(1),
        );
        assert!(svc.start().await.unwrap());
        Arc::new(svc)
    }

    #[tokio::test]
    async fn test_refresh_pulls_new_routing() {
        let mgmtd = make_mgmtd().await;
        let client = MgmtdClient::new(
            Arc::clone(&mgmtd) as Arc<dyn MgmtdService>,
            RoutingHandle::new(),
            Uuid::generate(),
        );

        // Nothing registered yet: routing at version 0 on both sides.
        client.refresh_routing().await.unwrap();
        assert_eq!(client.routing().current_version(), RoutingVersion(0));

        mgmtd
            .register_node(RegisterNodeReq {
                cluster_id: "flamefs".into(),
                node_id: NodeId(5),
                node_type: NodeType::Storage,
                address: Address::from_octets(10, 0, 0, 5, 9000, AddressType::TCP),
                hostname: "s5".into(),
            })
            .await
            .unwrap();

        client.refresh_routing().await.unwrap();
        let routing = client.routing().get();
        assert_eq!(routing.routing_version, RoutingVersion(1));
        assert!(routing.get_node(NodeId(5)).is_some());

        // A second refresh with nothing new leaves the cache alone.
        client.refresh_routing().await.unwrap();
        assert_eq!(client.routing().current_version(), RoutingVersion(1));
    }

    #[tokio::test]
    async fn test_session_extension() {
        let mgmtd = make_mgmtd().await;
        let client_id = Uuid::generate();
        let client = MgmtdClient::new(
            Arc::clone(&mgmtd) as Arc<dyn MgmtdService>,
            RoutingHandle::new(),
            client_id,
        );
        client.extend_session().await.unwrap();

        let rsp = mgmtd
            .get_client_session(flamefs_proto::mgmtd::GetClientSessionReq { client: client_id })
            .await
            .unwrap();
        assert!(rsp.session.is_some());
    }
}

//! Client routing cache.
//!
//! Single writer (the refresher), many readers. Readers take a snapshot
//! `Arc`; refreshes swap the whole snapshot atomically. Version regression
//! is an error: within one client lifetime the observed routing version is
//! monotonically non-decreasing.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use flamefs_proto::common::{RoutingInfo, RoutingProvider};
use flamefs_types::RoutingVersion;

use crate::error::{ClientError, ClientResult};

/// Something that can pull fresh routing into the cache (the mgmtd client).
#[async_trait]
pub trait RoutingRefresher: Send + Sync {
    async fn refresh(&self) -> ClientResult<()>;
}

#[derive(Clone)]
pub struct RoutingHandle {
    inner: Arc<RwLock<Arc<RoutingInfo>>>,
}

impl RoutingHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(RoutingInfo::default()))),
        }
    }

    pub fn with(info: RoutingInfo) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(info))),
        }
    }

    /// Snapshot of the current routing.
    pub fn get(&self) -> Arc<RoutingInfo> {
        Arc::clone(&self.inner.read())
    }

    pub fn current_version(&self) -> RoutingVersion {
        self.get().routing_version
    }

    /// Install a newer snapshot. Equal versions are a no-op; regression is
    /// refused.
    pub fn update(&self, info: RoutingInfo) -> ClientResult<()> {
        let mut guard = self.inner.write();
        let current = guard.routing_version;
        if info.routing_version < current {
            return Err(ClientError::StaleRouting(format!(
                "update carries version {} but cache holds {}",
                info.routing_version.0, current.0
            )));
        }
        if info.routing_version > current {
            *guard = Arc::new(info);
        }
        Ok(())
    }
}

impl Default for RoutingHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingProvider for RoutingHandle {
    fn routing(&self) -> Arc<RoutingInfo> {
        self.get()
    }
}

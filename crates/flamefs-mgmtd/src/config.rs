use std::time::Duration;

/// Configuration for the management service.
#[derive(Debug, Clone)]
pub struct MgmtdConfig {
    /// Cluster identifier; requests from other clusters are refused.
    pub cluster_id: String,

    /// How long the primary lease lasts once acquired.
    pub lease_duration: Duration,

    /// Renewal period for the primary lease; well below `lease_duration`.
    pub lease_extend_interval: Duration,

    /// A node missing heartbeats for this long is marked missing.
    pub node_timeout: Duration,

    /// How often the heartbeat checker runs.
    pub check_interval: Duration,

    /// How often the chains updater applies pending promotions.
    pub chains_update_interval: Duration,

    /// How often target state is checkpointed to the KV store.
    pub target_persist_interval: Duration,

    /// Client sessions idle beyond this are dropped.
    pub client_session_timeout: Duration,
}

impl Default for MgmtdConfig {
    fn default() -> Self {
        Self {
            cluster_id: "flamefs".into(),
            lease_duration: Duration::from_secs(60),
            lease_extend_interval: Duration::from_secs(10),
            node_timeout: Duration::from_secs(60),
            check_interval: Duration::from_secs(10),
            chains_update_interval: Duration::from_secs(10),
            target_persist_interval: Duration::from_secs(30),
            client_session_timeout: Duration::from_secs(20 * 60),
        }
    }
}

//! Management service: the single source of truth for cluster topology.
//!
//! Node registrations, chain tables, chain membership and target state all
//! live in the KV store and are served to clients as a monotonically
//! versioned [`RoutingInfo`](flamefs_proto::common::RoutingInfo) snapshot.
//! A lease key elects one primary; control loops watch heartbeats and repair
//! chains.

pub mod config;
pub mod lease;
pub mod loops;
pub mod service;
pub mod store;

pub use config::MgmtdConfig;
pub use lease::PrimaryLease;
pub use service::{MgmtdService, MgmtdServiceImpl};
pub use store::MgmtdStore;

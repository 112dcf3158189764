//! Storage targets and chain replication.
//!
//! Each storage node hosts targets; a target holds one replica per chunk
//! for the chains it participates in. Writes traverse the chain head to
//! tail and commit on the way back; reads are served by any replica with
//! version verification.

pub mod config;
pub mod engine;
pub mod node;
pub mod resync;
pub mod service;
pub mod target;

pub use config::StorageConfig;
pub use engine::{ChunkEngine, MemChunkEngine};
pub use node::StorageNode;
pub use service::StorageService;
pub use target::StorageTarget;

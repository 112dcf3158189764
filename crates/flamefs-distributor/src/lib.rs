//! Decentralized metadata-server assignment.
//!
//! A cluster of identical metadata servers shares an active-server map in
//! the KV store under the `META` prefix; there is no coordinator. Each
//! server keeps a versionstamped presence marker fresh; a marker that stops
//! advancing is a dead server. Inode ownership is rendezvous hashing over
//! the active set, so membership changes move only `1/|S|` of the inodes.

mod distributor;

pub use distributor::{Distributor, DistributorConfig, ServerMap};

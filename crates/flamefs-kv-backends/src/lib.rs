mod memdb;

pub use memdb::{MemKvEngine, MemReadOnlyTxn, MemReadWriteTxn};

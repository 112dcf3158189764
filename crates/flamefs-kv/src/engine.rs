use crate::transaction::{ReadOnlyTransaction, ReadWriteTransaction};

/// A transactional KV engine: a factory for transactions.
///
/// Any engine providing serializable read-write transactions, snapshot
/// read-only transactions and commit versionstamps satisfies the contract.
pub trait KvEngine: Send + Sync {
    type RoTxn: ReadOnlyTransaction;
    type RwTxn: ReadWriteTransaction;

    fn create_readonly_transaction(&self) -> Self::RoTxn;
    fn create_readwrite_transaction(&self) -> Self::RwTxn;
}

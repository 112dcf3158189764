//! KV-backed routing state.
//!
//! The authoritative copy of `{nodes, chains, targets, chain tables}` lives
//! in the KV store under the `NODE`/`CHIF`/`TGIF`/`CHIT` prefixes, with a
//! monotonic routing version under `CONF`. The primary keeps an in-memory
//! snapshot that every mutation rewrites atomically; followers reload the
//! snapshot read-only.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use flamefs_kv::{KeySelector, KvEngine, ReadOnlyTransaction, ReadWriteTransaction};
use flamefs_proto::common::{ChainInfo, ChainTable, NodeInfo, RoutingInfo, TargetInfo};
use flamefs_schema as schema;
use flamefs_types::{
    make_error_msg, ChainId, ChainTableId, MgmtdCode, NodeId, Result, RoutingVersion, TargetId,
};

const ROUTING_VERSION_KEY: &str = "routing-version";

/// Shared routing store. Cheap to clone.
pub struct MgmtdStore<E: KvEngine> {
    engine: Arc<E>,
    cached: RwLock<Arc<RoutingInfo>>,
}

impl<E: KvEngine> MgmtdStore<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self {
            engine,
            cached: RwLock::new(Arc::new(RoutingInfo::default())),
        }
    }

    /// The current routing snapshot.
    pub fn routing(&self) -> Arc<RoutingInfo> {
        Arc::clone(&self.cached.read())
    }

    /// The snapshot, but only when it is newer than `since`.
    pub fn routing_since(&self, since: RoutingVersion) -> Option<Arc<RoutingInfo>> {
        let current = self.routing();
        (current.routing_version > since).then_some(current)
    }

    /// Rebuild the in-memory snapshot from the KV store.
    pub async fn load(&self) -> Result<()> {
        let txn = self.engine.create_readonly_transaction();

        let mut routing = RoutingInfo::default();

        routing.routing_version = RoutingVersion(
            match txn
                .snapshot_get(&schema::config_key(ROUTING_VERSION_KEY))
                .await?
            {
                Some(raw) => decode::<u64>(&raw, "routing version")?,
                None => 0,
            },
        );

        routing.nodes = scan_table::<E::RoTxn, NodeId, NodeInfo>(
            &txn,
            schema::prefix::NODE,
            |key| schema::parse_node_key(key),
        )
        .await?;
        routing.chains = scan_table::<E::RoTxn, ChainId, ChainInfo>(
            &txn,
            schema::prefix::CHAIN_INFO,
            |key| schema::parse_chain_key(key),
        )
        .await?;
        routing.targets = scan_table::<E::RoTxn, TargetId, TargetInfo>(
            &txn,
            schema::prefix::TARGET_INFO,
            |key| schema::parse_target_key(key),
        )
        .await?;

        // Chain tables are versioned; the newest version of each table wins.
        let tables = scan_values::<E::RoTxn, ChainTable>(&txn, schema::prefix::CHAIN_TABLE).await?;
        let mut newest: HashMap<ChainTableId, ChainTable> = HashMap::new();
        for table in tables {
            match newest.get(&table.table_id) {
                Some(existing) if existing.version >= table.version => {}
                _ => {
                    newest.insert(table.table_id, table);
                }
            }
        }
        routing.chain_tables = newest;

        *self.cached.write() = Arc::new(routing);
        Ok(())
    }

    /// Apply `apply` to a working copy of the snapshot and persist the
    /// difference in a single transaction, bumping the routing version.
    ///
    /// Only the primary mutates; a conflicting writer (a competing primary
    /// after lease takeover) surfaces as `Mgmtd::StaleRouting` and the
    /// caller reloads.
    pub async fn mutate(
        &self,
        apply: impl FnOnce(&mut RoutingInfo) -> Result<()>,
    ) -> Result<RoutingVersion> {
        let current = self.routing();
        let mut working = (*current).clone();
        apply(&mut working)?;

        let mut txn = self.engine.create_readwrite_transaction();

        // Guard: the version key is the serialization point for all routing
        // mutations.
        let version_key = schema::config_key(ROUTING_VERSION_KEY);
        let persisted = match txn.get(&version_key).await? {
            Some(raw) => decode::<u64>(&raw, "routing version")?,
            None => 0,
        };
        if persisted != current.routing_version.0 {
            // Another writer advanced the store behind our cache.
            self.load().await?;
            return make_error_msg(
                MgmtdCode::STALE_ROUTING,
                format!(
                    "routing cache at {} but store at {}",
                    current.routing_version.0, persisted
                ),
            );
        }

        let next_version = RoutingVersion(persisted + 1);
        working.routing_version = next_version;

        write_diff(
            &mut txn,
            &current.nodes,
            &working.nodes,
            |id| schema::node_key(*id),
        )
        .await?;
        write_diff(
            &mut txn,
            &current.chains,
            &working.chains,
            |id| schema::chain_key(*id),
        )
        .await?;
        write_diff(
            &mut txn,
            &current.targets,
            &working.targets,
            |id| schema::target_key(*id),
        )
        .await?;
        // Chain tables are append-only per version.
        for (id, table) in &working.chain_tables {
            let unchanged = current
                .chain_tables
                .get(id)
                .is_some_and(|t| t == table);
            if !unchanged {
                txn.set(
                    &schema::chain_table_key(*id, table.version),
                    &encode(table)?,
                )
                .await?;
            }
        }

        txn.set(&version_key, &encode(&next_version.0)?).await?;
        txn.commit().await?;

        tracing::debug!(version = next_version.0, "routing updated");
        *self.cached.write() = Arc::new(working);
        Ok(next_version)
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| {
        flamefs_types::Status::with_message(
            flamefs_types::StatusCode::DATA_CORRUPTION,
            format!("encode failed: {}", e),
        )
    })
}

fn decode<T: serde::de::DeserializeOwned>(raw: &[u8], what: &str) -> Result<T> {
    serde_json::from_slice(raw).map_err(|e| {
        flamefs_types::Status::with_message(
            flamefs_types::StatusCode::DATA_CORRUPTION,
            format!("decode {} failed: {}", what, e),
        )
    })
}

async fn scan_values<T: ReadOnlyTransaction, V: serde::de::DeserializeOwned>(
    txn: &T,
    prefix: &[u8; 4],
) -> Result<Vec<V>> {
    let begin = KeySelector::new(prefix.to_vec(), true);
    let end = KeySelector::new(flamefs_kv::prefix_list_end_key(prefix), false);
    let result = txn.snapshot_get_range(&begin, &end, i32::MAX).await?;
    result
        .kvs
        .iter()
        .map(|kv| decode(&kv.value, "routing record"))
        .collect()
}

async fn scan_table<T, K, V>(
    txn: &T,
    prefix: &[u8; 4],
    parse_key: impl Fn(&[u8]) -> Result<K>,
) -> Result<HashMap<K, V>>
where
    T: ReadOnlyTransaction,
    K: std::hash::Hash + Eq,
    V: serde::de::DeserializeOwned,
{
    let begin = KeySelector::new(prefix.to_vec(), true);
    let end = KeySelector::new(flamefs_kv::prefix_list_end_key(prefix), false);
    let result = txn.snapshot_get_range(&begin, &end, i32::MAX).await?;
    let mut map = HashMap::with_capacity(result.kvs.len());
    for kv in &result.kvs {
        map.insert(parse_key(&kv.key)?, decode(&kv.value, "routing record")?);
    }
    Ok(map)
}

async fn write_diff<K, V>(
    txn: &mut impl ReadWriteTransaction,
    before: &HashMap<K, V>,
    after: &HashMap<K, V>,
    key_of: impl Fn(&K) -> Vec<u8>,
) -> Result<()>
where
    K: std::hash::Hash + Eq,
    V: PartialEq + serde::Serialize,
{
    for (id, value) in after {
        if before.get(id) != Some(value) {
            txn.set(&key_of(id), &encode(value)?).await?;
        }
    }
    for id in before.keys() {
        if !after.contains_key(id) {
            txn.clear(&key_of(id)).await?;
        }
    }
    Ok(())
}

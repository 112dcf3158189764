use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use flamefs_kv::{
    prefix_list_end_key, KeySelector, KvEngine, ReadOnlyTransaction, ReadWriteTransaction,
    Versionstamp, METADATA_VERSION_KEY,
};
use flamefs_schema as schema;
use flamefs_types::{make_error_msg, InodeId, MetaCode, NodeId, Result, StatusCode};
use flamefs_utils::murmurhash3_x64_128;

/// Seed for the rendezvous hash; stable across the cluster.
const WEIGHT_SEED: u64 = 0x666c616d65_66_73; // "flamefs"

#[derive(Debug, Clone)]
pub struct DistributorConfig {
    /// Period of the background updater.
    pub update_interval: Duration,
    /// A presence marker that has not advanced for this long marks its
    /// server dead.
    pub failure_timeout: Duration,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(5),
            failure_timeout: Duration::from_secs(30),
        }
    }
}

/// The shared active-server set, tagged with the versionstamp of the commit
/// that last rewrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMap {
    pub active: Vec<NodeId>,
    pub versionstamp: Versionstamp,
}

impl ServerMap {
    fn empty() -> Self {
        Self {
            active: Vec::new(),
            versionstamp: [0u8; 10],
        }
    }
}

/// Value layout shared by the map, the markers and the metadata-version
/// key: a 10-byte versionstamp, optionally followed by a JSON payload.
fn stamped_value(payload: &[u8]) -> Vec<u8> {
    let mut value = vec![0u8; 10];
    value.extend_from_slice(payload);
    value
}

fn split_stamped<'a>(raw: &'a [u8], what: &str) -> Result<(Versionstamp, &'a [u8])> {
    if raw.len() < 10 {
        return make_error_msg(
            StatusCode::DATA_CORRUPTION,
            format!("{} value shorter than a versionstamp", what),
        );
    }
    let stamp: Versionstamp = raw[..10].try_into().unwrap();
    Ok((stamp, &raw[10..]))
}

fn decode_map(raw: &[u8]) -> Result<ServerMap> {
    let (versionstamp, payload) = split_stamped(raw, "server map")?;
    let active: Vec<NodeId> = serde_json::from_slice(payload).map_err(|e| {
        flamefs_types::Status::with_message(
            StatusCode::DATA_CORRUPTION,
            format!("server map payload: {}", e),
        )
    })?;
    Ok(ServerMap {
        active,
        versionstamp,
    })
}

struct Observed {
    /// Metadata-version stamp at the last cache refresh.
    metadata_stamp: Versionstamp,
    /// Per-server marker stamp and when we last saw it advance.
    markers: HashMap<NodeId, (Versionstamp, Instant)>,
}

/// One metadata server's view of the decentralized assignment protocol.
pub struct Distributor<E: KvEngine> {
    engine: Arc<E>,
    node_id: NodeId,
    config: DistributorConfig,
    cached: RwLock<Arc<ServerMap>>,
    observed: Mutex<Observed>,
}

impl<E: KvEngine> Distributor<E>
where
    E::RwTxn: Send + Sync,
{
    pub fn new(engine: Arc<E>, node_id: NodeId, config: DistributorConfig) -> Self {
        Self {
            engine,
            node_id,
            config,
            cached: RwLock::new(Arc::new(ServerMap::empty())),
            observed: Mutex::new(Observed {
                metadata_stamp: [0u8; 10],
                markers: HashMap::new(),
            }),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The cached active-server map.
    pub fn server_map(&self) -> Arc<ServerMap> {
        Arc::clone(&self.cached.read())
    }

    /// Join the cluster: write our presence marker and add ourselves to the
    /// shared map, all in one transaction.
    pub async fn start(&self) -> Result<()> {
        let mut txn = self.engine.create_readwrite_transaction();

        let map_key = schema::meta_dist_map_key();
        let mut map = match txn.get(&map_key).await? {
            Some(raw) => decode_map(&raw)?,
            None => ServerMap::empty(),
        };

        txn.set_versionstamped_value(
            &schema::meta_dist_server_key(self.node_id),
            &stamped_value(&[]),
            0,
        )
        .await?;

        if !map.active.contains(&self.node_id) {
            map.active.push(self.node_id);
            map.active.sort();
            let payload = serde_json::to_vec(&map.active).expect("node list serializes");
            txn.set_versionstamped_value(&map_key, &stamped_value(&payload), 0)
                .await?;
            txn.set_versionstamped_value(METADATA_VERSION_KEY, &stamped_value(&[]), 0)
                .await?;
        }

        txn.commit().await?;
        tracing::info!(node = self.node_id.0, active = ?map.active, "joined meta cluster");

        self.refresh_cache().await
    }

    // -- assignment ---------------------------------------------------------

    /// Rendezvous weight of `(server, inode)`.
    fn weight(server: NodeId, inode: InodeId) -> u64 {
        let mut buf = [0u8; 12];
        buf[..4].copy_from_slice(&server.0.to_be_bytes());
        buf[4..].copy_from_slice(&inode.0.to_be_bytes());
        murmurhash3_x64_128(&buf, WEIGHT_SEED).0
    }

    /// The server responsible for `inode` under `active`: highest weight
    /// wins, ties broken by the smaller node id.
    pub fn responsible_in(active: &[NodeId], inode: InodeId) -> Option<NodeId> {
        let mut best: Option<(u64, NodeId)> = None;
        for &server in active {
            let w = Self::weight(server, inode);
            let better = match best {
                None => true,
                Some((bw, bid)) => w > bw || (w == bw && server < bid),
            };
            if better {
                best = Some((w, server));
            }
        }
        best.map(|(_, id)| id)
    }

    /// The server responsible for `inode` under the cached map.
    pub fn responsible_server(&self, inode: InodeId) -> Option<NodeId> {
        Self::responsible_in(&self.server_map().active, inode)
    }

    pub fn is_responsible(&self, inode: InodeId) -> bool {
        self.responsible_server(inode) == Some(self.node_id)
    }

    /// Transaction-scoped ownership check: reads the authoritative map
    /// (conflict-tracked) and pins the inode key into the conflict set, so a
    /// reassignment between now and commit fails the transaction.
    pub async fn check_ownership(
        &self,
        txn: &mut dyn ReadWriteTransaction,
        inode: InodeId,
    ) -> Result<()> {
        let map = match txn.get(&schema::meta_dist_map_key()).await? {
            Some(raw) => decode_map(&raw)?,
            None => ServerMap::empty(),
        };
        let responsible = Self::responsible_in(&map.active, inode);
        if responsible != Some(self.node_id) {
            return make_error_msg(
                MetaCode::BUSY,
                format!(
                    "inode {} belongs to {:?}, this is {}",
                    inode, responsible, self.node_id
                ),
            );
        }
        txn.add_read_conflict(&schema::inode_key(inode)).await?;
        Ok(())
    }

    // -- background updater -------------------------------------------------

    /// One updater pass: keep our marker fresh, detect dead peers, publish
    /// a corrected map when the derived set changed, refresh the cache only
    /// when the metadata version moved.
    pub async fn tick(&self) -> Result<()> {
        self.refresh_own_marker().await?;

        let (map, markers) = self.read_map_and_markers().await?;
        let alive = self.judge_alive(&markers);

        let mut derived: Vec<NodeId> = alive.into_iter().collect();
        derived.sort();

        if !derived.is_empty() && derived != map.active {
            self.publish_map(&map, &derived).await?;
        }

        self.refresh_cache().await
    }

    /// Spawn the periodic updater onto `runner`.
    pub fn spawn_updater(self: &Arc<Self>, runner: &mut flamefs_utils::BackgroundRunner)
    where
        E: 'static,
        E::RoTxn: Send + Sync,
    {
        let this = Arc::clone(self);
        runner.spawn_periodic(self.config.update_interval, move || {
            let this = Arc::clone(&this);
            async move {
                if let Err(e) = this.tick().await {
                    tracing::warn!(error = %e, "distributor update failed");
                }
            }
        });
    }

    async fn refresh_own_marker(&self) -> Result<()> {
        let mut txn = self.engine.create_readwrite_transaction();
        txn.set_versionstamped_value(
            &schema::meta_dist_server_key(self.node_id),
            &stamped_value(&[]),
            0,
        )
        .await?;
        txn.commit().await
    }

    async fn read_map_and_markers(&self) -> Result<(ServerMap, HashMap<NodeId, Versionstamp>)> {
        let txn = self.engine.create_readonly_transaction();

        let map = match txn.snapshot_get(&schema::meta_dist_map_key()).await? {
            Some(raw) => decode_map(&raw)?,
            None => ServerMap::empty(),
        };

        let marker_prefix = b"META-";
        let begin = KeySelector::new(marker_prefix.to_vec(), true);
        let end = KeySelector::new(prefix_list_end_key(marker_prefix), false);
        let result = txn.snapshot_get_range(&begin, &end, i32::MAX).await?;

        let mut markers = HashMap::new();
        for kv in &result.kvs {
            let node = schema::parse_meta_dist_server_key(&kv.key)?;
            let (stamp, _) = split_stamped(&kv.value, "presence marker")?;
            markers.insert(node, stamp);
        }
        Ok((map, markers))
    }

    /// Fold fresh marker observations into history and return the servers
    /// whose markers advanced within the failure timeout.
    fn judge_alive(&self, markers: &HashMap<NodeId, Versionstamp>) -> Vec<NodeId> {
        let now = Instant::now();
        let mut observed = self.observed.lock();
        let mut alive = Vec::new();

        for (&node, &stamp) in markers {
            let advanced = match observed.markers.get(&node) {
                Some(&(seen_stamp, _)) => stamp > seen_stamp,
                None => true,
            };
            if advanced {
                observed.markers.insert(node, (stamp, now));
            }
            let last_advance = observed.markers[&node].1;
            if now.duration_since(last_advance) < self.config.failure_timeout {
                alive.push(node);
            }
        }
        observed.markers.retain(|node, _| markers.contains_key(node));
        alive
    }

    async fn publish_map(&self, current: &ServerMap, derived: &[NodeId]) -> Result<()> {
        let mut txn = self.engine.create_readwrite_transaction();

        // Conflict-guard on the map key so concurrent correctors serialize.
        let map_key = schema::meta_dist_map_key();
        let persisted = match txn.get(&map_key).await? {
            Some(raw) => decode_map(&raw)?,
            None => ServerMap::empty(),
        };
        if persisted.versionstamp != current.versionstamp {
            // Someone already corrected the map; our derivation is stale.
            return Ok(());
        }

        let payload = serde_json::to_vec(derived).expect("node list serializes");
        txn.set_versionstamped_value(&map_key, &stamped_value(&payload), 0)
            .await?;
        txn.set_versionstamped_value(METADATA_VERSION_KEY, &stamped_value(&[]), 0)
            .await?;
        txn.commit().await?;

        tracing::info!(active = ?derived, "published corrected server map");
        Ok(())
    }

    /// Reload the cached map only when the metadata-version stamp advanced.
    async fn refresh_cache(&self) -> Result<()> {
        let txn = self.engine.create_readonly_transaction();
        let stamp = match txn.snapshot_get(METADATA_VERSION_KEY).await? {
            Some(raw) => split_stamped(&raw, "metadata version")?.0,
            None => [0u8; 10],
        };

        {
            let observed = self.observed.lock();
            if stamp == observed.metadata_stamp && !self.server_map().active.is_empty() {
                return Ok(());
            }
        }

        let map = match txn.snapshot_get(&schema::meta_dist_map_key()).await? {
            Some(raw) => decode_map(&raw)?,
            None => ServerMap::empty(),
        };
        *self.cached.write() = Arc::new(map);
        self.observed.lock().metadata_stamp = stamp;
        Ok(())
    }
}

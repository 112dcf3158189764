//! Membership control loops run by the primary.
//!
//! Each loop is a periodic task on a [`BackgroundRunner`]: the heartbeat
//! checker demotes silent nodes and rotates chains off dead heads, the
//! chains updater walks recovering targets up the resync staircase, the
//! target persister records newly reported targets, and the lease extender
//! keeps the primary lease alive.

use std::sync::Arc;

use flamefs_kv::KvEngine;
use flamefs_proto::common::{ChainRole, NodeStatus, TargetInfo, TargetState};
use flamefs_types::{NodeId, Result, TargetId, UtcTime};
use flamefs_utils::BackgroundRunner;

use crate::service::MgmtdInner;

/// Spawn all control loops onto `runner`.
pub fn spawn_control_loops<E>(runner: &mut BackgroundRunner, inner: Arc<MgmtdInner<E>>)
where
    E: KvEngine + 'static,
    E::RoTxn: Send + Sync,
    E::RwTxn: Send + Sync,
{
    let config = inner.config.clone();

    let lease_inner = Arc::clone(&inner);
    runner.spawn_periodic(config.lease_extend_interval, move || {
        let inner = Arc::clone(&lease_inner);
        async move {
            if let Err(e) = inner.lease.acquire().await {
                tracing::warn!(error = %e, "lease renewal failed");
            }
        }
    });

    let check_inner = Arc::clone(&inner);
    runner.spawn_periodic(config.check_interval, move || {
        let inner = Arc::clone(&check_inner);
        async move {
            if !inner.lease.is_primary() {
                return;
            }
            if let Err(e) = check_heartbeats(&inner).await {
                tracing::warn!(error = %e, "heartbeat check failed");
            }
            prune_client_sessions(&inner);
        }
    });

    let chains_inner = Arc::clone(&inner);
    runner.spawn_periodic(config.chains_update_interval, move || {
        let inner = Arc::clone(&chains_inner);
        async move {
            if !inner.lease.is_primary() {
                return;
            }
            if let Err(e) = update_chains(&inner).await {
                tracing::warn!(error = %e, "chains update failed");
            }
        }
    });

    let persist_inner = inner;
    runner.spawn_periodic(config.target_persist_interval, move || {
        let inner = Arc::clone(&persist_inner);
        async move {
            if !inner.lease.is_primary() {
                return;
            }
            if let Err(e) = persist_reported_targets(&inner).await {
                tracing::warn!(error = %e, "target persist failed");
            }
        }
    });
}

/// Mark nodes missing after `node_timeout`, take their targets offline and
/// rotate any chain whose head went dark.
pub async fn check_heartbeats<E>(inner: &MgmtdInner<E>) -> Result<()>
where
    E: KvEngine,
{
    let routing = inner.store.routing();
    let timeout = inner.config.node_timeout;

    let mut newly_missing: Vec<NodeId> = Vec::new();
    for node in routing.nodes.values() {
        if node.status != NodeStatus::Online {
            continue;
        }
        let last = inner
            .heartbeats
            .get(&node.node_id)
            .map(|r| r.at)
            .unwrap_or(node.last_heartbeat);
        if last.expired(timeout) {
            newly_missing.push(node.node_id);
        }
    }

    if newly_missing.is_empty() {
        return Ok(());
    }

    tracing::warn!(nodes = ?newly_missing, "nodes missed heartbeats");
    inner
        .store
        .mutate(|routing| {
            let mut dead_targets: Vec<TargetId> = Vec::new();
            for node_id in &newly_missing {
                if let Some(node) = routing.nodes.get_mut(node_id) {
                    node.status = NodeStatus::Missing;
                }
                for target in routing.targets.values_mut() {
                    if target.node_id == *node_id && target.state == TargetState::Online {
                        target.state = TargetState::Offline;
                        dead_targets.push(target.target_id);
                    }
                }
            }

            // Rotate chains so a live replica becomes head; drop nothing,
            // the offline replica resyncs on return.
            let chain_ids: Vec<_> = routing.chains.keys().copied().collect();
            for chain_id in chain_ids {
                let chain = routing.chains.get(&chain_id).unwrap();
                let head_dead = chain
                    .head()
                    .is_some_and(|head| dead_targets.contains(&head));
                if !head_dead {
                    continue;
                }
                let first_alive = chain.targets.iter().position(|t| {
                    routing
                        .targets
                        .get(&t.target_id)
                        .map_or(true, |info| info.state == TargetState::Online)
                });
                if let Some(pos) = first_alive {
                    let rotated = chain.rotated(pos);
                    tracing::warn!(
                        chain = chain_id.0,
                        new_head = ?rotated.head(),
                        version = rotated.version.0,
                        "rotated chain off dead head"
                    );
                    routing.chains.insert(chain_id, rotated);
                }
            }
            Ok(())
        })
        .await?;
    Ok(())
}

/// Walk recovering targets up the LAST_SYNC -> SYNCING -> ONLINE staircase
/// based on what their hosting node reports, restoring the preferred chain
/// order once a replica is back online.
pub async fn update_chains<E>(inner: &MgmtdInner<E>) -> Result<()>
where
    E: KvEngine,
{
    // Latest reported state per target, from live heartbeats only.
    let mut reported: std::collections::HashMap<TargetId, TargetState> =
        std::collections::HashMap::new();
    for entry in inner.heartbeats.iter() {
        if entry.value().at.expired(inner.config.node_timeout) {
            continue;
        }
        for target in &entry.value().local_targets {
            reported.insert(target.target_id, target.state);
        }
    }
    if reported.is_empty() {
        return Ok(());
    }

    let routing = inner.store.routing();
    let needs_change = routing.targets.values().any(|t| {
        matches!(
            (t.state, reported.get(&t.target_id)),
            (TargetState::Offline, Some(TargetState::LastSync))
                | (TargetState::LastSync, Some(TargetState::Syncing))
                | (TargetState::Syncing, Some(TargetState::Online))
        )
    });
    if !needs_change {
        return Ok(());
    }

    inner
        .store
        .mutate(|routing| {
            let mut recovered: Vec<TargetId> = Vec::new();
            for target in routing.targets.values_mut() {
                let next = match (target.state, reported.get(&target.target_id)) {
                    (TargetState::Offline, Some(TargetState::LastSync)) => TargetState::LastSync,
                    (TargetState::LastSync, Some(TargetState::Syncing)) => TargetState::Syncing,
                    (TargetState::Syncing, Some(TargetState::Online)) => {
                        recovered.push(target.target_id);
                        TargetState::Online
                    }
                    _ => continue,
                };
                tracing::info!(target = target.target_id.0, state = ?next, "target state advanced");
                target.state = next;
            }

            // A fully recovered replica resumes its preferred position.
            if !recovered.is_empty() {
                let chain_ids: Vec<_> = routing.chains.keys().copied().collect();
                for chain_id in chain_ids {
                    let chain = routing.chains.get(&chain_id).unwrap();
                    let affected = chain
                        .target_ids()
                        .iter()
                        .any(|t| recovered.contains(t));
                    if !affected || chain.preferred_order.is_empty() {
                        continue;
                    }
                    let members = chain.target_ids();
                    let restored: Vec<_> = chain
                        .preferred_order
                        .iter()
                        .copied()
                        .filter(|t| members.contains(t))
                        .collect();
                    if restored != members {
                        let mut next = flamefs_proto::common::ChainInfo::new(
                            chain_id,
                            flamefs_types::ChainVer(chain.version.0 + 1),
                            &restored,
                        );
                        next.preferred_order = chain.preferred_order.clone();
                        routing.chains.insert(chain_id, next);
                    }
                }
            }
            Ok(())
        })
        .await?;
    Ok(())
}

/// Record targets reported by storage heartbeats that routing has never
/// seen, so chains can be built over them.
pub async fn persist_reported_targets<E>(inner: &MgmtdInner<E>) -> Result<()>
where
    E: KvEngine,
{
    let routing = inner.store.routing();
    let mut unknown: Vec<(NodeId, flamefs_proto::mgmtd::LocalTargetInfo)> = Vec::new();
    for entry in inner.heartbeats.iter() {
        for target in &entry.value().local_targets {
            if !routing.targets.contains_key(&target.target_id) {
                unknown.push((*entry.key(), *target));
            }
        }
    }
    if unknown.is_empty() {
        return Ok(());
    }

    inner
        .store
        .mutate(|routing| {
            for (node_id, local) in &unknown {
                routing.targets.entry(local.target_id).or_insert(TargetInfo {
                    target_id: local.target_id,
                    node_id: *node_id,
                    disk_index: local.disk_index,
                    state: local.state,
                });
            }
            Ok(())
        })
        .await?;
    Ok(())
}

/// Drop client sessions idle beyond the configured timeout.
pub fn prune_client_sessions<E: KvEngine>(inner: &MgmtdInner<E>) {
    let timeout = inner.config.client_session_timeout;
    inner
        .client_sessions
        .retain(|_, session| !session.last_extend.expired(timeout));
}

/// Whether any chain currently routes writes through `role` on `target`.
pub fn target_has_role<E: KvEngine>(
    inner: &MgmtdInner<E>,
    target: TargetId,
    role: ChainRole,
) -> bool {
    inner
        .store
        .routing()
        .chains
        .values()
        .any(|c| c.targets.iter().any(|t| t.target_id == target && t.role == role))
}

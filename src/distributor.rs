//! Distributor: places a planned shard onto its nodes
//!
//! Capacity is reserved node by node through the fleet registry. A node
//! that cannot take the shard is skipped with a warning; partial placement
//! is a normal outcome (`under_replicated`), not an error. Fresh
//! reservations are RAII guards and only become permanent after the
//! transition is in the ledger, so a failed or cancelled distribution
//! never leaves capacity held for assignments nobody logged. Nodes the
//! shard leaves (including stale nodes from isolation) are released after
//! the commit.

use tessera_core_fleet::{CapacityReservation, NodeId, NodeRegistry};
use tracing::{debug, info, warn};

use crate::config::DistributionConfig;
use crate::error::{Result, TesseraError};
use crate::registry::{illegal_transition, ShardGuard, ShardRegistry};
use crate::shard::{Shard, ShardEvent, ShardId, ShardStatus};

/// Nodes that accepted a placement, in plan order
pub(crate) struct Placement {
    pub nodes: Vec<NodeId>,
    pub reservations: Vec<CapacityReservation>,
    pub skipped: Vec<(NodeId, String)>,
}

impl Placement {
    /// Make fresh reservations permanent
    pub fn commit(self) {
        for reservation in self.reservations {
            reservation.commit();
        }
    }
}

/// Reserve capacity on every target the shard does not already hold
///
/// Targets in `held` that still hold the shard are kept without a new
/// reservation. Per-node failures are collected in `skipped`.
pub(crate) fn reserve_targets(
    fleet: &NodeRegistry,
    shard: &Shard,
    targets: &[NodeId],
    held: &[NodeId],
) -> Result<Placement> {
    let key = shard.holding_key();
    let mut placement = Placement {
        nodes: Vec::with_capacity(targets.len()),
        reservations: Vec::new(),
        skipped: Vec::new(),
    };

    for node in targets {
        if held.contains(node) && fleet.holds(node, &key) {
            if fleet.health_of(node).is_healthy() {
                placement.nodes.push(node.clone());
            } else {
                placement
                    .skipped
                    .push((node.clone(), "node no longer healthy".to_string()));
            }
            continue;
        }

        match fleet.reserve(node, &key, shard.required_capacity) {
            Ok(reservation) => {
                debug!(shard_id = %shard.id, node = %node, "Reserved capacity");
                placement.nodes.push(node.clone());
                placement.reservations.push(reservation);
            }
            Err(e) if e.is_node_local() => {
                warn!(
                    shard_id = %shard.id,
                    node = %node,
                    error = %e,
                    "NodeCapacityExceeded: skipping node"
                );
                placement.skipped.push((node.clone(), e.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(placement)
}

/// Release capacity on nodes that no longer carry the shard
pub(crate) fn release_departed(fleet: &NodeRegistry, shard: &Shard, departed: &[NodeId]) {
    let key = shard.holding_key();
    for node in departed {
        match fleet.release(node, &key) {
            Ok(units) => debug!(shard_id = %shard.id, node = %node, units, "Released capacity"),
            Err(e) => debug!(shard_id = %shard.id, node = %node, error = %e, "Release skipped"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Distributor {
    config: DistributionConfig,
}

impl Distributor {
    pub fn new(config: DistributionConfig) -> Self {
        Self { config }
    }

    /// Place a `planned` shard on the nodes of its current plan
    pub async fn distribute(
        &self,
        shards: &ShardRegistry,
        fleet: &NodeRegistry,
        id: ShardId,
    ) -> Result<Shard> {
        let mut guard = shards.acquire(id).await?;

        let plan = match (guard.status, &guard.current_plan) {
            (ShardStatus::Planned, Some(plan)) => plan.clone(),
            (from, _) => return Err(illegal_transition(id, from, "distributed")),
        };

        let held = guard.held_nodes();
        let placement = reserve_targets(fleet, &guard, &plan.backup_nodes, &held)?;

        if placement.nodes.is_empty() {
            let reason = placement
                .skipped
                .iter()
                .map(|(node, why)| format!("{}: {}", node, why))
                .collect::<Vec<_>>()
                .join("; ");
            return self.placement_failed(shards, fleet, &mut guard, reason).await;
        }

        let assigned = placement.nodes.clone();
        let event = if assigned.len() == guard.replication_factor {
            ShardEvent::Distributed {
                assigned: assigned.clone(),
            }
        } else {
            warn!(
                shard_id = %id,
                placed = assigned.len(),
                required = guard.replication_factor,
                "Shard under-replicated"
            );
            ShardEvent::UnderReplicated {
                assigned: assigned.clone(),
            }
        };

        // Uncommitted reservations are released if this fails or is cancelled.
        let shard = shards.apply(&mut guard, event).await?;
        placement.commit();

        let departed: Vec<NodeId> = held
            .into_iter()
            .filter(|n| !assigned.contains(n))
            .collect();
        release_departed(fleet, &shard, &departed);

        info!(
            shard_id = %id,
            status = %shard.status,
            nodes = assigned.len(),
            released = departed.len(),
            "Distribution complete"
        );
        Ok(shard)
    }

    async fn placement_failed(
        &self,
        shards: &ShardRegistry,
        fleet: &NodeRegistry,
        guard: &mut ShardGuard,
        reason: String,
    ) -> Result<Shard> {
        let id = guard.id;
        warn!(shard_id = %id, %reason, "No planned node accepted the shard");

        shards
            .apply(
                guard,
                ShardEvent::PlacementFailed {
                    reason: reason.clone(),
                },
            )
            .await?;

        if guard.placement_failures >= self.config.max_placement_attempts {
            let quarantine = format!(
                "placement failed {} consecutive times",
                guard.placement_failures
            );
            shards
                .apply(guard, ShardEvent::Quarantine { reason: quarantine })
                .await?;
            release_departed(fleet, guard, &guard.held_nodes());
        }

        Err(TesseraError::DistributionFailed {
            shard_id: id,
            status: guard.status,
            reason,
        })
    }
}

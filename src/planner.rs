//! Redundancy Planner
//!
//! Picks `replication_factor` distinct healthy nodes for a shard. Nodes are
//! ranked by a composite score, lower is better:
//!
//! ```text
//! score = latency_weight * latency / max_latency + load_weight * current_load
//! ```
//!
//! where `max_latency` is the slowest healthy candidate. Ties break by node
//! ID ascending, so equal nodes always produce the same plan. A load that is
//! not a number scores as fully loaded.
//!
//! Gap filling an `under_replicated` shard only considers nodes that hold
//! the shard or have room for it. If no such node is left beyond the current
//! assignment, planning is deferred without touching the shard.

use chrono::Utc;
use tessera_core_fleet::{NodeId, NodeRegistry, NodeSnapshot};
use tracing::{debug, info};

use crate::config::PlanningConfig;
use crate::error::{Result, TesseraError};
use crate::registry::{illegal_transition, ShardRegistry};
use crate::shard::{RedundancyPlan, Shard, ShardEvent, ShardId, ShardStatus};

/// A candidate node and its composite score
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredNode {
    pub id: NodeId,
    pub score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct RedundancyPlanner {
    config: PlanningConfig,
}

impl RedundancyPlanner {
    pub fn new(config: PlanningConfig) -> Self {
        Self { config }
    }

    /// Score and order candidates, best first
    pub fn rank(&self, candidates: &[&NodeSnapshot]) -> Vec<ScoredNode> {
        let max_latency = candidates.iter().map(|n| n.latency_ms).max().unwrap_or(0);

        let mut scored: Vec<ScoredNode> = candidates
            .iter()
            .map(|node| {
                let latency = if max_latency == 0 {
                    0.0
                } else {
                    node.latency_ms as f64 / max_latency as f64
                };
                let load = if node.current_load.is_nan() {
                    1.0
                } else {
                    node.current_load.clamp(0.0, 1.0)
                };
                ScoredNode {
                    id: node.id.clone(),
                    score: self.config.latency_weight * latency + self.config.load_weight * load,
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            a.score
                .total_cmp(&b.score)
                .then_with(|| a.id.cmp(&b.id))
        });
        scored
    }

    /// Build a plan from a node snapshot without touching any state
    ///
    /// Healthy nodes already assigned to the shard are kept first (gap
    /// filling); the rest of the plan comes from the ranking.
    pub fn select(
        &self,
        shard: &Shard,
        nodes: &[NodeSnapshot],
        exclude: &[NodeId],
    ) -> Result<RedundancyPlan> {
        self.build(shard, nodes, exclude, &shard.assigned_nodes)
    }

    /// Build a plan purely from the ranking, ignoring current assignments
    pub fn select_fresh(
        &self,
        shard: &Shard,
        nodes: &[NodeSnapshot],
        exclude: &[NodeId],
    ) -> Result<RedundancyPlan> {
        self.build(shard, nodes, exclude, &[])
    }

    fn build(
        &self,
        shard: &Shard,
        nodes: &[NodeSnapshot],
        exclude: &[NodeId],
        keep: &[NodeId],
    ) -> Result<RedundancyPlan> {
        let gap_fill = shard.status == ShardStatus::UnderReplicated;
        let held = shard.held_nodes();
        let healthy: Vec<&NodeSnapshot> = nodes
            .iter()
            .filter(|n| n.health.is_healthy() && !exclude.contains(&n.id))
            .filter(|n| {
                !gap_fill || held.contains(&n.id) || n.available() >= shard.required_capacity
            })
            .collect();

        let required = shard.replication_factor;
        let insufficient = || TesseraError::InsufficientNodes {
            shard_id: shard.id,
            status: shard.status,
            required,
            healthy: healthy.len(),
        };
        if gap_fill {
            // Nothing new to place on; a plan would only repeat the current one.
            if !healthy.iter().any(|n| !keep.contains(&n.id)) {
                return Err(insufficient());
            }
        } else if healthy.len() < required {
            return Err(insufficient());
        }
        let target = required.min(healthy.len());

        let mut selected: Vec<NodeId> = keep
            .iter()
            .filter(|id| healthy.iter().any(|n| &n.id == *id))
            .take(target)
            .cloned()
            .collect();

        for candidate in self.rank(&healthy) {
            if selected.len() == target {
                break;
            }
            if !selected.contains(&candidate.id) {
                debug!(shard_id = %shard.id, node = %candidate.id, score = candidate.score, "Selected node");
                selected.push(candidate.id);
            }
        }

        let original_node = shard
            .current_plan
            .as_ref()
            .and_then(|p| p.original_node.clone())
            .or_else(|| shard.held_nodes().into_iter().next());

        Ok(RedundancyPlan {
            shard_id: shard.id,
            original_node,
            backup_nodes: selected,
            created_at: Utc::now(),
        })
    }

    /// Plan a shard against the live node registry and commit `planned`
    ///
    /// `InsufficientNodes` leaves the shard untouched; the caller retries on
    /// a later tick.
    pub async fn plan(
        &self,
        shards: &ShardRegistry,
        fleet: &NodeRegistry,
        id: ShardId,
        exclude: &[NodeId],
    ) -> Result<Shard> {
        let mut guard = shards.acquire(id).await?;

        if !guard.status.is_plannable() {
            return Err(illegal_transition(id, guard.status, "planned"));
        }

        let plan = match self.select(&guard, &fleet.snapshot(), exclude) {
            Ok(plan) => plan,
            Err(e) => {
                info!(shard_id = %id, error = %e, "Planning deferred");
                return Err(e);
            }
        };

        info!(
            shard_id = %id,
            nodes = ?plan.backup_nodes.iter().map(NodeId::as_str).collect::<Vec<_>>(),
            "Redundancy plan created"
        );
        shards.apply(&mut guard, ShardEvent::Planned(plan)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::{ShardSpec, ShardStatus};
    use tessera_core_fleet::HealthStatus;

    fn node(id: &str, latency_ms: u32, load: f64, health: HealthStatus) -> NodeSnapshot {
        NodeSnapshot {
            id: NodeId::from(id),
            capacity: 10,
            reserved: 0,
            latency_ms,
            health,
            current_load: load,
            last_heartbeat: Utc::now(),
            shard_count: 0,
        }
    }

    fn validated(r: usize) -> Shard {
        let mut shard = Shard::from_spec(ShardSpec::new(b"x".to_vec(), r), Utc::now());
        shard.status = ShardStatus::Validated;
        shard
    }

    fn ids(plan: &RedundancyPlan) -> Vec<&str> {
        plan.backup_nodes.iter().map(NodeId::as_str).collect()
    }

    #[test]
    fn test_equal_scores_pick_lowest_ids() {
        let nodes: Vec<_> = ["n5", "n3", "n1", "n4", "n2"]
            .iter()
            .map(|id| node(id, 10, 0.1, HealthStatus::Healthy))
            .collect();

        let plan = RedundancyPlanner::default()
            .select(&validated(3), &nodes, &[])
            .unwrap();
        assert_eq!(ids(&plan), vec!["n1", "n2", "n3"]);
    }

    #[test]
    fn test_prefers_low_latency_and_load() {
        let nodes = vec![
            node("a", 100, 0.9, HealthStatus::Healthy),
            node("b", 10, 0.1, HealthStatus::Healthy),
            node("c", 50, 0.5, HealthStatus::Healthy),
        ];
        let plan = RedundancyPlanner::default()
            .select(&validated(2), &nodes, &[])
            .unwrap();
        assert_eq!(ids(&plan), vec!["b", "c"]);
    }

    #[test]
    fn test_unhealthy_nodes_never_selected() {
        let nodes = vec![
            node("a", 1, 0.0, HealthStatus::Degraded),
            node("b", 1, 0.0, HealthStatus::Unreachable),
            node("c", 90, 0.9, HealthStatus::Healthy),
        ];
        let plan = RedundancyPlanner::default()
            .select(&validated(1), &nodes, &[])
            .unwrap();
        assert_eq!(ids(&plan), vec!["c"]);
    }

    #[test]
    fn test_insufficient_nodes() {
        let nodes = vec![
            node("a", 1, 0.0, HealthStatus::Healthy),
            node("b", 1, 0.0, HealthStatus::Degraded),
        ];
        let err = RedundancyPlanner::default()
            .select(&validated(2), &nodes, &[])
            .unwrap_err();
        assert!(matches!(
            err,
            TesseraError::InsufficientNodes {
                required: 2,
                healthy: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_exclusions_respected() {
        let nodes = vec![
            node("a", 1, 0.0, HealthStatus::Healthy),
            node("b", 2, 0.0, HealthStatus::Healthy),
        ];
        let plan = RedundancyPlanner::default()
            .select(&validated(1), &nodes, &[NodeId::from("a")])
            .unwrap();
        assert_eq!(ids(&plan), vec!["b"]);
    }

    #[test]
    fn test_gap_fill_keeps_healthy_assignments() {
        let nodes = vec![
            node("a", 1, 0.0, HealthStatus::Healthy),
            node("b", 1, 0.0, HealthStatus::Healthy),
            node("z", 100, 0.9, HealthStatus::Healthy),
        ];
        let mut shard = validated(2);
        shard.status = ShardStatus::UnderReplicated;
        shard.assigned_nodes = vec![NodeId::from("z")];

        let plan = RedundancyPlanner::default().select(&shard, &nodes, &[]).unwrap();
        assert_eq!(ids(&plan), vec!["z", "a"]);
        assert_eq!(plan.original_node, Some(NodeId::from("z")));

        let fresh = RedundancyPlanner::default()
            .select_fresh(&shard, &nodes, &[])
            .unwrap();
        assert_eq!(ids(&fresh), vec!["a", "b"]);
    }

    #[test]
    fn test_gap_fill_skips_full_nodes() {
        let mut full = node("b", 1, 0.0, HealthStatus::Healthy);
        full.reserved = full.capacity;
        let nodes = vec![
            node("a", 1, 0.0, HealthStatus::Healthy),
            full,
            node("c", 90, 0.9, HealthStatus::Healthy),
        ];
        let mut shard = validated(3);
        shard.status = ShardStatus::UnderReplicated;
        shard.assigned_nodes = vec![NodeId::from("a")];

        let plan = RedundancyPlanner::default().select(&shard, &nodes, &[]).unwrap();
        assert_eq!(ids(&plan), vec!["a", "c"]);
    }

    #[test]
    fn test_gap_fill_deferred_when_no_node_has_room() {
        let mut full = node("b", 1, 0.0, HealthStatus::Healthy);
        full.reserved = full.capacity;
        let nodes = vec![node("a", 1, 0.0, HealthStatus::Healthy), full];
        let mut shard = validated(2);
        shard.status = ShardStatus::UnderReplicated;
        shard.assigned_nodes = vec![NodeId::from("a")];

        let err = RedundancyPlanner::default()
            .select(&shard, &nodes, &[])
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(
            err,
            TesseraError::InsufficientNodes {
                required: 2,
                healthy: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_nan_load_ranks_as_fully_loaded() {
        let nodes = vec![
            node("a", 10, f64::NAN, HealthStatus::Healthy),
            node("b", 10, 0.5, HealthStatus::Healthy),
            node("c", 10, 0.2, HealthStatus::Healthy),
        ];
        let candidates: Vec<&NodeSnapshot> = nodes.iter().collect();

        let ranked = RedundancyPlanner::default().rank(&candidates);
        let order: Vec<&str> = ranked.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(order, vec!["c", "b", "a"]);
        assert!(ranked.iter().all(|s| s.score.is_finite()));
    }
}

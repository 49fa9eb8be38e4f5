//! NodeRegistry: node table, health ingestion and capacity reservations

use crate::error::{FleetError, Result};
use crate::health::{HealthConfig, NodeHealthSource};
use crate::node::{HealthReport, HealthStatus, NodeId, NodeSnapshot};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Mutable state of one node, guarded by its own mutex
#[derive(Debug)]
struct NodeState {
    capacity: u64,
    reserved: u64,
    latency_ms: u32,
    health: HealthStatus,
    current_load: f64,
    last_heartbeat: DateTime<Utc>,
    /// shard key -> units held
    holdings: HashMap<String, u64>,
}

#[derive(Debug)]
struct NodeSlot {
    id: NodeId,
    state: Mutex<NodeState>,
}

impl NodeSlot {
    fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> NodeSnapshot {
        let state = self.lock();
        NodeSnapshot {
            id: self.id.clone(),
            capacity: state.capacity,
            reserved: state.reserved,
            latency_ms: state.latency_ms,
            health: state.health,
            current_load: state.current_load,
            last_heartbeat: state.last_heartbeat,
            shard_count: state.holdings.len(),
        }
    }

    /// Drop a shard's units; returns the amount freed (0 if not held)
    fn release(&self, shard: &str) -> u64 {
        let mut state = self.lock();
        match state.holdings.remove(shard) {
            Some(units) => {
                state.reserved = state.reserved.saturating_sub(units);
                units
            }
            None => 0,
        }
    }
}

/// Capacity held on one node for one shard
///
/// The reservation is released when dropped unless [`commit`](Self::commit)
/// was called. A placement that is abandoned (error, cancellation) therefore
/// never leaks capacity.
#[derive(Debug)]
#[must_use = "an uncommitted reservation is released when dropped"]
pub struct CapacityReservation {
    slot: Arc<NodeSlot>,
    shard: String,
    units: u64,
    armed: bool,
}

impl CapacityReservation {
    pub fn node_id(&self) -> &NodeId {
        &self.slot.id
    }

    pub fn units(&self) -> u64 {
        self.units
    }

    /// Keep the reservation; it now lives until an explicit `release`
    pub fn commit(mut self) -> NodeId {
        self.armed = false;
        self.slot.id.clone()
    }
}

impl Drop for CapacityReservation {
    fn drop(&mut self) {
        if self.armed {
            let freed = self.slot.release(&self.shard);
            debug!(
                node = %self.slot.id,
                shard = %self.shard,
                units = freed,
                "Released uncommitted reservation"
            );
        }
    }
}

/// Authoritative table of placement targets
///
/// Responsibilities:
/// - Maintain the set of known nodes and their effective health
/// - Apply heartbeats / metrics reports and expire silent nodes
/// - Reserve and release capacity atomically, one node at a time
///
/// Each node has its own lock, so placements on different nodes never
/// contend; the table lock is only held to look up or insert slots.
///
/// # Example
///
/// ```
/// use tessera_core_fleet::{HealthReport, NodeRegistry};
///
/// let registry = NodeRegistry::default();
/// registry.apply_report(HealthReport::healthy("node-1", 4, 10));
///
/// let reservation = registry.reserve(&"node-1".into(), "shard-a", 1).unwrap();
/// reservation.commit();
/// assert_eq!(registry.get(&"node-1".into()).unwrap().available(), 3);
/// ```
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<NodeId, Arc<NodeSlot>>>,
    config: HealthConfig,
}

impl NodeRegistry {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    fn slot(&self, id: &NodeId) -> Option<Arc<NodeSlot>> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn slots(&self) -> Vec<Arc<NodeSlot>> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Insert or update a node from a report; returns its effective health
    pub fn apply_report(&self, report: HealthReport) -> HealthStatus {
        let effective = self.config.classify(&report);

        if let Some(slot) = self.slot(&report.node_id) {
            let mut state = slot.lock();
            if state.health != effective {
                if effective.is_healthy() {
                    info!(node = %slot.id, from = %state.health, "Node recovered");
                } else {
                    warn!(node = %slot.id, from = %state.health, to = %effective, "Node health changed");
                }
            }
            if report.capacity < state.reserved {
                warn!(
                    node = %slot.id,
                    capacity = report.capacity,
                    reserved = state.reserved,
                    "Declared capacity dropped below reserved units"
                );
            }
            state.capacity = report.capacity;
            state.latency_ms = report.latency_ms;
            state.current_load = report.current_load;
            state.health = effective;
            state.last_heartbeat = report.observed_at;
            return effective;
        }

        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        // Another report may have inserted the node since the read above.
        let slot = nodes.entry(report.node_id.clone()).or_insert_with(|| {
            info!(node = %report.node_id, capacity = report.capacity, "Registering node");
            Arc::new(NodeSlot {
                id: report.node_id.clone(),
                state: Mutex::new(NodeState {
                    capacity: report.capacity,
                    reserved: 0,
                    latency_ms: report.latency_ms,
                    health: effective,
                    current_load: report.current_load,
                    last_heartbeat: report.observed_at,
                    holdings: HashMap::new(),
                }),
            })
        });
        let mut state = slot.lock();
        state.capacity = report.capacity;
        state.latency_ms = report.latency_ms;
        state.current_load = report.current_load;
        state.health = effective;
        state.last_heartbeat = report.observed_at;
        effective
    }

    /// Pull every pending report from a source; returns how many were applied
    pub async fn refresh(&self, source: &dyn NodeHealthSource) -> Result<usize> {
        let reports = source.poll().await?;
        let count = reports.len();
        for report in reports {
            self.apply_report(report);
        }
        debug!(reports = count, "Applied health reports");
        Ok(count)
    }

    /// Mark nodes whose heartbeat expired as unreachable; returns those changed
    pub fn expire_stale(&self, now: DateTime<Utc>) -> Vec<NodeId> {
        let mut expired = Vec::new();
        for slot in self.slots() {
            let mut state = slot.lock();
            if state.health != HealthStatus::Unreachable
                && self.config.is_expired(state.last_heartbeat, now)
            {
                warn!(
                    node = %slot.id,
                    last_heartbeat = %state.last_heartbeat,
                    "Heartbeat expired; marking node unreachable"
                );
                state.health = HealthStatus::Unreachable;
                expired.push(slot.id.clone());
            }
        }
        expired.sort();
        expired
    }

    /// Override a node's health (operator action or external monitor)
    pub fn set_health(&self, id: &NodeId, health: HealthStatus) -> Result<()> {
        let slot = self
            .slot(id)
            .ok_or_else(|| FleetError::NodeNotFound(id.to_string()))?;
        let mut state = slot.lock();
        if state.health != health {
            info!(node = %id, from = %state.health, to = %health, "Node health set");
            state.health = health;
        }
        Ok(())
    }

    /// Snapshot of every node, ordered by ID
    pub fn snapshot(&self) -> Vec<NodeSnapshot> {
        let mut nodes: Vec<NodeSnapshot> = self.slots().iter().map(|s| s.snapshot()).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Snapshot of healthy nodes only, ordered by ID
    pub fn healthy(&self) -> Vec<NodeSnapshot> {
        self.snapshot()
            .into_iter()
            .filter(|n| n.health.is_healthy())
            .collect()
    }

    pub fn get(&self, id: &NodeId) -> Option<NodeSnapshot> {
        self.slot(id).map(|s| s.snapshot())
    }

    /// Current health of a node (unknown nodes count as unreachable)
    pub fn health_of(&self, id: &NodeId) -> HealthStatus {
        self.slot(id)
            .map(|s| s.lock().health)
            .unwrap_or(HealthStatus::Unreachable)
    }

    /// Atomically check and reserve `units` on a node for `shard`
    ///
    /// The check and the decrement happen under the node's lock, so two
    /// concurrent placements can never oversubscribe the same node.
    pub fn reserve(&self, id: &NodeId, shard: &str, units: u64) -> Result<CapacityReservation> {
        let slot = self
            .slot(id)
            .ok_or_else(|| FleetError::NodeNotFound(id.to_string()))?;

        {
            let mut state = slot.lock();

            if !state.health.is_healthy() {
                return Err(FleetError::NodeUnavailable {
                    node_id: id.to_string(),
                    health: state.health,
                });
            }

            if state.holdings.contains_key(shard) {
                return Err(FleetError::AlreadyHeld {
                    node_id: id.to_string(),
                    shard: shard.to_string(),
                });
            }

            let available = state.capacity.saturating_sub(state.reserved);
            if available < units {
                return Err(FleetError::CapacityExceeded {
                    node_id: id.to_string(),
                    shard: shard.to_string(),
                    required: units,
                    available,
                });
            }

            state.reserved += units;
            state.holdings.insert(shard.to_string(), units);
        }

        Ok(CapacityReservation {
            slot,
            shard: shard.to_string(),
            units,
            armed: true,
        })
    }

    /// Free a shard's units on a node; returns the units freed
    ///
    /// Releasing a shard the node does not hold is a no-op.
    pub fn release(&self, id: &NodeId, shard: &str) -> Result<u64> {
        let slot = self
            .slot(id)
            .ok_or_else(|| FleetError::NodeNotFound(id.to_string()))?;
        let freed = slot.release(shard);
        if freed > 0 {
            debug!(node = %id, shard = %shard, units = freed, "Released capacity");
        }
        Ok(freed)
    }

    /// Whether a node currently holds a reservation for `shard`
    pub fn holds(&self, id: &NodeId, shard: &str) -> bool {
        self.slot(id)
            .map(|s| s.lock().holdings.contains_key(shard))
            .unwrap_or(false)
    }

    /// Remove a node from the table; its reservations disappear with it
    pub fn remove(&self, id: &NodeId) -> Result<NodeSnapshot> {
        let slot = self
            .nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .ok_or_else(|| FleetError::NodeNotFound(id.to_string()))?;
        info!(node = %id, "Node removed from registry");
        Ok(slot.snapshot())
    }

    pub fn len(&self) -> usize {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(nodes: &[(&str, u64)]) -> NodeRegistry {
        let registry = NodeRegistry::default();
        for (id, capacity) in nodes {
            registry.apply_report(HealthReport::healthy(*id, *capacity, 10));
        }
        registry
    }

    #[test]
    fn test_reserve_decrements_available() {
        let registry = registry_with(&[("node-1", 3)]);
        let id = NodeId::from("node-1");

        registry.reserve(&id, "s1", 2).unwrap().commit();

        let snap = registry.get(&id).unwrap();
        assert_eq!(snap.reserved, 2);
        assert_eq!(snap.available(), 1);
        assert_eq!(snap.shard_count, 1);
    }

    #[test]
    fn test_reserve_rejects_oversubscription() {
        let registry = registry_with(&[("node-1", 1)]);
        let id = NodeId::from("node-1");

        registry.reserve(&id, "s1", 1).unwrap().commit();
        let err = registry.reserve(&id, "s2", 1).unwrap_err();

        assert!(matches!(
            err,
            FleetError::CapacityExceeded {
                required: 1,
                available: 0,
                ..
            }
        ));
        assert_eq!(registry.get(&id).unwrap().reserved, 1);
    }

    #[test]
    fn test_dropped_reservation_is_released() {
        let registry = registry_with(&[("node-1", 2)]);
        let id = NodeId::from("node-1");

        {
            let _reservation = registry.reserve(&id, "s1", 2).unwrap();
            assert_eq!(registry.get(&id).unwrap().available(), 0);
        }

        assert_eq!(registry.get(&id).unwrap().available(), 2);
        assert!(!registry.holds(&id, "s1"));
    }

    #[test]
    fn test_release_is_idempotent() {
        let registry = registry_with(&[("node-1", 2)]);
        let id = NodeId::from("node-1");
        registry.reserve(&id, "s1", 1).unwrap().commit();

        assert_eq!(registry.release(&id, "s1").unwrap(), 1);
        assert_eq!(registry.release(&id, "s1").unwrap(), 0);
        assert_eq!(registry.get(&id).unwrap().reserved, 0);
    }

    #[test]
    fn test_unhealthy_node_rejects_reservation() {
        let registry = registry_with(&[("node-1", 5)]);
        let id = NodeId::from("node-1");
        registry.set_health(&id, HealthStatus::Degraded).unwrap();

        let err = registry.reserve(&id, "s1", 1).unwrap_err();
        assert!(matches!(err, FleetError::NodeUnavailable { .. }));
    }

    #[test]
    fn test_double_hold_rejected() {
        let registry = registry_with(&[("node-1", 5)]);
        let id = NodeId::from("node-1");
        registry.reserve(&id, "s1", 1).unwrap().commit();

        assert!(matches!(
            registry.reserve(&id, "s1", 1),
            Err(FleetError::AlreadyHeld { .. })
        ));
    }

    #[test]
    fn test_report_updates_existing_node() {
        let registry = registry_with(&[("node-1", 5)]);
        let id = NodeId::from("node-1");
        registry.reserve(&id, "s1", 2).unwrap().commit();

        registry.apply_report(HealthReport::healthy("node-1", 8, 3).with_load(0.5));

        let snap = registry.get(&id).unwrap();
        assert_eq!(snap.capacity, 8);
        assert_eq!(snap.reserved, 2);
        assert_eq!(snap.latency_ms, 3);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_expire_stale_marks_unreachable() {
        let registry = NodeRegistry::new(HealthConfig {
            heartbeat_timeout_secs: 10,
            ..Default::default()
        });
        let mut old = HealthReport::healthy("node-old", 1, 1);
        old.observed_at = Utc::now() - chrono::Duration::seconds(60);
        registry.apply_report(old);
        registry.apply_report(HealthReport::healthy("node-new", 1, 1));

        let expired = registry.expire_stale(Utc::now());

        assert_eq!(expired, vec![NodeId::from("node-old")]);
        assert_eq!(
            registry.health_of(&NodeId::from("node-old")),
            HealthStatus::Unreachable
        );
        assert_eq!(registry.healthy().len(), 1);
    }

    #[test]
    fn test_snapshot_sorted_by_id() {
        let registry = registry_with(&[("node-c", 1), ("node-a", 1), ("node-b", 1)]);
        let ids: Vec<String> = registry
            .snapshot()
            .into_iter()
            .map(|n| n.id.0)
            .collect();
        assert_eq!(ids, vec!["node-a", "node-b", "node-c"]);
    }

    #[test]
    fn test_remove_unknown_node() {
        let registry = NodeRegistry::default();
        assert!(matches!(
            registry.remove(&NodeId::from("ghost")),
            Err(FleetError::NodeNotFound(_))
        ));
    }
}

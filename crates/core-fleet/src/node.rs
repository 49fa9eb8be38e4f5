//! Node identity, health and snapshot types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier of a compute node
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

/// Node health as seen by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Accepting placements
    Healthy,
    /// Reachable but impaired; keeps existing shards, takes no new ones
    Degraded,
    /// Missed heartbeats or reported down
    Unreachable,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// Heartbeat / metrics sample pushed or pulled from a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub node_id: NodeId,

    /// Declared capacity in placement units
    pub capacity: u64,

    /// Observed round-trip latency in milliseconds
    pub latency_ms: u32,

    /// Health as reported by the node or its monitor
    pub health: HealthStatus,

    /// Utilization ratio (0.0 - 1.0)
    pub current_load: f64,

    /// When the sample was taken
    pub observed_at: DateTime<Utc>,
}

impl HealthReport {
    /// A healthy, idle node sample taken now
    pub fn healthy(node_id: impl Into<String>, capacity: u64, latency_ms: u32) -> Self {
        Self {
            node_id: NodeId::new(node_id),
            capacity,
            latency_ms,
            health: HealthStatus::Healthy,
            current_load: 0.0,
            observed_at: Utc::now(),
        }
    }

    pub fn with_load(mut self, current_load: f64) -> Self {
        self.current_load = current_load;
        self
    }

    pub fn with_health(mut self, health: HealthStatus) -> Self {
        self.health = health;
        self
    }
}

/// Point-in-time copy of a node's registry state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub capacity: u64,
    pub reserved: u64,
    pub latency_ms: u32,
    pub health: HealthStatus,
    pub current_load: f64,
    pub last_heartbeat: DateTime<Utc>,
    /// Number of shards currently placed on the node
    pub shard_count: usize,
}

impl NodeSnapshot {
    /// Units still free for new placements
    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.reserved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_ordering() {
        let mut ids = vec![NodeId::from("node-3"), NodeId::from("node-1")];
        ids.sort();
        assert_eq!(ids[0].as_str(), "node-1");
    }

    #[test]
    fn test_available_saturates() {
        let snap = NodeSnapshot {
            id: NodeId::from("n"),
            capacity: 2,
            reserved: 5,
            latency_ms: 1,
            health: HealthStatus::Healthy,
            current_load: 0.0,
            last_heartbeat: Utc::now(),
            shard_count: 0,
        };
        assert_eq!(snap.available(), 0);
    }

    #[test]
    fn test_health_display() {
        assert_eq!(HealthStatus::Unreachable.to_string(), "unreachable");
        assert!(HealthStatus::Healthy.is_healthy());
        assert!(!HealthStatus::Degraded.is_healthy());
    }
}

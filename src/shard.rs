/*!
 * Shard model: identity, lifecycle status, events and plans
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tessera_core_fleet::NodeId;
use uuid::Uuid;

use crate::validator::ValidationResult;

/// Unique shard identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(pub Uuid);

impl ShardId {
    pub fn new() -> Self {
        ShardId(Uuid::new_v4())
    }
}

impl Default for ShardId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ShardId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(ShardId)
    }
}

/// Lifecycle status of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStatus {
    /// Registered, not yet validated
    Unassigned,
    /// Passed integrity validation
    Validated,
    /// Failed integrity validation, may be re-validated
    Invalid,
    /// Has a redundancy plan awaiting placement
    Planned,
    /// Placed on exactly `replication_factor` nodes
    Distributed,
    /// Placed on fewer nodes than required
    UnderReplicated,
    /// Placement halted after a tamper signal
    Isolated,
    /// Terminal; requires operator action
    Quarantined,
}

impl ShardStatus {
    pub const ALL: [ShardStatus; 8] = [
        ShardStatus::Unassigned,
        ShardStatus::Validated,
        ShardStatus::Invalid,
        ShardStatus::Planned,
        ShardStatus::Distributed,
        ShardStatus::UnderReplicated,
        ShardStatus::Isolated,
        ShardStatus::Quarantined,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ShardStatus::Unassigned => "unassigned",
            ShardStatus::Validated => "validated",
            ShardStatus::Invalid => "invalid",
            ShardStatus::Planned => "planned",
            ShardStatus::Distributed => "distributed",
            ShardStatus::UnderReplicated => "under_replicated",
            ShardStatus::Isolated => "isolated",
            ShardStatus::Quarantined => "quarantined",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ShardStatus::Quarantined)
    }

    /// Whether the redundancy planner accepts a shard in this status
    pub fn is_plannable(&self) -> bool {
        matches!(
            self,
            ShardStatus::Validated | ShardStatus::UnderReplicated | ShardStatus::Isolated
        )
    }
}

impl fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShardStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ShardStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("Invalid shard status: {}", s))
    }
}

/// Opaque encryption metadata produced by the crypto service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionMetadata {
    /// Cipher identifier, e.g. "AES-256-GCM"
    pub algorithm: String,
    /// Key reference understood by the crypto service
    pub key_id: String,
    /// Hex-encoded nonce
    pub nonce: String,
}

/// Output of redundancy planning. Never mutated; a re-plan replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedundancyPlan {
    pub shard_id: ShardId,
    /// First node that held the shard before this plan, if any
    pub original_node: Option<NodeId>,
    /// Selected nodes, best first; length equals the replication factor
    pub backup_nodes: Vec<NodeId>,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle event applied through the shard registry
///
/// Each variant carries the data the transition commits, so the ledger
/// payload of an entry fully describes the state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ShardEvent {
    Validated(ValidationResult),
    ValidationFailed(ValidationResult),
    Quarantine { reason: String },
    Planned(RedundancyPlan),
    Distributed { assigned: Vec<NodeId> },
    UnderReplicated { assigned: Vec<NodeId> },
    PlacementFailed { reason: String },
    ReplicaLost { lost: Vec<NodeId> },
    Rebalanced(RedundancyPlan),
    Isolate { reason: String },
}

impl ShardEvent {
    /// Ledger action name
    pub fn name(&self) -> &'static str {
        match self {
            ShardEvent::Validated(_) => "validated",
            ShardEvent::ValidationFailed(_) => "validation_failed",
            ShardEvent::Quarantine { .. } => "quarantine",
            ShardEvent::Planned(_) => "planned",
            ShardEvent::Distributed { .. } => "distributed",
            ShardEvent::UnderReplicated { .. } => "under_replicated",
            ShardEvent::PlacementFailed { .. } => "placement_failed",
            ShardEvent::ReplicaLost { .. } => "replica_lost",
            ShardEvent::Rebalanced(_) => "rebalanced",
            ShardEvent::Isolate { .. } => "isolate",
        }
    }

    /// Status this event leads to from `from`, or None if illegal
    pub fn target(&self, from: ShardStatus) -> Option<ShardStatus> {
        use ShardStatus::*;

        match (self, from) {
            (ShardEvent::Validated(_), Unassigned | Invalid) => Some(Validated),
            (ShardEvent::ValidationFailed(_), Unassigned | Invalid) => Some(Invalid),
            (ShardEvent::Quarantine { .. }, Invalid | Planned) => Some(Quarantined),
            (ShardEvent::Planned(_), Validated | UnderReplicated | Isolated) => Some(Planned),
            (ShardEvent::Distributed { .. }, Planned) => Some(Distributed),
            (ShardEvent::UnderReplicated { .. }, Planned) => Some(UnderReplicated),
            (ShardEvent::PlacementFailed { .. }, Planned) => Some(Planned),
            (ShardEvent::ReplicaLost { .. }, Distributed) => Some(UnderReplicated),
            (ShardEvent::Rebalanced(_), Distributed) => Some(Distributed),
            (ShardEvent::Isolate { .. }, Validated | Planned | Distributed | UnderReplicated) => {
                Some(Isolated)
            }
            _ => None,
        }
    }
}

impl fmt::Display for ShardEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Input for shard registration
#[derive(Debug, Clone)]
pub struct ShardSpec {
    pub payload: Vec<u8>,
    pub replication_factor: usize,
    pub required_capacity: u64,
    pub encryption: Option<EncryptionMetadata>,
}

impl ShardSpec {
    pub fn new(payload: impl Into<Vec<u8>>, replication_factor: usize) -> Self {
        Self {
            payload: payload.into(),
            replication_factor,
            required_capacity: 1,
            encryption: None,
        }
    }

    pub fn with_encryption(mut self, metadata: EncryptionMetadata) -> Self {
        self.encryption = Some(metadata);
        self
    }

    pub fn with_required_capacity(mut self, units: u64) -> Self {
        self.required_capacity = units;
        self
    }
}

/// A unit of distribution and its lifecycle state
#[derive(Debug, Clone, PartialEq)]
pub struct Shard {
    pub id: ShardId,
    pub payload: Vec<u8>,
    /// BLAKE3 hex digest of the payload at registration
    pub integrity_digest: String,
    pub encryption: Option<EncryptionMetadata>,
    pub replication_factor: usize,
    pub required_capacity: u64,
    pub status: ShardStatus,
    /// Nodes holding the shard; ordered, duplicate-free
    pub assigned_nodes: Vec<NodeId>,
    /// Assignments invalidated by isolation whose capacity is not yet freed
    pub stale_nodes: Vec<NodeId>,
    pub current_plan: Option<RedundancyPlan>,
    pub validation_failures: u32,
    pub placement_failures: u32,
    /// Number of committed transitions (registration is revision 0)
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
}

impl Shard {
    pub(crate) fn from_spec(spec: ShardSpec, now: DateTime<Utc>) -> Self {
        let integrity_digest = compute_digest(&spec.payload);
        Self {
            id: ShardId::new(),
            payload: spec.payload,
            integrity_digest,
            encryption: spec.encryption,
            replication_factor: spec.replication_factor,
            required_capacity: spec.required_capacity,
            status: ShardStatus::Unassigned,
            assigned_nodes: Vec::new(),
            stale_nodes: Vec::new(),
            current_plan: None,
            validation_failures: 0,
            placement_failures: 0,
            revision: 0,
            created_at: now,
            last_transition_at: now,
        }
    }

    /// Key under which node registries record this shard's holdings
    pub fn holding_key(&self) -> String {
        self.id.to_string()
    }

    /// Idempotency key of the next ledger entry for this shard
    pub fn next_idempotency_key(&self) -> String {
        format!("{}:{}", self.id, self.revision + 1)
    }

    /// Every node that currently consumes capacity for this shard
    pub fn held_nodes(&self) -> Vec<NodeId> {
        let mut nodes = self.assigned_nodes.clone();
        for node in &self.stale_nodes {
            if !nodes.contains(node) {
                nodes.push(node.clone());
            }
        }
        nodes
    }

    /// Apply a legal event's effects; the caller has already checked legality
    pub(crate) fn apply(&mut self, event: &ShardEvent, target: ShardStatus, at: DateTime<Utc>) {
        match event {
            ShardEvent::ValidationFailed(_) => self.validation_failures += 1,
            ShardEvent::Planned(plan) => self.current_plan = Some(plan.clone()),
            ShardEvent::Distributed { assigned } | ShardEvent::UnderReplicated { assigned } => {
                self.assigned_nodes = assigned.clone();
                self.stale_nodes.clear();
                self.placement_failures = 0;
            }
            ShardEvent::PlacementFailed { .. } => self.placement_failures += 1,
            ShardEvent::ReplicaLost { lost } => {
                self.assigned_nodes.retain(|n| !lost.contains(n));
            }
            ShardEvent::Rebalanced(plan) => {
                self.assigned_nodes = plan.backup_nodes.clone();
                self.current_plan = Some(plan.clone());
            }
            ShardEvent::Isolate { .. } => {
                let assigned = std::mem::take(&mut self.assigned_nodes);
                for node in assigned {
                    if !self.stale_nodes.contains(&node) {
                        self.stale_nodes.push(node);
                    }
                }
            }
            ShardEvent::Validated(_) | ShardEvent::Quarantine { .. } => {}
        }

        self.status = target;
        self.revision += 1;
        self.last_transition_at = at;
    }
}

/// Content digest used for shard integrity (BLAKE3, lowercase hex)
pub fn compute_digest(payload: &[u8]) -> String {
    blake3::hash(payload).to_hex().to_string()
}

/// Ledger payload for the registration record
#[derive(Debug, Serialize)]
pub(crate) struct RegistrationRecord<'a> {
    pub integrity_digest: &'a str,
    pub replication_factor: usize,
    pub required_capacity: u64,
    pub payload_len: usize,
    pub encrypted: bool,
}

impl<'a> From<&'a Shard> for RegistrationRecord<'a> {
    fn from(shard: &'a Shard) -> Self {
        Self {
            integrity_digest: &shard.integrity_digest,
            replication_factor: shard.replication_factor,
            required_capacity: shard.required_capacity,
            payload_len: shard.payload.len(),
            encrypted: shard.encryption.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assigned(ids: &[&str]) -> Vec<NodeId> {
        ids.iter().map(|s| NodeId::from(*s)).collect()
    }

    #[test]
    fn test_status_round_trip_str() {
        for status in ShardStatus::ALL {
            assert_eq!(status.as_str().parse::<ShardStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<ShardStatus>().is_err());
    }

    #[test]
    fn test_legal_and_illegal_targets() {
        let lost = ShardEvent::ReplicaLost { lost: vec![] };
        assert_eq!(
            lost.target(ShardStatus::Distributed),
            Some(ShardStatus::UnderReplicated)
        );
        assert_eq!(lost.target(ShardStatus::Planned), None);

        let isolate = ShardEvent::Isolate {
            reason: "tamper".into(),
        };
        assert_eq!(isolate.target(ShardStatus::Isolated), None);
        assert_eq!(isolate.target(ShardStatus::Quarantined), None);
        assert_eq!(isolate.target(ShardStatus::Unassigned), None);

        let distribute = ShardEvent::Distributed { assigned: vec![] };
        assert_eq!(distribute.target(ShardStatus::Validated), None);
    }

    #[test]
    fn test_quarantine_is_terminal() {
        let events = vec![
            ShardEvent::Quarantine { reason: "x".into() },
            ShardEvent::PlacementFailed { reason: "x".into() },
            ShardEvent::Rebalanced(RedundancyPlan {
                shard_id: ShardId::new(),
                original_node: None,
                backup_nodes: vec![],
                created_at: Utc::now(),
            }),
            ShardEvent::Isolate { reason: "x".into() },
        ];
        for event in events {
            assert_eq!(event.target(ShardStatus::Quarantined), None, "{event}");
        }
    }

    #[test]
    fn test_isolate_moves_assignments_to_stale() {
        let now = Utc::now();
        let mut shard = Shard::from_spec(ShardSpec::new(b"abc".to_vec(), 2), now);
        shard.apply(
            &ShardEvent::UnderReplicated {
                assigned: assigned(&["a"]),
            },
            ShardStatus::UnderReplicated,
            now,
        );
        shard.apply(
            &ShardEvent::Isolate {
                reason: "tamper".into(),
            },
            ShardStatus::Isolated,
            now,
        );

        assert!(shard.assigned_nodes.is_empty());
        assert_eq!(shard.stale_nodes, assigned(&["a"]));
        assert_eq!(shard.held_nodes(), assigned(&["a"]));
        assert_eq!(shard.revision, 2);

        shard.apply(
            &ShardEvent::Distributed {
                assigned: assigned(&["b", "c"]),
            },
            ShardStatus::Distributed,
            now,
        );
        assert!(shard.stale_nodes.is_empty());
    }

    #[test]
    fn test_idempotency_key_tracks_revision() {
        let shard = Shard::from_spec(ShardSpec::new(b"abc".to_vec(), 1), Utc::now());
        assert_eq!(shard.next_idempotency_key(), format!("{}:1", shard.id));
    }

    #[test]
    fn test_digest_is_blake3_hex() {
        let digest = compute_digest(b"hello");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, compute_digest(b"hello"));
        assert_ne!(digest, compute_digest(b"hellp"));
    }
}

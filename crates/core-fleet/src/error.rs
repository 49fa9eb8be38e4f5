//! Error types for node registry operations

use crate::node::HealthStatus;
use thiserror::Error;

/// Result type for fleet operations
pub type Result<T> = std::result::Result<T, FleetError>;

/// Errors raised by the node registry
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FleetError {
    /// Node ID is not registered
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Node cannot take the requested units
    #[error("Node {node_id} capacity exceeded for shard {shard}: required {required}, available {available}")]
    CapacityExceeded {
        node_id: String,
        shard: String,
        required: u64,
        available: u64,
    },

    /// Node is not healthy enough to accept placements
    #[error("Node {node_id} is {health} and cannot accept placements")]
    NodeUnavailable {
        node_id: String,
        health: HealthStatus,
    },

    /// Node already holds a reservation for this shard
    #[error("Node {node_id} already holds shard {shard}")]
    AlreadyHeld { node_id: String, shard: String },

    /// Health source failed to produce reports
    #[error("Health source error: {0}")]
    Source(String),
}

impl FleetError {
    /// Whether this failure is specific to one node (the caller may try others)
    pub fn is_node_local(&self) -> bool {
        matches!(
            self,
            FleetError::CapacityExceeded { .. }
                | FleetError::NodeUnavailable { .. }
                | FleetError::AlreadyHeld { .. }
                | FleetError::NodeNotFound(_)
        )
    }
}

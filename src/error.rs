/*!
 * Error types for Tessera
 */

use std::fmt;
use thiserror::Error;

use crate::shard::{ShardId, ShardStatus};
use tessera_core_fleet::FleetError;
use tessera_core_ledger::LedgerError;

pub type Result<T> = std::result::Result<T, TesseraError>;

#[derive(Debug, Error)]
pub enum TesseraError {
    /// Shard ID is not registered
    #[error("Shard not found: {0}")]
    ShardNotFound(ShardId),

    /// Event is not legal for the shard's current status
    #[error("Invalid state transition for shard {shard_id}: {event} is not allowed from {from}")]
    InvalidStateTransition {
        shard_id: ShardId,
        from: ShardStatus,
        event: &'static str,
    },

    /// A transition would break a shard invariant (duplicate or excess assignments)
    #[error("Rejected {event} for shard {shard_id} in {from}: {reason}")]
    InvalidAssignment {
        shard_id: ShardId,
        from: ShardStatus,
        event: &'static str,
        reason: String,
    },

    /// Registration input rejected
    #[error("Invalid shard: {0}")]
    InvalidShard(String),

    /// Fewer healthy nodes than the replication factor
    #[error("Insufficient nodes for shard {shard_id} ({status}): {healthy} healthy, {required} required")]
    InsufficientNodes {
        shard_id: ShardId,
        status: ShardStatus,
        required: usize,
        healthy: usize,
    },

    /// No planned node accepted the shard
    #[error("Distribution failed for shard {shard_id} ({status}): {reason}")]
    DistributionFailed {
        shard_id: ShardId,
        status: ShardStatus,
        reason: String,
    },

    /// Ledger append or verification failed
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Ledger append failed while committing a transition
    #[error("Ledger append failed for shard {shard_id} ({from} -> {event}): {source}")]
    TransitionNotLogged {
        shard_id: ShardId,
        from: ShardStatus,
        event: &'static str,
        #[source]
        source: LedgerError,
    },

    /// Node registry failure that is not a per-node placement outcome
    #[error("Fleet error: {0}")]
    Fleet(#[from] FleetError),

    /// Crypto or attestation collaborator failed
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TesseraError {
    /// Whether the operation may succeed if rescheduled on a later tick
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Planning | ErrorCategory::Distribution
        )
    }

    /// Shard the error refers to, if any
    pub fn shard_id(&self) -> Option<ShardId> {
        match self {
            TesseraError::ShardNotFound(id) => Some(*id),
            TesseraError::InvalidStateTransition { shard_id, .. }
            | TesseraError::InvalidAssignment { shard_id, .. }
            | TesseraError::InsufficientNodes { shard_id, .. }
            | TesseraError::DistributionFailed { shard_id, .. }
            | TesseraError::TransitionNotLogged { shard_id, .. } => Some(*shard_id),
            _ => None,
        }
    }

    /// Get error category for logging and instrumentation
    pub fn category(&self) -> ErrorCategory {
        match self {
            TesseraError::InvalidShard(_) => ErrorCategory::Validation,
            TesseraError::InsufficientNodes { .. } => ErrorCategory::Planning,
            TesseraError::DistributionFailed { .. } => ErrorCategory::Distribution,
            TesseraError::InvalidStateTransition { .. } | TesseraError::InvalidAssignment { .. } => {
                ErrorCategory::State
            }
            TesseraError::Ledger(_) | TesseraError::TransitionNotLogged { .. } => {
                ErrorCategory::Ledger
            }
            TesseraError::ShardNotFound(_) => ErrorCategory::Lookup,
            TesseraError::Fleet(FleetError::NodeNotFound(_)) => ErrorCategory::Lookup,
            TesseraError::Fleet(_) => ErrorCategory::Distribution,
            TesseraError::Config(_) | TesseraError::Io(_) | TesseraError::Serialization(_) => {
                ErrorCategory::Config
            }
            TesseraError::Collaborator(_) => ErrorCategory::Collaborator,
        }
    }
}

/// Error category for classification and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Shard content or registration input rejected
    Validation,
    /// Not enough healthy nodes; rescheduled
    Planning,
    /// Placement could not complete; rescheduled
    Distribution,
    /// Illegal transition or broken invariant; caller must re-read state
    State,
    /// Ledger append or verification
    Ledger,
    /// Unknown shard or node
    Lookup,
    /// Configuration and file handling
    Config,
    /// External crypto, attestation or scoring service
    Collaborator,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Validation => write!(f, "validation"),
            ErrorCategory::Planning => write!(f, "planning"),
            ErrorCategory::Distribution => write!(f, "distribution"),
            ErrorCategory::State => write!(f, "state"),
            ErrorCategory::Ledger => write!(f, "ledger"),
            ErrorCategory::Lookup => write!(f, "lookup"),
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Collaborator => write!(f, "collaborator"),
        }
    }
}

/*!
 * Tessera - shard lifecycle and redundancy orchestration
 *
 * Opaque data fragments ("shards") are registered, validated, placed on a
 * fleet of nodes with a configurable replication factor, and isolated or
 * rebalanced when an external scorer flags them. Every lifecycle transition
 * is written to a hash-chained ledger before it takes effect.
 *
 * - Shard Registry: authoritative shard table and state machine
 * - Integrity Validator: structural, digest, auth-tag and attestation checks
 * - Redundancy Planner: deterministic scored node selection
 * - Distributor: capacity-aware placement with partial-placement handling
 * - Rebalancer: anomaly-driven isolation and rolling rebalance
 *
 * The node registry lives in `tessera-core-fleet`, the ledger in
 * `tessera-core-ledger`; the periodic scheduler is `tessera-sentinel`.
 */

pub mod anomaly;
pub mod config;
pub mod crypto;
pub mod distributor;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod planner;
pub mod rebalancer;
pub mod registry;
pub mod services;
pub mod shard;
pub mod validator;

// Re-export commonly used types
pub use anomaly::{AnomalyEvent, AnomalyKind, AnomalyOutcome};
pub use config::TesseraConfig;
pub use crypto::RingCryptoService;
pub use error::{ErrorCategory, Result, TesseraError};
pub use orchestrator::{Orchestrator, StepOutcome};
pub use registry::ShardRegistry;
pub use services::{AnomalyScorer, AttestationVerifier, CryptoService, FeatureVector};
pub use shard::{
    EncryptionMetadata, RedundancyPlan, Shard, ShardEvent, ShardId, ShardSpec, ShardStatus,
};
pub use validator::{ValidationFailure, ValidationResult};

pub use tessera_core_fleet as fleet;
pub use tessera_core_ledger as ledger;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

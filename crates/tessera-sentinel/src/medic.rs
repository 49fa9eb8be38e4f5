//! Medic: drives one shard toward placement
//!
//! Each treatment calls [`Orchestrator::advance`] until the shard comes to
//! rest (`distributed`, `quarantined`) or a step fails. Retryable failures
//! leave the shard for the next sweep.

use std::sync::Arc;
use tessera::{Orchestrator, ShardId, ShardStatus, StepOutcome};
use tracing::{debug, error, info};

/// A shard passes through at most validate, plan and distribute per treatment.
const MAX_STEPS: usize = 4;

/// How a treatment ended
#[derive(Debug, Clone, PartialEq)]
pub enum Treatment {
    /// The shard reached a resting status
    Settled(ShardStatus),
    /// Not touched under the current policy
    Skipped(ShardStatus),
    /// Retryable failure; try again next sweep
    Deferred(String),
    /// Non-retryable failure
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct MedicReport {
    pub shard_id: ShardId,
    /// Lifecycle steps committed
    pub steps: usize,
    pub treatment: Treatment,
}

pub struct Medic {
    orchestrator: Arc<Orchestrator>,
    auto_replan_isolated: bool,
}

impl Medic {
    pub fn new(orchestrator: Arc<Orchestrator>, auto_replan_isolated: bool) -> Self {
        Self {
            orchestrator,
            auto_replan_isolated,
        }
    }

    /// Whether a shard in this status needs attention
    pub fn needs_treatment(&self, status: ShardStatus) -> bool {
        match status {
            ShardStatus::Distributed | ShardStatus::Quarantined => false,
            ShardStatus::Isolated => self.auto_replan_isolated,
            _ => true,
        }
    }

    pub async fn treat(&self, id: ShardId) -> MedicReport {
        let mut steps = 0;

        let treatment = loop {
            let status = match self.orchestrator.shards().get(id).await {
                Ok(shard) => shard.status,
                Err(e) => break Treatment::Failed(e.to_string()),
            };
            if !self.needs_treatment(status) {
                break if steps == 0 && status == ShardStatus::Isolated {
                    Treatment::Skipped(status)
                } else {
                    Treatment::Settled(status)
                };
            }
            if steps == MAX_STEPS {
                break Treatment::Settled(status);
            }

            match self.orchestrator.advance(id).await {
                Ok(StepOutcome::Advanced { from, to }) => {
                    debug!(shard_id = %id, %from, %to, "Medic step");
                    steps += 1;
                }
                Ok(StepOutcome::Idle(status)) => break Treatment::Settled(status),
                Err(e) if e.is_retryable() => {
                    debug!(shard_id = %id, error = %e, "Treatment deferred");
                    break Treatment::Deferred(e.to_string());
                }
                Err(e) => {
                    error!(shard_id = %id, category = %e.category(), error = %e, "Treatment failed");
                    break Treatment::Failed(e.to_string());
                }
            }
        };

        if let Treatment::Settled(status) = &treatment {
            if steps > 0 {
                info!(shard_id = %id, steps, status = %status, "Shard treated");
            }
        }

        MedicReport {
            shard_id: id,
            steps,
            treatment,
        }
    }
}

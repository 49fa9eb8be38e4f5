//! Orchestrator: one handle over the whole shard pipeline
//!
//! Owns the shard registry, the node registry and the pipeline stages, and
//! exposes the operations a scheduler (see `tessera-sentinel`) drives:
//! register, validate, plan, distribute, isolate, anomaly handling, and a
//! single-step [`Orchestrator::advance`] that moves a shard one stage along
//! its lifecycle.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tessera_core_fleet::{HealthStatus, NodeId, NodeRegistry};
use tessera_core_ledger::LedgerAdapter;
use tracing::{debug, info, warn};

use crate::anomaly::{AnomalyEvent, AnomalyKind, AnomalyOutcome, ArchiveStats, ArchivedAnomaly};
use crate::config::TesseraConfig;
use crate::distributor::{release_departed, Distributor};
use crate::error::{Result, TesseraError};
use crate::planner::RedundancyPlanner;
use crate::rebalancer::Rebalancer;
use crate::registry::ShardRegistry;
use crate::services::{AnomalyScorer, AttestationVerifier, CryptoService, FeatureVector};
use crate::shard::{Shard, ShardEvent, ShardId, ShardSpec, ShardStatus};
use crate::validator::{IntegrityValidator, ValidationResult};

/// Result of a single [`Orchestrator::advance`] call
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The shard moved to a new status
    Advanced { from: ShardStatus, to: ShardStatus },
    /// Nothing to do for a shard in this status
    Idle(ShardStatus),
}

impl StepOutcome {
    pub fn is_advanced(&self) -> bool {
        matches!(self, StepOutcome::Advanced { .. })
    }
}

pub struct Orchestrator {
    config: TesseraConfig,
    shards: Arc<ShardRegistry>,
    fleet: Arc<NodeRegistry>,
    validator: IntegrityValidator,
    planner: RedundancyPlanner,
    distributor: Distributor,
    rebalancer: Rebalancer,
    crypto: Option<Arc<dyn CryptoService>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("shards", &self.shards.len())
            .field("nodes", &self.fleet.len())
            .field("crypto", &self.crypto.is_some())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Build an orchestrator over an existing ledger
    pub fn new(config: TesseraConfig, ledger: Arc<dyn LedgerAdapter>) -> Self {
        let planner = RedundancyPlanner::new(config.planning.clone());
        Self {
            shards: Arc::new(ShardRegistry::new(ledger)),
            fleet: Arc::new(NodeRegistry::new(config.fleet.clone())),
            validator: IntegrityValidator::new(config.validation.clone()),
            distributor: Distributor::new(config.distribution.clone()),
            rebalancer: Rebalancer::new(config.anomaly.clone(), planner.clone()),
            planner,
            crypto: None,
            config,
        }
    }

    /// Validate the configuration and open its ledger backend
    pub fn from_config(config: TesseraConfig) -> Result<Self> {
        config.validate()?;
        let ledger = config.ledger.open()?;
        Ok(Self::new(config, ledger))
    }

    pub fn with_crypto(mut self, crypto: Arc<dyn CryptoService>) -> Self {
        self.validator = self.validator.with_crypto(crypto.clone());
        self.crypto = Some(crypto);
        self
    }

    pub fn with_attestation(mut self, verifier: Arc<dyn AttestationVerifier>) -> Self {
        self.validator = self.validator.with_attestation(verifier);
        self
    }

    pub fn config(&self) -> &TesseraConfig {
        &self.config
    }

    pub fn shards(&self) -> &Arc<ShardRegistry> {
        &self.shards
    }

    pub fn fleet(&self) -> &Arc<NodeRegistry> {
        &self.fleet
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerAdapter> {
        self.shards.ledger()
    }

    /// Encrypt plaintext and register the ciphertext as a new shard
    pub async fn ingest(&self, plaintext: &[u8], replication_factor: usize) -> Result<Shard> {
        let crypto = self
            .crypto
            .as_ref()
            .ok_or_else(|| TesseraError::Collaborator("no crypto service configured".to_string()))?;

        let (ciphertext, metadata) = crypto.encrypt(plaintext).await?;
        debug!(
            bytes = ciphertext.len(),
            key_id = %metadata.key_id,
            "Payload encrypted for ingest"
        );
        self.register(ShardSpec::new(ciphertext, replication_factor).with_encryption(metadata))
            .await
    }

    pub async fn register(&self, spec: ShardSpec) -> Result<Shard> {
        self.shards.register(spec).await
    }

    pub async fn validate(&self, id: ShardId) -> Result<ValidationResult> {
        self.validator.validate(&self.shards, id).await
    }

    /// Plan a shard; `exclude` removes nodes on top of the health filter
    pub async fn plan(&self, id: ShardId, exclude: &[NodeId]) -> Result<Shard> {
        self.planner.plan(&self.shards, &self.fleet, id, exclude).await
    }

    pub async fn distribute(&self, id: ShardId) -> Result<Shard> {
        self.distributor.distribute(&self.shards, &self.fleet, id).await
    }

    /// Isolate a shard directly, outside anomaly processing
    pub async fn isolate(&self, id: ShardId, reason: impl Into<String>) -> Result<Shard> {
        let shard = self
            .shards
            .transition(
                id,
                ShardEvent::Isolate {
                    reason: reason.into(),
                },
            )
            .await?;
        warn!(shard_id = %id, stale = shard.stale_nodes.len(), "Shard isolated");
        Ok(shard)
    }

    pub fn submit_anomaly(&self, event: AnomalyEvent) {
        self.rebalancer.submit(event);
    }

    pub async fn handle_anomaly(&self, event: AnomalyEvent) -> Result<Option<AnomalyOutcome>> {
        self.rebalancer.handle(&self.shards, &self.fleet, event).await
    }

    /// Process every queued anomaly in detection order
    pub async fn process_anomalies(&self) -> Vec<(AnomalyEvent, AnomalyOutcome)> {
        self.rebalancer.process_pending(&self.shards, &self.fleet).await
    }

    /// Process events received together, in detection order
    pub async fn process_anomaly_batch(
        &self,
        events: Vec<AnomalyEvent>,
    ) -> Vec<(AnomalyEvent, AnomalyOutcome)> {
        self.rebalancer
            .process_batch(&self.shards, &self.fleet, events)
            .await
    }

    pub async fn score_and_submit(
        &self,
        scorer: &dyn AnomalyScorer,
        shard_id: ShardId,
        kind: AnomalyKind,
        features: &FeatureVector,
    ) -> Result<AnomalyEvent> {
        self.rebalancer
            .score_and_submit(scorer, shard_id, kind, features)
            .await
    }

    pub fn archived_anomalies(&self) -> Vec<ArchivedAnomaly> {
        self.rebalancer.archived()
    }

    pub fn anomaly_archive_stats(&self) -> ArchiveStats {
        self.rebalancer.archive_stats()
    }

    /// Move a shard one stage along its lifecycle
    ///
    /// Retryable failures (`InsufficientNodes`, `DistributionFailed`) are
    /// returned as errors and leave the shard where it was, apart from the
    /// placement-failure count.
    pub async fn advance(&self, id: ShardId) -> Result<StepOutcome> {
        let from = self.shards.get(id).await?.status;

        let to = match from {
            ShardStatus::Unassigned | ShardStatus::Invalid => {
                self.validate(id).await?;
                self.shards.get(id).await?.status
            }
            ShardStatus::Validated | ShardStatus::UnderReplicated | ShardStatus::Isolated => {
                self.plan(id, &[]).await?.status
            }
            ShardStatus::Planned => self.distribute(id).await?.status,
            ShardStatus::Distributed | ShardStatus::Quarantined => {
                return Ok(StepOutcome::Idle(from));
            }
        };

        debug!(shard_id = %id, %from, %to, "Shard advanced");
        Ok(StepOutcome::Advanced { from, to })
    }

    /// Expire silent nodes and demote shards that lost a replica
    ///
    /// Every `distributed` shard with an assigned node that is now
    /// unreachable moves to `under_replicated`; the lost node's capacity is
    /// released. Returns the demoted shard IDs.
    pub async fn reconcile_fleet(&self, now: DateTime<Utc>) -> Result<Vec<ShardId>> {
        let expired = self.fleet.expire_stale(now);
        if !expired.is_empty() {
            info!(nodes = expired.len(), "Expired nodes with stale heartbeats");
        }

        let mut demoted = Vec::new();
        for id in self.shards.ids_with_status(ShardStatus::Distributed).await {
            let mut guard = self.shards.acquire(id).await?;
            if guard.status != ShardStatus::Distributed {
                continue;
            }

            let lost: Vec<NodeId> = guard
                .assigned_nodes
                .iter()
                .filter(|n| self.fleet.health_of(n) == HealthStatus::Unreachable)
                .cloned()
                .collect();
            if lost.is_empty() {
                continue;
            }

            let shard = self
                .shards
                .apply(&mut guard, ShardEvent::ReplicaLost { lost: lost.clone() })
                .await?;
            release_departed(&self.fleet, &shard, &lost);
            warn!(
                shard_id = %id,
                lost = lost.len(),
                remaining = shard.assigned_nodes.len(),
                "Replica lost; shard under-replicated"
            );
            demoted.push(id);
        }
        Ok(demoted)
    }

    /// Verify the whole ledger chain
    pub async fn verify_ledger(&self) -> Result<bool> {
        Ok(self.ledger().verify_all().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core_fleet::HealthReport;
    use tessera_core_ledger::MemoryLedger;

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(TesseraConfig::default(), Arc::new(MemoryLedger::new()))
    }

    fn add_nodes(orch: &Orchestrator, ids: &[&str]) {
        for id in ids {
            orch.fleet().apply_report(HealthReport::healthy(*id, 4, 10));
        }
    }

    #[tokio::test]
    async fn test_advance_walks_lifecycle() {
        let orch = orchestrator();
        add_nodes(&orch, &["a", "b"]);
        let shard = orch.register(ShardSpec::new(b"payload".to_vec(), 2)).await.unwrap();

        let steps = [
            (ShardStatus::Unassigned, ShardStatus::Validated),
            (ShardStatus::Validated, ShardStatus::Planned),
            (ShardStatus::Planned, ShardStatus::Distributed),
        ];
        for (from, to) in steps {
            assert_eq!(
                orch.advance(shard.id).await.unwrap(),
                StepOutcome::Advanced { from, to }
            );
        }
        assert_eq!(
            orch.advance(shard.id).await.unwrap(),
            StepOutcome::Idle(ShardStatus::Distributed)
        );
        assert!(orch.verify_ledger().await.unwrap());
    }

    #[tokio::test]
    async fn test_advance_defers_without_nodes() {
        let orch = orchestrator();
        let shard = orch.register(ShardSpec::new(b"payload".to_vec(), 1)).await.unwrap();
        orch.advance(shard.id).await.unwrap();

        let err = orch.advance(shard.id).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            orch.shards().get(shard.id).await.unwrap().status,
            ShardStatus::Validated
        );
    }

    #[tokio::test]
    async fn test_ingest_requires_crypto() {
        let err = orchestrator().ingest(b"secret", 1).await.unwrap_err();
        assert!(matches!(err, TesseraError::Collaborator(_)));
    }

    #[tokio::test]
    async fn test_reconcile_demotes_lost_replica() {
        let orch = orchestrator();
        add_nodes(&orch, &["a", "b"]);
        let shard = orch.register(ShardSpec::new(b"payload".to_vec(), 2)).await.unwrap();
        for _ in 0..3 {
            orch.advance(shard.id).await.unwrap();
        }

        orch.fleet()
            .set_health(&NodeId::from("b"), HealthStatus::Unreachable)
            .unwrap();
        let demoted = orch.reconcile_fleet(Utc::now()).await.unwrap();

        assert_eq!(demoted, vec![shard.id]);
        let shard = orch.shards().get(shard.id).await.unwrap();
        assert_eq!(shard.status, ShardStatus::UnderReplicated);
        assert_eq!(shard.assigned_nodes, vec![NodeId::from("a")]);
        assert_eq!(orch.fleet().get(&NodeId::from("b")).unwrap().reserved, 0);
    }

    #[tokio::test]
    async fn test_isolate_rejected_for_unassigned() {
        let orch = orchestrator();
        let shard = orch.register(ShardSpec::new(b"payload".to_vec(), 1)).await.unwrap();

        let err = orch.isolate(shard.id, "manual").await.unwrap_err();
        assert!(matches!(err, TesseraError::InvalidStateTransition { .. }));
    }
}

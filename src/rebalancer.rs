//! Anomaly-Triggered Rebalancer
//!
//! Consumes scored [`AnomalyEvent`]s and reacts per shard:
//!
//! - `tamper_detected` at or above the isolation threshold isolates the
//!   shard at once; its assignments become stale but keep their capacity
//!   until a new placement commits.
//! - `high_bounce_rate`, `resource_overload`, and tamper signals between the
//!   two thresholds trigger a rolling rebalance: the shard stays
//!   `distributed` while the new nodes are reserved, the assignment swaps in
//!   one ledger entry, and old nodes are released afterwards. Any shortfall
//!   keeps the old placement.
//! - Everything else is ignored and archived.
//!
//! A batch is processed in detection order. Each shard keeps the
//! `detected_at` of the last event processed for it; an event at or before
//! that mark is a duplicate or arrived out of order and is dropped.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tessera_core_fleet::{NodeId, NodeRegistry};
use tracing::{debug, info, warn};

use crate::anomaly::{
    clamp_severity, AnomalyArchive, AnomalyEvent, AnomalyKind, AnomalyOutcome, ArchiveStats,
    ArchivedAnomaly,
};
use crate::config::AnomalyConfig;
use crate::distributor::{release_departed, reserve_targets};
use crate::error::Result;
use crate::planner::RedundancyPlanner;
use crate::registry::ShardRegistry;
use crate::services::{AnomalyScorer, FeatureVector};
use crate::shard::{ShardEvent, ShardId, ShardStatus};

#[derive(Debug, Clone, PartialEq)]
enum Action {
    Isolate,
    Rebalance,
    Ignore(String),
}

#[derive(Debug)]
pub struct Rebalancer {
    config: AnomalyConfig,
    planner: RedundancyPlanner,
    /// Newest `detected_at` processed per shard
    high_water: Mutex<HashMap<ShardId, DateTime<Utc>>>,
    pending: Mutex<Vec<AnomalyEvent>>,
    archive: Mutex<AnomalyArchive>,
}

impl Rebalancer {
    pub fn new(config: AnomalyConfig, planner: RedundancyPlanner) -> Self {
        let archive = AnomalyArchive::new(config.archive_capacity);
        Self {
            config,
            planner,
            high_water: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            archive: Mutex::new(archive),
        }
    }

    /// Queue an event for the next [`process_pending`](Self::process_pending)
    pub fn submit(&self, event: AnomalyEvent) {
        debug!(shard_id = %event.shard_id, kind = %event.kind, severity = event.severity, "Anomaly queued");
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    pub fn pending_len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Score a feature vector with the external model and queue the result
    pub async fn score_and_submit(
        &self,
        scorer: &dyn AnomalyScorer,
        shard_id: ShardId,
        kind: AnomalyKind,
        features: &FeatureVector,
    ) -> Result<AnomalyEvent> {
        let raw = scorer.score(features).await?;
        let event = AnomalyEvent::new(shard_id, kind, raw);
        self.submit(event.clone());
        Ok(event)
    }

    /// Drain the queue and process it as one batch
    pub async fn process_pending(
        &self,
        shards: &ShardRegistry,
        fleet: &NodeRegistry,
    ) -> Vec<(AnomalyEvent, AnomalyOutcome)> {
        let events = std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));
        self.process_batch(shards, fleet, events).await
    }

    /// Process events in detection order; duplicates are dropped
    pub async fn process_batch(
        &self,
        shards: &ShardRegistry,
        fleet: &NodeRegistry,
        mut events: Vec<AnomalyEvent>,
    ) -> Vec<(AnomalyEvent, AnomalyOutcome)> {
        events.sort_by_key(|e| e.detected_at);

        let mut processed = Vec::with_capacity(events.len());
        for event in events {
            match self.handle(shards, fleet, event.clone()).await {
                Ok(Some(outcome)) => processed.push((event, outcome)),
                Ok(None) => {}
                Err(e) => {
                    warn!(shard_id = %event.shard_id, error = %e, "Anomaly processing failed");
                    processed.push((event, AnomalyOutcome::Failed(e.to_string())));
                }
            }
        }
        processed
    }

    /// Process one event; `Ok(None)` means it was dropped as a duplicate or
    /// as older than an event already processed for the shard
    pub async fn handle(
        &self,
        shards: &ShardRegistry,
        fleet: &NodeRegistry,
        event: AnomalyEvent,
    ) -> Result<Option<AnomalyOutcome>> {
        let previous = match self.advance_high_water(&event) {
            Ok(previous) => previous,
            Err(last) => {
                debug!(
                    shard_id = %event.shard_id,
                    detected_at = %event.detected_at,
                    last_processed = %last,
                    "Stale or duplicate anomaly dropped"
                );
                return Ok(None);
            }
        };

        let result = match self.decide(&event) {
            Action::Isolate => self.isolate(shards, &event).await,
            Action::Rebalance => self.rolling_rebalance(shards, fleet, event.shard_id).await,
            Action::Ignore(reason) => {
                debug!(shard_id = %event.shard_id, kind = %event.kind, %reason, "Anomaly ignored");
                Ok(AnomalyOutcome::Ignored(reason))
            }
        };

        if shards.get(event.shard_id).await.is_err() {
            self.restore_high_water(&event, previous);
        }

        let archived = match &result {
            Ok(outcome) => outcome.clone(),
            Err(e) => AnomalyOutcome::Failed(e.to_string()),
        };
        self.archive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(event, archived);

        result.map(Some)
    }

    /// Move the shard's mark to this event; `Err` carries the mark that
    /// rejected it
    fn advance_high_water(
        &self,
        event: &AnomalyEvent,
    ) -> std::result::Result<Option<DateTime<Utc>>, DateTime<Utc>> {
        let mut marks = self.high_water.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(&last) = marks.get(&event.shard_id) {
            if event.detected_at <= last {
                return Err(last);
            }
        }
        Ok(marks.insert(event.shard_id, event.detected_at))
    }

    /// Undo a mark for a shard the registry does not know, so unknown IDs
    /// never accumulate
    fn restore_high_water(&self, event: &AnomalyEvent, previous: Option<DateTime<Utc>>) {
        let mut marks = self.high_water.lock().unwrap_or_else(PoisonError::into_inner);
        if marks.get(&event.shard_id) != Some(&event.detected_at) {
            return;
        }
        match previous {
            Some(last) => marks.insert(event.shard_id, last),
            None => marks.remove(&event.shard_id),
        };
    }

    fn decide(&self, event: &AnomalyEvent) -> Action {
        let severity = clamp_severity(event.severity);

        match event.kind {
            AnomalyKind::Other => Action::Ignore("kind other is not actionable".to_string()),
            AnomalyKind::TamperDetected if severity >= self.config.isolation_threshold => {
                Action::Isolate
            }
            _ if severity >= self.config.rebalance_threshold => Action::Rebalance,
            _ => Action::Ignore(format!(
                "severity {:.2} below threshold {:.2}",
                severity, self.config.rebalance_threshold
            )),
        }
    }

    async fn isolate(&self, shards: &ShardRegistry, event: &AnomalyEvent) -> Result<AnomalyOutcome> {
        let mut guard = shards.acquire(event.shard_id).await?;

        if guard.status == ShardStatus::Isolated {
            return Ok(AnomalyOutcome::AlreadyIsolated);
        }

        let isolate = ShardEvent::Isolate {
            reason: format!("{} severity {:.2}", event.kind, event.severity),
        };
        if isolate.target(guard.status).is_none() {
            return Ok(AnomalyOutcome::Ignored(format!(
                "shard is {}",
                guard.status
            )));
        }

        shards.apply(&mut guard, isolate).await?;
        warn!(
            shard_id = %event.shard_id,
            severity = event.severity,
            stale = guard.stale_nodes.len(),
            "Shard isolated after tamper signal"
        );
        Ok(AnomalyOutcome::Isolated)
    }

    async fn rolling_rebalance(
        &self,
        shards: &ShardRegistry,
        fleet: &NodeRegistry,
        id: ShardId,
    ) -> Result<AnomalyOutcome> {
        let mut guard = shards.acquire(id).await?;

        if guard.status != ShardStatus::Distributed {
            return Ok(AnomalyOutcome::RebalanceSkipped(format!(
                "shard is {}",
                guard.status
            )));
        }

        let plan = match self.planner.select_fresh(&guard, &fleet.snapshot(), &[]) {
            Ok(plan) => plan,
            Err(e) if e.is_retryable() => return Ok(AnomalyOutcome::RebalanceSkipped(e.to_string())),
            Err(e) => return Err(e),
        };

        let old = guard.assigned_nodes.clone();
        let unchanged = plan.backup_nodes.len() == old.len()
            && plan.backup_nodes.iter().all(|n| old.contains(n));
        if unchanged {
            return Ok(AnomalyOutcome::RebalanceSkipped(
                "current placement is already optimal".to_string(),
            ));
        }

        let placement = reserve_targets(fleet, &guard, &plan.backup_nodes, &old)?;
        if placement.nodes.len() < guard.replication_factor {
            let reason = format!(
                "only {} of {} nodes accepted the shard",
                placement.nodes.len(),
                guard.replication_factor
            );
            // Dropping the placement releases its fresh reservations.
            drop(placement);
            info!(shard_id = %id, %reason, "Rolling rebalance abandoned; keeping placement");
            return Ok(AnomalyOutcome::RebalanceSkipped(reason));
        }

        let moved = placement.reservations.len();
        let new_nodes = plan.backup_nodes.clone();
        let shard = shards.apply(&mut guard, ShardEvent::Rebalanced(plan)).await?;
        placement.commit();

        let departed: Vec<NodeId> = old.into_iter().filter(|n| !new_nodes.contains(n)).collect();
        release_departed(fleet, &shard, &departed);

        info!(shard_id = %id, moved, released = departed.len(), "Rolling rebalance complete");
        Ok(AnomalyOutcome::Rebalanced(moved))
    }

    /// Snapshot of archived events, oldest first
    pub fn archived(&self) -> Vec<ArchivedAnomaly> {
        self.archive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries()
            .iter()
            .cloned()
            .collect()
    }

    pub fn archive_stats(&self) -> ArchiveStats {
        self.archive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlanningConfig;
    use crate::error::TesseraError;
    use crate::shard::{RedundancyPlan, ShardSpec};
    use crate::validator::ValidationResult;
    use async_trait::async_trait;
    use std::sync::Arc;
    use tessera_core_fleet::HealthReport;
    use tessera_core_ledger::{LedgerAdapter, MemoryLedger};

    fn rebalancer() -> Rebalancer {
        Rebalancer::new(AnomalyConfig::default(), RedundancyPlanner::new(PlanningConfig::default()))
    }

    async fn distributed(shards: &ShardRegistry, fleet: &NodeRegistry, nodes: &[&str]) -> ShardId {
        let shard = shards
            .register(ShardSpec::new(b"data".to_vec(), nodes.len()))
            .await
            .unwrap();
        let assigned: Vec<NodeId> = nodes.iter().map(|n| NodeId::from(*n)).collect();
        for node in &assigned {
            fleet.reserve(node, &shard.holding_key(), 1).unwrap().commit();
        }
        shards
            .transition(shard.id, ShardEvent::Validated(ValidationResult::passing(shard.id)))
            .await
            .unwrap();
        shards
            .transition(
                shard.id,
                ShardEvent::Planned(RedundancyPlan {
                    shard_id: shard.id,
                    original_node: None,
                    backup_nodes: assigned.clone(),
                    created_at: Utc::now(),
                }),
            )
            .await
            .unwrap();
        shards
            .transition(shard.id, ShardEvent::Distributed { assigned })
            .await
            .unwrap();
        shard.id
    }

    #[tokio::test]
    async fn test_tamper_isolates_with_one_entry() {
        let ledger = Arc::new(MemoryLedger::new());
        let shards = ShardRegistry::new(ledger.clone());
        let fleet = NodeRegistry::default();
        fleet.apply_report(HealthReport::healthy("a", 1, 10));
        let id = distributed(&shards, &fleet, &["a"]).await;
        let before = ledger.len().await;

        let outcome = rebalancer()
            .handle(&shards, &fleet, AnomalyEvent::new(id, AnomalyKind::TamperDetected, 0.95))
            .await
            .unwrap();

        assert_eq!(outcome, Some(AnomalyOutcome::Isolated));
        assert_eq!(ledger.len().await, before + 1);
        let shard = shards.get(id).await.unwrap();
        assert_eq!(shard.status, ShardStatus::Isolated);
        assert_eq!(shard.stale_nodes, vec![NodeId::from("a")]);
        // Stale capacity stays held until a new placement commits
        assert!(fleet.holds(&NodeId::from("a"), &shard.holding_key()));
    }

    #[tokio::test]
    async fn test_duplicate_event_processed_once() {
        let shards = ShardRegistry::new(Arc::new(MemoryLedger::new()));
        let fleet = NodeRegistry::default();
        fleet.apply_report(HealthReport::healthy("a", 1, 10));
        let id = distributed(&shards, &fleet, &["a"]).await;
        let rebalancer = rebalancer();
        let event = AnomalyEvent::new(id, AnomalyKind::TamperDetected, 0.9);

        let first = rebalancer.handle(&shards, &fleet, event.clone()).await.unwrap();
        let second = rebalancer.handle(&shards, &fleet, event).await.unwrap();

        assert_eq!(first, Some(AnomalyOutcome::Isolated));
        assert_eq!(second, None);
        assert_eq!(rebalancer.archived().len(), 1);
    }

    #[tokio::test]
    async fn test_second_tamper_reports_already_isolated() {
        let shards = ShardRegistry::new(Arc::new(MemoryLedger::new()));
        let fleet = NodeRegistry::default();
        fleet.apply_report(HealthReport::healthy("a", 1, 10));
        let id = distributed(&shards, &fleet, &["a"]).await;
        let rebalancer = rebalancer();
        let now = Utc::now();

        let outcomes = rebalancer
            .process_batch(
                &shards,
                &fleet,
                vec![
                    AnomalyEvent::new(id, AnomalyKind::TamperDetected, 0.9)
                        .at(now + chrono::Duration::seconds(1)),
                    AnomalyEvent::new(id, AnomalyKind::TamperDetected, 0.9).at(now),
                ],
            )
            .await;

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].0.detected_at, now);
        assert_eq!(outcomes[0].1, AnomalyOutcome::Isolated);
        assert_eq!(outcomes[1].1, AnomalyOutcome::AlreadyIsolated);
    }

    #[tokio::test]
    async fn test_low_severity_and_other_ignored() {
        let shards = ShardRegistry::new(Arc::new(MemoryLedger::new()));
        let fleet = NodeRegistry::default();
        let rebalancer = rebalancer();
        let id = ShardId::new();

        let low = rebalancer
            .handle(&shards, &fleet, AnomalyEvent::new(id, AnomalyKind::HighBounceRate, 0.2))
            .await
            .unwrap();
        let other = rebalancer
            .handle(&shards, &fleet, AnomalyEvent::new(id, AnomalyKind::Other, 1.0))
            .await
            .unwrap();

        assert!(matches!(low, Some(AnomalyOutcome::Ignored(_))));
        assert!(matches!(other, Some(AnomalyOutcome::Ignored(_))));
    }

    #[tokio::test]
    async fn test_rolling_rebalance_swaps_after_reserve() {
        let shards = ShardRegistry::new(Arc::new(MemoryLedger::new()));
        let fleet = NodeRegistry::default();
        fleet.apply_report(HealthReport::healthy("a", 1, 10));
        fleet.apply_report(HealthReport::healthy("b", 1, 10));
        let id = distributed(&shards, &fleet, &["a"]).await;
        // Node a reports heavy load; b becomes the better target
        fleet.apply_report(HealthReport::healthy("a", 1, 10).with_load(0.9));

        let outcome = rebalancer()
            .handle(&shards, &fleet, AnomalyEvent::new(id, AnomalyKind::ResourceOverload, 0.6))
            .await
            .unwrap();

        assert_eq!(outcome, Some(AnomalyOutcome::Rebalanced(1)));
        let shard = shards.get(id).await.unwrap();
        assert_eq!(shard.status, ShardStatus::Distributed);
        assert_eq!(shard.assigned_nodes, vec![NodeId::from("b")]);
        assert_eq!(fleet.get(&NodeId::from("a")).unwrap().reserved, 0);
        assert_eq!(fleet.get(&NodeId::from("b")).unwrap().reserved, 1);
    }

    #[tokio::test]
    async fn test_rolling_rebalance_shortfall_keeps_old_placement() {
        let shards = ShardRegistry::new(Arc::new(MemoryLedger::new()));
        let fleet = NodeRegistry::default();
        fleet.apply_report(HealthReport::healthy("a", 1, 10));
        fleet.apply_report(HealthReport::healthy("b", 0, 1));
        let id = distributed(&shards, &fleet, &["a"]).await;

        let outcome = rebalancer()
            .handle(&shards, &fleet, AnomalyEvent::new(id, AnomalyKind::HighBounceRate, 0.7))
            .await
            .unwrap();

        assert!(matches!(outcome, Some(AnomalyOutcome::RebalanceSkipped(_))));
        let shard = shards.get(id).await.unwrap();
        assert_eq!(shard.assigned_nodes, vec![NodeId::from("a")]);
        assert_eq!(fleet.get(&NodeId::from("a")).unwrap().reserved, 1);
        assert_eq!(fleet.get(&NodeId::from("b")).unwrap().reserved, 0);
    }

    #[tokio::test]
    async fn test_unknown_shard_archived_as_failed() {
        let shards = ShardRegistry::new(Arc::new(MemoryLedger::new()));
        let fleet = NodeRegistry::default();
        let rebalancer = rebalancer();

        let err = rebalancer
            .handle(
                &shards,
                &fleet,
                AnomalyEvent::new(ShardId::new(), AnomalyKind::TamperDetected, 0.99),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TesseraError::ShardNotFound(_)));
        assert!(matches!(
            rebalancer.archived()[0].outcome,
            AnomalyOutcome::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_event_older_than_last_processed_is_dropped() {
        let shards = ShardRegistry::new(Arc::new(MemoryLedger::new()));
        let fleet = NodeRegistry::default();
        fleet.apply_report(HealthReport::healthy("a", 1, 10));
        let id = distributed(&shards, &fleet, &["a"]).await;
        let rebalancer = rebalancer();
        let now = Utc::now();

        let newer = rebalancer
            .handle(
                &shards,
                &fleet,
                AnomalyEvent::new(id, AnomalyKind::TamperDetected, 0.95)
                    .at(now + chrono::Duration::seconds(5)),
            )
            .await
            .unwrap();
        let late = rebalancer
            .handle(
                &shards,
                &fleet,
                AnomalyEvent::new(id, AnomalyKind::HighBounceRate, 0.1).at(now),
            )
            .await
            .unwrap();

        assert_eq!(newer, Some(AnomalyOutcome::Isolated));
        assert_eq!(late, None);
        let archived = rebalancer.archived();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].event.kind, AnomalyKind::TamperDetected);
    }

    #[tokio::test]
    async fn test_unknown_shards_leave_no_marks() {
        let shards = ShardRegistry::new(Arc::new(MemoryLedger::new()));
        let fleet = NodeRegistry::default();
        let rebalancer = rebalancer();

        for _ in 0..50 {
            let _ = rebalancer
                .handle(
                    &shards,
                    &fleet,
                    AnomalyEvent::new(ShardId::new(), AnomalyKind::HighBounceRate, 0.1),
                )
                .await;
        }

        assert!(rebalancer
            .high_water
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty());
        assert_eq!(rebalancer.archived().len(), 50);
    }

    struct FixedScorer(f64);

    #[async_trait]
    impl AnomalyScorer for FixedScorer {
        async fn score(&self, _features: &FeatureVector) -> Result<f64> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn test_score_and_submit_clamps_and_queues() {
        let rebalancer = rebalancer();
        let event = rebalancer
            .score_and_submit(
                &FixedScorer(3.0),
                ShardId::new(),
                AnomalyKind::TamperDetected,
                &FeatureVector::new().with("entropy", 7.9),
            )
            .await
            .unwrap();

        assert_eq!(event.severity, 1.0);
        assert_eq!(rebalancer.pending_len(), 1);
    }
}

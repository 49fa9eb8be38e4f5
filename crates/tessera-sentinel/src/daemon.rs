//! Sentinel Daemon: the scheduling loop
//!
//! Every tick runs one sweep:
//!
//! 1. Poll the node health source (if attached) and expire silent nodes
//! 2. Demote distributed shards that lost a replica
//! 3. Process queued anomaly events
//! 4. Treat every shard that is not at rest, in parallel up to
//!    `max_parallel_ops`
//!
//! Anomalies reported through the [`SentinelHandle`] are consumed by the
//! same background task between sweeps. Everything already queued is taken
//! as one batch and processed in detection order.

use anyhow::{anyhow, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tessera::fleet::NodeHealthSource;
use tessera::{AnomalyEvent, AnomalyOutcome, Orchestrator};
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::medic::{Medic, MedicReport, Treatment};
use crate::metrics::{SweepStats, SweepStatsBuilder};
use crate::policy::SentinelPolicy;

pub struct Sentinel {
    orchestrator: Arc<Orchestrator>,
    medic: Arc<Medic>,
    policy: SentinelPolicy,
    /// Caps concurrent shard treatments within a sweep
    semaphore: Arc<Semaphore>,
    health_source: Option<Arc<dyn NodeHealthSource>>,
}

impl Sentinel {
    pub fn new(orchestrator: Arc<Orchestrator>, policy: SentinelPolicy) -> Result<Self> {
        policy
            .validate()
            .map_err(|e| anyhow!("Invalid Sentinel policy: {}", e))?;

        let medic = Arc::new(Medic::new(
            orchestrator.clone(),
            policy.auto_replan_isolated,
        ));
        let permits = policy.max_parallel_ops;

        Ok(Self {
            orchestrator,
            medic,
            policy,
            semaphore: Arc::new(Semaphore::new(permits)),
            health_source: None,
        })
    }

    /// Poll this source for node reports at the start of every sweep
    pub fn with_health_source(mut self, source: Arc<dyn NodeHealthSource>) -> Self {
        self.health_source = Some(source);
        self
    }

    pub fn policy(&self) -> &SentinelPolicy {
        &self.policy
    }

    /// Start the background loop
    ///
    /// Returns a handle for reporting anomalies and requesting shutdown, and
    /// the task's JoinHandle.
    pub fn spawn(self) -> (SentinelHandle, JoinHandle<Result<()>>) {
        let (anomaly_tx, anomaly_rx) = mpsc::channel(self.policy.anomaly_queue_capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move { self.run(anomaly_rx, shutdown_rx).await });

        let handle = SentinelHandle {
            anomaly_tx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
        };
        (handle, task)
    }

    async fn run(
        self,
        mut anomaly_rx: mpsc::Receiver<AnomalyEvent>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> Result<()> {
        info!(
            scan_interval_s = self.policy.scan_interval_s,
            max_parallel_ops = self.policy.max_parallel_ops,
            auto_replan_isolated = self.policy.auto_replan_isolated,
            "🛡️  Sentinel active"
        );

        let mut interval = tokio::time::interval(Duration::from_secs(self.policy.scan_interval_s));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(event) = anomaly_rx.recv() => {
                    let batch = drain_ready(&mut anomaly_rx, vec![event]);
                    self.consume_anomalies(batch).await;
                }

                _ = interval.tick() => {
                    self.run_sweep().await;
                }

                _ = &mut shutdown_rx => {
                    anomaly_rx.close();
                    let mut batch = Vec::new();
                    while let Some(event) = anomaly_rx.recv().await {
                        batch.push(event);
                    }
                    let drained = batch.len();
                    self.consume_anomalies(batch).await;
                    info!(drained, "Sentinel stopped");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn consume_anomalies(&self, batch: Vec<AnomalyEvent>) {
        let received = batch.len();
        let processed = self.orchestrator.process_anomaly_batch(batch).await;
        for (event, outcome) in &processed {
            match outcome {
                AnomalyOutcome::Failed(reason) => {
                    error!(shard_id = %event.shard_id, %reason, "Anomaly handling failed")
                }
                _ => info!(shard_id = %event.shard_id, %outcome, "Anomaly handled"),
            }
        }
        if processed.len() < received {
            debug!(dropped = received - processed.len(), "Stale or duplicate anomalies dropped");
        }
    }

    /// Execute a single sweep
    pub async fn run_sweep(&self) -> SweepStats {
        info!("🔭 Sentinel: starting sweep");
        let mut builder = SweepStatsBuilder::new();

        if let Some(source) = &self.health_source {
            match self.orchestrator.fleet().refresh(source.as_ref()).await {
                Ok(reports) => debug!(reports, "Node health refreshed"),
                Err(e) => warn!(error = %e, "Node health refresh failed"),
            }
        }

        match self.orchestrator.reconcile_fleet(Utc::now()).await {
            Ok(demoted) => builder.record_replicas_lost(demoted.len()),
            Err(e) => error!(error = %e, "Fleet reconciliation failed"),
        }

        let anomalies = self.orchestrator.process_anomalies().await;
        builder.record_anomalies(anomalies.len());

        let mut tasks = JoinSet::new();
        for shard in self.orchestrator.shards().list().await {
            if !self.medic.needs_treatment(shard.status) {
                continue;
            }
            let permit = match self.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let medic = self.medic.clone();
            tasks.spawn(async move {
                let report = medic.treat(shard.id).await;
                drop(permit);
                report
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => record_report(&mut builder, &report),
                Err(e) => {
                    error!(error = %e, "Treatment task aborted");
                    builder.record_failed();
                }
            }
        }

        for (status, count) in self.orchestrator.shards().status_counts().await {
            builder.record_status(status, count);
        }

        let stats = builder.finish();
        report_health(&stats);
        stats
    }
}

/// Append every event already waiting on the channel
fn drain_ready(
    rx: &mut mpsc::Receiver<AnomalyEvent>,
    mut batch: Vec<AnomalyEvent>,
) -> Vec<AnomalyEvent> {
    while let Ok(event) = rx.try_recv() {
        batch.push(event);
    }
    batch
}

fn record_report(builder: &mut SweepStatsBuilder, report: &MedicReport) {
    builder.record_advanced(report.steps);
    match &report.treatment {
        Treatment::Settled(_) | Treatment::Skipped(_) => {}
        Treatment::Deferred(_) => builder.record_deferred(),
        Treatment::Failed(_) => builder.record_failed(),
    }
}

fn report_health(stats: &SweepStats) {
    info!("📊 {}", stats.summary());

    if stats.replicas_lost > 0 {
        warn!(shards = stats.replicas_lost, "Replica loss detected this sweep");
    }

    if stats.quarantined > 0 {
        warn!(shards = stats.quarantined, "Shards quarantined; operator action required");
    }

    let ratio = stats.health_ratio() * 100.0;
    if stats.health_ratio() >= 0.99 {
        info!("💚 Placement health: excellent ({:.1}%)", ratio);
    } else if stats.health_ratio() >= 0.95 {
        info!("💛 Placement health: good ({:.1}%)", ratio);
    } else {
        warn!("🔴 Placement health: poor ({:.1}%)", ratio);
    }
}

/// Control handle for a spawned [`Sentinel`]
pub struct SentinelHandle {
    anomaly_tx: mpsc::Sender<AnomalyEvent>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl SentinelHandle {
    /// Queue an anomaly event for the consumer task
    pub async fn report_anomaly(&self, event: AnomalyEvent) -> Result<()> {
        self.anomaly_tx
            .send(event)
            .await
            .map_err(|_| anyhow!("Sentinel task has stopped"))
    }

    /// Signal the loop to drain queued anomalies and stop
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
            info!("Sentinel shutdown signal sent");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera::ledger::MemoryLedger;
    use tessera::TesseraConfig;

    fn orchestrator() -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(
            TesseraConfig::default(),
            Arc::new(MemoryLedger::new()),
        ))
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let mut policy = SentinelPolicy::default();
        policy.max_parallel_ops = 0;

        let err = Sentinel::new(orchestrator(), policy).err().unwrap();
        assert!(err.to_string().contains("Invalid Sentinel policy"));
    }

    #[tokio::test]
    async fn test_empty_sweep_is_healthy() {
        let sentinel = Sentinel::new(orchestrator(), SentinelPolicy::default()).unwrap();

        let stats = sentinel.run_sweep().await;

        assert_eq!(stats.total_shards(), 0);
        assert_eq!(stats.health_ratio(), 1.0);
        assert!(stats.duration.is_some());
    }
}

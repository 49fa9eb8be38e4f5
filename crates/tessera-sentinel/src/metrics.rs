//! Sentinel Metrics
//!
//! Per-sweep counters: where the shard population stands after the sweep and
//! what the sweep did to it.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tessera::ShardStatus;

/// Statistics from a single sweep
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepStats {
    /// Shards fully placed (`distributed`)
    pub healthy: usize,

    /// Shards with fewer than R assignments
    pub under_replicated: usize,

    pub isolated: usize,

    /// Shards parked for operator action
    pub quarantined: usize,

    /// Shards still on their way to placement (unassigned, invalid, validated, planned)
    pub pending: usize,

    /// Lifecycle steps committed during this sweep
    pub advanced: usize,

    /// Shards left for the next sweep after a retryable failure
    pub deferred: usize,

    /// Shards whose treatment failed with a non-retryable error
    pub failed: usize,

    /// Distributed shards demoted because an assigned node became unreachable
    pub replicas_lost: usize,

    /// Queued anomaly events processed during this sweep
    pub anomalies_processed: usize,

    pub duration: Option<Duration>,
}

impl SweepStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction of shards that are fully placed (1.0 when there are none)
    pub fn health_ratio(&self) -> f64 {
        let total = self.total_shards();
        if total == 0 {
            1.0
        } else {
            self.healthy as f64 / total as f64
        }
    }

    pub fn total_shards(&self) -> usize {
        self.healthy + self.under_replicated + self.isolated + self.quarantined + self.pending
    }

    /// Format a human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "Sweep: {} shards | {} healthy ({:.1}%) | {} under-replicated | {} isolated | {} quarantined | {} pending | steps {} | deferred {} | failed {}",
            self.total_shards(),
            self.healthy,
            self.health_ratio() * 100.0,
            self.under_replicated,
            self.isolated,
            self.quarantined,
            self.pending,
            self.advanced,
            self.deferred,
            self.failed
        )
    }
}

/// Accumulates stats while a sweep runs
#[derive(Debug, Clone)]
pub struct SweepStatsBuilder {
    stats: SweepStats,
    start_time: Instant,
}

impl SweepStatsBuilder {
    pub fn new() -> Self {
        Self {
            stats: SweepStats::new(),
            start_time: Instant::now(),
        }
    }

    /// Count a shard by its status at the end of the sweep
    pub fn record_status(&mut self, status: ShardStatus, count: usize) {
        match status {
            ShardStatus::Distributed => self.stats.healthy += count,
            ShardStatus::UnderReplicated => self.stats.under_replicated += count,
            ShardStatus::Isolated => self.stats.isolated += count,
            ShardStatus::Quarantined => self.stats.quarantined += count,
            ShardStatus::Unassigned
            | ShardStatus::Invalid
            | ShardStatus::Validated
            | ShardStatus::Planned => self.stats.pending += count,
        }
    }

    pub fn record_advanced(&mut self, steps: usize) {
        self.stats.advanced += steps;
    }

    pub fn record_deferred(&mut self) {
        self.stats.deferred += 1;
    }

    pub fn record_failed(&mut self) {
        self.stats.failed += 1;
    }

    pub fn record_replicas_lost(&mut self, shards: usize) {
        self.stats.replicas_lost += shards;
    }

    pub fn record_anomalies(&mut self, events: usize) {
        self.stats.anomalies_processed += events;
    }

    /// Finalize and return the stats
    pub fn finish(mut self) -> SweepStats {
        self.stats.duration = Some(self.start_time.elapsed());
        self.stats
    }

    pub fn stats(&self) -> &SweepStats {
        &self.stats
    }
}

impl Default for SweepStatsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

//! Anomaly events and the processed-event archive
//!
//! Every event the rebalancer consumes ends up in the [`AnomalyArchive`]
//! together with what was done about it. The archive is bounded; when it is
//! full the oldest record is dropped.
//!
//! # Example
//!
//! ```
//! use tessera::anomaly::{AnomalyArchive, AnomalyEvent, AnomalyKind, AnomalyOutcome};
//! use tessera::ShardId;
//!
//! let mut archive = AnomalyArchive::new(2);
//! let event = AnomalyEvent::new(ShardId::new(), AnomalyKind::TamperDetected, 0.95);
//! archive.record(event, AnomalyOutcome::Isolated);
//!
//! assert_eq!(archive.len(), 1);
//! assert_eq!(archive.stats().total_received, 1);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::shard::ShardId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    HighBounceRate,
    ResourceOverload,
    TamperDetected,
    Other,
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnomalyKind::HighBounceRate => write!(f, "high_bounce_rate"),
            AnomalyKind::ResourceOverload => write!(f, "resource_overload"),
            AnomalyKind::TamperDetected => write!(f, "tamper_detected"),
            AnomalyKind::Other => write!(f, "other"),
        }
    }
}

/// Externally scored signal tied to one shard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub shard_id: ShardId,
    pub kind: AnomalyKind,
    /// Risk score in 0.0..=1.0
    pub severity: f64,
    pub detected_at: DateTime<Utc>,
}

impl AnomalyEvent {
    /// Event detected now; severity is clamped to 0.0..=1.0 (NaN becomes 0.0)
    pub fn new(shard_id: ShardId, kind: AnomalyKind, severity: f64) -> Self {
        Self {
            shard_id,
            kind,
            severity: clamp_severity(severity),
            detected_at: Utc::now(),
        }
    }

    pub fn at(mut self, detected_at: DateTime<Utc>) -> Self {
        self.detected_at = detected_at;
        self
    }

    /// Deduplication key
    pub fn key(&self) -> (ShardId, DateTime<Utc>) {
        (self.shard_id, self.detected_at)
    }
}

pub(crate) fn clamp_severity(severity: f64) -> f64 {
    if severity.is_nan() {
        0.0
    } else {
        severity.clamp(0.0, 1.0)
    }
}

/// What the rebalancer did with an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum AnomalyOutcome {
    /// Shard moved to `isolated`
    Isolated,
    /// Tamper signal for a shard that is already isolated
    AlreadyIsolated,
    /// Rolling rebalance swapped assignments; count of newly placed nodes
    Rebalanced(usize),
    /// Rolling rebalance not performed; the old placement stays
    RebalanceSkipped(String),
    /// Below threshold or not actionable
    Ignored(String),
    /// Processing failed with an error
    Failed(String),
}

impl fmt::Display for AnomalyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnomalyOutcome::Isolated => write!(f, "isolated"),
            AnomalyOutcome::AlreadyIsolated => write!(f, "already isolated"),
            AnomalyOutcome::Rebalanced(moved) => write!(f, "rebalanced ({} new nodes)", moved),
            AnomalyOutcome::RebalanceSkipped(why) => write!(f, "rebalance skipped: {}", why),
            AnomalyOutcome::Ignored(why) => write!(f, "ignored: {}", why),
            AnomalyOutcome::Failed(why) => write!(f, "failed: {}", why),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedAnomaly {
    pub event: AnomalyEvent,
    pub outcome: AnomalyOutcome,
    pub processed_at: DateTime<Utc>,
}

/// Bounded record of processed anomaly events, oldest dropped first
#[derive(Debug)]
pub struct AnomalyArchive {
    entries: VecDeque<ArchivedAnomaly>,
    max_capacity: usize,
    total_received: u64,
    total_dropped: u64,
}

impl AnomalyArchive {
    pub fn new(max_capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_capacity.min(1024)),
            max_capacity,
            total_received: 0,
            total_dropped: 0,
        }
    }

    pub fn record(&mut self, event: AnomalyEvent, outcome: AnomalyOutcome) {
        self.total_received += 1;

        if self.entries.len() >= self.max_capacity {
            self.entries.pop_front();
            self.total_dropped += 1;
        }

        self.entries.push_back(ArchivedAnomaly {
            event,
            outcome,
            processed_at: Utc::now(),
        });
    }

    pub fn entries(&self) -> &VecDeque<ArchivedAnomaly> {
        &self.entries
    }

    pub fn entries_for_shard(&self, shard_id: ShardId) -> Vec<&ArchivedAnomaly> {
        self.entries
            .iter()
            .filter(|e| e.event.shard_id == shard_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> ArchiveStats {
        ArchiveStats {
            current_count: self.entries.len(),
            max_capacity: self.max_capacity,
            total_received: self.total_received,
            total_dropped: self.total_dropped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveStats {
    pub current_count: usize,
    pub max_capacity: usize,
    pub total_received: u64,
    pub total_dropped: u64,
}

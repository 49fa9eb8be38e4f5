//! Shard Registry: authoritative shard table and lifecycle state machine
//!
//! Every transition is written to the ledger before it is applied. The
//! registry holds one async mutex per shard; multi-step operations (validate,
//! distribute, rebalance) take the shard's guard with [`ShardRegistry::acquire`]
//! and keep it across their ledger appends, so two operations on the same
//! shard never interleave while unrelated shards proceed in parallel.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tessera_core_fleet::NodeId;
use tessera_core_ledger::{LedgerAdapter, PendingEntry};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info};

use crate::error::{Result, TesseraError};
use crate::shard::{RegistrationRecord, Shard, ShardEvent, ShardId, ShardSpec, ShardStatus};
use crate::validator::ValidationResult;

/// Exclusive access to one shard
pub type ShardGuard = OwnedMutexGuard<Shard>;

/// Ledger payload for a lifecycle transition
#[derive(Serialize)]
struct TransitionRecord<'a> {
    from: ShardStatus,
    to: ShardStatus,
    revision: u64,
    #[serde(flatten)]
    event: &'a ShardEvent,
}

pub struct ShardRegistry {
    shards: RwLock<HashMap<ShardId, Arc<AsyncMutex<Shard>>>>,
    history: Mutex<HashMap<ShardId, Vec<ValidationResult>>>,
    ledger: Arc<dyn LedgerAdapter>,
}

impl std::fmt::Debug for ShardRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardRegistry")
            .field("shards", &self.len())
            .finish_non_exhaustive()
    }
}

impl ShardRegistry {
    pub fn new(ledger: Arc<dyn LedgerAdapter>) -> Self {
        Self {
            shards: RwLock::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
            ledger,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerAdapter> {
        &self.ledger
    }

    fn slot(&self, id: ShardId) -> Result<Arc<AsyncMutex<Shard>>> {
        self.shards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(TesseraError::ShardNotFound(id))
    }

    fn slots(&self) -> Vec<Arc<AsyncMutex<Shard>>> {
        self.shards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Create a shard in `unassigned`; it becomes visible only after the
    /// registration record is in the ledger
    pub async fn register(&self, spec: ShardSpec) -> Result<Shard> {
        if spec.replication_factor == 0 {
            return Err(TesseraError::InvalidShard(
                "replication_factor must be at least 1".to_string(),
            ));
        }
        if spec.required_capacity == 0 {
            return Err(TesseraError::InvalidShard(
                "required_capacity must be at least 1".to_string(),
            ));
        }

        let shard = Shard::from_spec(spec, Utc::now());
        let entry = PendingEntry::new(
            "shard.registered",
            shard.id.to_string(),
            &RegistrationRecord::from(&shard),
        )?
        .with_idempotency_key(format!("{}:0", shard.id));
        self.ledger.append(entry).await?;

        self.shards
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(shard.id, Arc::new(AsyncMutex::new(shard.clone())));

        info!(
            shard_id = %shard.id,
            replication_factor = shard.replication_factor,
            bytes = shard.payload.len(),
            "Shard registered"
        );
        Ok(shard)
    }

    /// Take the shard's exclusive guard, waiting for any in-flight operation
    pub async fn acquire(&self, id: ShardId) -> Result<ShardGuard> {
        Ok(self.slot(id)?.lock_owned().await)
    }

    /// Apply one event to a guarded shard
    ///
    /// Illegal events are rejected before anything is written. The ledger
    /// append happens first; if it fails the shard keeps its prior state.
    pub async fn apply(&self, guard: &mut ShardGuard, event: ShardEvent) -> Result<Shard> {
        let shard_id = guard.id;
        let from = guard.status;

        let Some(to) = event.target(from) else {
            return Err(illegal_transition(shard_id, from, event.name()));
        };

        check_assignment(guard, &event)?;

        let record = TransitionRecord {
            from,
            to,
            revision: guard.revision + 1,
            event: &event,
        };
        let entry = PendingEntry::new(
            format!("shard.{}", event.name()),
            shard_id.to_string(),
            &record,
        )?
        .with_idempotency_key(guard.next_idempotency_key());

        let committed = match self.ledger.append(entry).await {
            Ok(hash) => hash,
            Err(source) => {
                error!(
                    shard_id = %shard_id,
                    from = %from,
                    event = event.name(),
                    error = %source,
                    "Ledger append failed; transition not committed"
                );
                return Err(TesseraError::TransitionNotLogged {
                    shard_id,
                    from,
                    event: event.name(),
                    source,
                });
            }
        };

        if let ShardEvent::Validated(result) | ShardEvent::ValidationFailed(result) = &event {
            self.history
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(shard_id)
                .or_default()
                .push(result.clone());
        }

        guard.apply(&event, to, Utc::now());
        info!(
            shard_id = %shard_id,
            from = %from,
            to = %to,
            revision = guard.revision,
            hash = %committed,
            "Shard transition committed"
        );
        Ok(Shard::clone(guard))
    }

    /// Acquire the shard and apply a single event
    pub async fn transition(&self, id: ShardId, event: ShardEvent) -> Result<Shard> {
        let mut guard = self.acquire(id).await?;
        self.apply(&mut guard, event).await
    }

    /// Current copy of a shard (waits for any in-flight operation on it)
    pub async fn get(&self, id: ShardId) -> Result<Shard> {
        Ok(self.slot(id)?.lock().await.clone())
    }

    /// All shards, oldest first
    pub async fn list(&self) -> Vec<Shard> {
        let mut shards = Vec::new();
        for slot in self.slots() {
            shards.push(slot.lock().await.clone());
        }
        shards.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        shards
    }

    pub async fn ids_with_status(&self, status: ShardStatus) -> Vec<ShardId> {
        self.list()
            .await
            .into_iter()
            .filter(|s| s.status == status)
            .map(|s| s.id)
            .collect()
    }

    /// Shard count per status
    pub async fn status_counts(&self) -> HashMap<ShardStatus, usize> {
        let mut counts = HashMap::new();
        for shard in self.list().await {
            *counts.entry(shard.status).or_insert(0) += 1;
        }
        counts
    }

    /// Every validation result recorded for a shard, oldest first
    pub fn validation_history(&self, id: ShardId) -> Vec<ValidationResult> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.shards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reject assignment sets that would break shard invariants
/// Log and build the error for an event the shard's status does not allow
pub(crate) fn illegal_transition(
    shard_id: ShardId,
    from: ShardStatus,
    event: &'static str,
) -> TesseraError {
    error!(
        shard_id = %shard_id,
        from = %from,
        event,
        "Illegal state transition rejected"
    );
    TesseraError::InvalidStateTransition {
        shard_id,
        from,
        event,
    }
}

fn check_assignment(shard: &Shard, event: &ShardEvent) -> Result<()> {
    let (assigned, exact): (&[NodeId], bool) = match event {
        ShardEvent::Distributed { assigned } => (assigned.as_slice(), true),
        ShardEvent::Rebalanced(plan) => (plan.backup_nodes.as_slice(), true),
        ShardEvent::UnderReplicated { assigned } => (assigned.as_slice(), false),
        _ => return Ok(()),
    };

    let reject = |reason: String| {
        error!(shard_id = %shard.id, event = event.name(), %reason, "Assignment rejected");
        Err(TesseraError::InvalidAssignment {
            shard_id: shard.id,
            from: shard.status,
            event: event.name(),
            reason,
        })
    };

    let mut seen: Vec<&NodeId> = Vec::with_capacity(assigned.len());
    for node in assigned {
        if seen.contains(&node) {
            return reject(format!("duplicate node {}", node));
        }
        seen.push(node);
    }

    let r = shard.replication_factor;
    if exact && assigned.len() != r {
        return reject(format!("{} assignments, replication factor {}", assigned.len(), r));
    }
    if !exact && (assigned.is_empty() || assigned.len() >= r) {
        return reject(format!(
            "{} assignments is not under-replicated for factor {}",
            assigned.len(),
            r
        ));
    }

    debug!(shard_id = %shard.id, nodes = assigned.len(), "Assignment accepted");
    Ok(())
}

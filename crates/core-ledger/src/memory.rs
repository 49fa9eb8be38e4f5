//! In-process ledger backend

use crate::chain::{verify_entries, HashChain, ValidationReport};
use crate::entry::{CommittedHash, LedgerEntry, PendingEntry, GENESIS_HASH};
use crate::error::{LedgerError, Result};
use crate::signer::ChainHasher;
use crate::LedgerAdapter;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Chain tail, committed entries and the idempotency index
#[derive(Debug)]
pub(crate) struct LedgerState {
    pub(crate) chain: HashChain,
    pub(crate) entries: Vec<LedgerEntry>,
    by_key: HashMap<String, CommittedHash>,
}

impl LedgerState {
    pub(crate) fn new(hasher: ChainHasher) -> Self {
        Self {
            chain: HashChain::new(hasher),
            entries: Vec::new(),
            by_key: HashMap::new(),
        }
    }

    /// Hash previously committed under the same idempotency key
    pub(crate) fn replayed(&self, pending: &PendingEntry) -> Option<CommittedHash> {
        pending
            .idempotency_key
            .as_ref()
            .and_then(|key| self.by_key.get(key).cloned())
    }

    pub(crate) fn commit(&mut self, entry: LedgerEntry) -> CommittedHash {
        self.chain.advance(&entry);
        let hash = entry.committed_hash();
        if let Some(key) = &entry.idempotency_key {
            self.by_key.insert(key.clone(), hash.clone());
        }
        self.entries.push(entry);
        hash
    }

    pub(crate) fn len(&self) -> u64 {
        self.entries.len() as u64
    }
}

/// Select `from..=to` out of a full chain, with the hash the run links to
pub(crate) fn select_range(
    entries: &[LedgerEntry],
    from: u64,
    to: u64,
) -> Result<(&[LedgerEntry], String)> {
    let len = entries.len() as u64;
    if from > to || to >= len {
        return Err(LedgerError::RangeOutOfBounds { from, to, len });
    }

    let expected_prev = if from == 0 {
        GENESIS_HASH.to_string()
    } else {
        entries[(from - 1) as usize].hash.clone()
    };

    Ok((&entries[from as usize..=to as usize], expected_prev))
}

/// Verify `from..=to`; an empty chain verifies trivially
pub(crate) fn verify_range(
    entries: &[LedgerEntry],
    hasher: &ChainHasher,
    from: u64,
    to: u64,
) -> Result<ValidationReport> {
    if entries.is_empty() {
        return Ok(ValidationReport {
            total_entries: 0,
            valid_entries: 0,
            failures: Vec::new(),
        });
    }
    let (run, expected_prev) = select_range(entries, from, to)?;
    Ok(verify_entries(run, hasher, &expected_prev))
}

/// Hash-chained ledger held in memory
///
/// Suitable for tests and single-process deployments where the ledger is
/// mirrored elsewhere.
///
/// ```
/// use tessera_core_ledger::{LedgerAdapter, MemoryLedger, PendingEntry};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> tessera_core_ledger::Result<()> {
/// let ledger = MemoryLedger::new();
/// let entry = PendingEntry::new("registered", "shard-1", &serde_json::json!({"rf": 3}))?;
/// ledger.append(entry).await?;
/// assert!(ledger.verify_chain(0, 0).await?);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    /// Unkeyed SHA-256 chain
    pub fn new() -> Self {
        Self::with_hasher(ChainHasher::sha256())
    }

    pub fn with_hasher(hasher: ChainHasher) -> Self {
        Self {
            state: Mutex::new(LedgerState::new(hasher)),
        }
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Full verification report over `from..=to`
    pub fn verify_report(&self, from: u64, to: u64) -> Result<ValidationReport> {
        let state = self.state();
        verify_range(&state.entries, state.chain.hasher(), from, to)
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerAdapter for MemoryLedger {
    async fn append(&self, entry: PendingEntry) -> Result<CommittedHash> {
        let mut state = self.state();
        if let Some(hash) = state.replayed(&entry) {
            debug!(subject = %entry.subject_id, "Ledger append replayed by idempotency key");
            return Ok(hash);
        }

        let sealed = state.chain.prepare(entry)?;
        Ok(state.commit(sealed))
    }

    async fn verify_chain(&self, from: u64, to: u64) -> Result<bool> {
        Ok(self.verify_report(from, to)?.is_valid())
    }

    async fn entries(&self, from: u64, to: u64) -> Result<Vec<LedgerEntry>> {
        let state = self.state();
        let (run, _) = select_range(&state.entries, from, to)?;
        Ok(run.to_vec())
    }

    async fn head(&self) -> Option<LedgerEntry> {
        self.state().entries.last().cloned()
    }

    async fn len(&self) -> u64 {
        self.state().len()
    }
}

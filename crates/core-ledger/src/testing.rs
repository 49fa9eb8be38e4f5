//! Testing utilities for ledger fault injection
//!
//! [`FaultyLedger`] wraps any backend and fails appends on demand, which is
//! how callers exercise write-ahead behaviour (a transition must not commit
//! when its ledger append fails).

use crate::entry::{CommittedHash, LedgerEntry, PendingEntry};
use crate::error::{LedgerError, Result};
use crate::LedgerAdapter;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Ledger wrapper that rejects appends while armed
///
/// ## Example
///
/// ```
/// use tessera_core_ledger::testing::FaultyLedger;
/// use tessera_core_ledger::{LedgerAdapter, MemoryLedger, PendingEntry};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let ledger = FaultyLedger::new(MemoryLedger::new());
/// ledger.fail_appends(true);
///
/// let entry = PendingEntry::new("a", "s", &serde_json::json!({})).unwrap();
/// assert!(ledger.append(entry).await.is_err());
/// assert_eq!(ledger.rejected(), 1);
/// # }
/// ```
pub struct FaultyLedger<L> {
    inner: L,
    failing: AtomicBool,
    rejected: AtomicU64,
}

impl<L: LedgerAdapter> FaultyLedger<L> {
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
            rejected: AtomicU64::new(0),
        }
    }

    /// Arm or disarm append failures
    pub fn fail_appends(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of appends rejected so far
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }
}

#[async_trait]
impl<L: LedgerAdapter> LedgerAdapter for FaultyLedger<L> {
    async fn append(&self, entry: PendingEntry) -> Result<CommittedHash> {
        if self.failing.load(Ordering::SeqCst) {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(LedgerError::append_failed(format!(
                "injected failure for {}",
                entry.subject_id
            )));
        }
        self.inner.append(entry).await
    }

    async fn verify_chain(&self, from: u64, to: u64) -> Result<bool> {
        self.inner.verify_chain(from, to).await
    }

    async fn entries(&self, from: u64, to: u64) -> Result<Vec<LedgerEntry>> {
        self.inner.entries(from, to).await
    }

    async fn head(&self) -> Option<LedgerEntry> {
        self.inner.head().await
    }

    async fn len(&self) -> u64 {
        self.inner.len().await
    }
}

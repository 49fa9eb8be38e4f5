//! Tessera Core Ledger: append-only, hash-chained lifecycle records
//!
//! Every shard lifecycle transition is recorded here before it is considered
//! committed. Entries are linked so that `entry[i].prev_hash == entry[i-1].hash`;
//! the chain can be verified by anyone holding the entries (plain SHA-256) or
//! by holders of a shared secret (HMAC-SHA256).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │      Shard Registry transition      │
//! └──────────────┬──────────────────────┘
//!                │ PendingEntry (action, subject, payload hash)
//!                ▼
//! ┌─────────────────────────────────────┐
//! │          LedgerAdapter              │
//! │  HashChain::prepare → persist →     │
//! │  HashChain::advance                 │
//! └──────────────┬──────────────────────┘
//!                │ CommittedHash
//!                ▼
//! ┌─────────────────────────────────────┐
//! │  MemoryLedger | JsonlLedger | ...   │
//! └─────────────────────────────────────┘
//! ```
//!
//! Backends only need to implement [`LedgerAdapter`]; consensus or database
//! backed ledgers plug in the same way.

use async_trait::async_trait;

pub mod chain;
pub mod entry;
pub mod error;
pub mod jsonl;
pub mod memory;
pub mod signer;
pub mod testing;

pub use chain::{verify_entries, ChainError, HashChain, ValidationReport};
pub use entry::{CommittedHash, LedgerEntry, PendingEntry, GENESIS_HASH};
pub use error::{LedgerError, Result};
pub use jsonl::JsonlLedger;
pub use memory::MemoryLedger;
pub use signer::{payload_digest, ChainHasher, LEDGER_SECRET_ENV};

/// Append/verify interface over a hash-chained ledger
///
/// Implementations must make `append` atomic: either the entry is durably
/// linked into the chain and its hash returned, or an error is returned and
/// the chain is unchanged. Appends carrying an idempotency key that was
/// already committed return the original hash without a new entry.
#[async_trait]
pub trait LedgerAdapter: Send + Sync {
    /// Link an entry into the chain
    async fn append(&self, entry: PendingEntry) -> Result<CommittedHash>;

    /// Verify the inclusive sequence range `from..=to`
    async fn verify_chain(&self, from: u64, to: u64) -> Result<bool>;

    /// Committed entries in the inclusive range `from..=to`
    async fn entries(&self, from: u64, to: u64) -> Result<Vec<LedgerEntry>>;

    /// Most recently committed entry
    async fn head(&self) -> Option<LedgerEntry>;

    /// Number of committed entries
    async fn len(&self) -> u64;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Verify the whole chain from genesis to the latest entry
    async fn verify_all(&self) -> Result<bool> {
        let len = self.len().await;
        if len == 0 {
            return Ok(true);
        }
        self.verify_chain(0, len - 1).await
    }
}

#[async_trait]
impl<L: LedgerAdapter + ?Sized> LedgerAdapter for std::sync::Arc<L> {
    async fn append(&self, entry: PendingEntry) -> Result<CommittedHash> {
        (**self).append(entry).await
    }

    async fn verify_chain(&self, from: u64, to: u64) -> Result<bool> {
        (**self).verify_chain(from, to).await
    }

    async fn entries(&self, from: u64, to: u64) -> Result<Vec<LedgerEntry>> {
        (**self).entries(from, to).await
    }

    async fn head(&self) -> Option<LedgerEntry> {
        (**self).head().await
    }

    async fn len(&self) -> u64 {
        (**self).len().await
    }
}

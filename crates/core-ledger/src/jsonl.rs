//! Durable ledger backend: one JSON object per line, append-only
//!
//! Every append is written and flushed before the chain tail advances, so a
//! failed write leaves the in-memory tail where it was. On open the existing
//! file is parsed and re-verified; a file whose chain does not verify is
//! refused.

use crate::chain::ValidationReport;
use crate::entry::{CommittedHash, LedgerEntry, PendingEntry};
use crate::error::{LedgerError, Result};
use crate::memory::{select_range, verify_range, LedgerState};
use crate::signer::ChainHasher;
use crate::LedgerAdapter;
use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

struct JsonlInner {
    state: LedgerState,
    writer: BufWriter<File>,
}

/// Append-only JSON Lines ledger
///
/// # Thread Safety
/// The ledger uses internal locking and is safe to share across tasks.
///
/// # Example
/// ```no_run
/// use tessera_core_ledger::{ChainHasher, JsonlLedger};
///
/// let ledger = JsonlLedger::open("ledger.jsonl", ChainHasher::sha256()).unwrap();
/// ```
pub struct JsonlLedger {
    path: PathBuf,
    hasher: ChainHasher,
    inner: Mutex<JsonlInner>,
}

impl JsonlLedger {
    /// Open (or create) a ledger file and restore its chain tail
    pub fn open<P: AsRef<Path>>(path: P, hasher: ChainHasher) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let existing = if path.exists() {
            read_entries(&path)?
        } else {
            Vec::new()
        };

        let mut state = LedgerState::new(hasher.clone());
        if !existing.is_empty() {
            let last = existing.len() as u64 - 1;
            let report = verify_range(&existing, &hasher, 0, last)?;
            if let Some(failure) = report.first_failure() {
                return Err(LedgerError::Chain(failure.clone()));
            }
        }
        for entry in existing {
            state.commit(entry);
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|_| LedgerError::create_failed(&path))?;

        info!(
            path = %path.display(),
            entries = state.len(),
            "Opened ledger"
        );

        Ok(Self {
            path,
            hasher,
            inner: Mutex::new(JsonlInner {
                state,
                writer: BufWriter::new(file),
            }),
        })
    }

    fn inner(&self) -> MutexGuard<'_, JsonlInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Verify `from..=to` as currently persisted on disk
    pub fn verify_report(&self, from: u64, to: u64) -> Result<ValidationReport> {
        // Hold the lock so no append interleaves with the read.
        let _guard = self.inner();
        let persisted = read_entries(&self.path)?;
        verify_range(&persisted, &self.hasher, from, to)
    }
}

fn read_entries(path: &Path) -> Result<Vec<LedgerEntry>> {
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: LedgerEntry = serde_json::from_str(&line)
            .map_err(|e| LedgerError::corrupted(index + 1, &e.to_string()))?;
        entries.push(entry);
    }

    Ok(entries)
}

#[async_trait]
impl LedgerAdapter for JsonlLedger {
    async fn append(&self, entry: PendingEntry) -> Result<CommittedHash> {
        let mut inner = self.inner();
        if let Some(hash) = inner.state.replayed(&entry) {
            debug!(subject = %entry.subject_id, "Ledger append replayed by idempotency key");
            return Ok(hash);
        }

        let sealed = inner.state.chain.prepare(entry)?;
        let json = serde_json::to_string(&sealed)?;

        writeln!(inner.writer, "{}", json)
            .and_then(|_| inner.writer.flush())
            .map_err(|e| LedgerError::append_failed(e.to_string()))?;

        Ok(inner.state.commit(sealed))
    }

    async fn verify_chain(&self, from: u64, to: u64) -> Result<bool> {
        Ok(self.verify_report(from, to)?.is_valid())
    }

    async fn entries(&self, from: u64, to: u64) -> Result<Vec<LedgerEntry>> {
        let inner = self.inner();
        let (run, _) = select_range(&inner.state.entries, from, to)?;
        Ok(run.to_vec())
    }

    async fn head(&self) -> Option<LedgerEntry> {
        self.inner().state.entries.last().cloned()
    }

    async fn len(&self) -> u64 {
        self.inner().state.len()
    }
}

//! Hash chaining and verification
//!
//! Each entry's hash is computed as `H(prev_hash || canonical_entry_bytes)`,
//! where `H` is the configured [`ChainHasher`]. This gives:
//! - Tamper detection (any modified field breaks the entry's hash)
//! - Insertion/removal detection (the next entry's `prev_hash` no longer links)
//! - Reordering detection (sequence numbers must be contiguous)

use crate::entry::{LedgerEntry, PendingEntry, GENESIS_HASH};
use crate::error::Result;
use crate::signer::ChainHasher;
use thiserror::Error;

/// A single chain verification failure
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChainError {
    #[error(
        "Integrity check failed at sequence {sequence}: expected hash {expected}, got {actual}"
    )]
    IntegrityFailure {
        sequence: u64,
        expected: String,
        actual: String,
    },

    #[error("Broken link at sequence {sequence}: prev_hash does not match previous entry")]
    BrokenLink { sequence: u64 },

    #[error("Sequence gap detected: expected {expected}, got {actual}")]
    SequenceGap { expected: u64, actual: u64 },

    #[error("Entry at sequence {0} could not be canonicalized")]
    Unserializable(u64),
}

/// Tail state of a chain: the next sequence and the hash to link against
///
/// `prepare` is pure so a backend can persist the sealed entry first and
/// only `advance` once the write has succeeded.
#[derive(Debug, Clone)]
pub struct HashChain {
    hasher: ChainHasher,
    next_sequence: u64,
    prev_hash: String,
}

impl HashChain {
    /// Start an empty chain at the genesis hash
    pub fn new(hasher: ChainHasher) -> Self {
        Self {
            hasher,
            next_sequence: 0,
            prev_hash: GENESIS_HASH.to_string(),
        }
    }

    /// Seal a pending entry against the current tail without advancing
    pub fn prepare(&self, pending: PendingEntry) -> Result<LedgerEntry> {
        let mut entry = LedgerEntry {
            sequence: self.next_sequence,
            action: pending.action,
            subject_id: pending.subject_id,
            payload_hash: pending.payload_hash,
            idempotency_key: pending.idempotency_key,
            timestamp: pending.timestamp,
            prev_hash: self.prev_hash.clone(),
            hash: String::new(),
        };
        entry.hash = compute_hash(&self.hasher, &entry)?;
        Ok(entry)
    }

    /// Move the tail past a committed entry
    pub fn advance(&mut self, entry: &LedgerEntry) {
        self.next_sequence = entry.sequence + 1;
        self.prev_hash = entry.hash.clone();
    }

    /// Sequence the next entry will receive
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn hasher(&self) -> &ChainHasher {
        &self.hasher
    }
}

fn compute_hash(hasher: &ChainHasher, entry: &LedgerEntry) -> Result<String> {
    let canonical = entry.canonical_bytes()?;
    let mut data = entry.prev_hash.as_bytes().to_vec();
    data.extend_from_slice(&canonical);
    Ok(hasher.digest_hex(&data))
}

/// Verify a contiguous run of entries
///
/// `expected_prev` is the hash the first entry must link to: the genesis
/// hash for a run starting at sequence 0, otherwise the hash of the entry
/// just before the run.
pub fn verify_entries(
    entries: &[LedgerEntry],
    hasher: &ChainHasher,
    expected_prev: &str,
) -> ValidationReport {
    let mut report = ValidationReport {
        total_entries: entries.len(),
        valid_entries: 0,
        failures: Vec::new(),
    };
    let mut prev_hash = expected_prev.to_string();

    for (index, entry) in entries.iter().enumerate() {
        if index > 0 {
            let expected_seq = entries[index - 1].sequence + 1;
            if entry.sequence != expected_seq {
                report.failures.push(ChainError::SequenceGap {
                    expected: expected_seq,
                    actual: entry.sequence,
                });
            }
        }

        if entry.prev_hash != prev_hash {
            report.failures.push(ChainError::BrokenLink {
                sequence: entry.sequence,
            });
        }

        let calculated = match compute_hash(hasher, entry) {
            Ok(h) => h,
            Err(_) => {
                report
                    .failures
                    .push(ChainError::Unserializable(entry.sequence));
                continue;
            }
        };

        if calculated != entry.hash {
            report.failures.push(ChainError::IntegrityFailure {
                sequence: entry.sequence,
                expected: calculated,
                actual: entry.hash.clone(),
            });
        } else if entry.prev_hash == prev_hash {
            report.valid_entries += 1;
        }

        // Link the next entry against what this one claims, so a single
        // tampered entry is reported once rather than cascading.
        prev_hash = entry.hash.clone();
    }

    report
}

/// Report from chain verification
#[derive(Debug, Clone)]
pub struct ValidationReport {
    /// Number of entries checked
    pub total_entries: usize,

    /// Number of entries that passed every check
    pub valid_entries: usize,

    /// Every failure found, in chain order
    pub failures: Vec<ChainError>,
}

impl ValidationReport {
    /// True when no failures were found
    pub fn is_valid(&self) -> bool {
        self.failures.is_empty() && self.valid_entries == self.total_entries
    }

    /// First failure, if any
    pub fn first_failure(&self) -> Option<&ChainError> {
        self.failures.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn build_chain(hasher: ChainHasher, n: usize) -> Vec<LedgerEntry> {
        let mut chain = HashChain::new(hasher);
        let mut entries = Vec::new();
        for i in 0..n {
            let pending =
                PendingEntry::new("transition", format!("shard-{}", i), &json!({"i": i})).unwrap();
            let entry = chain.prepare(pending).unwrap();
            chain.advance(&entry);
            entries.push(entry);
        }
        entries
    }

    #[test]
    fn test_sequential_linking() {
        let entries = build_chain(ChainHasher::sha256(), 3);

        assert_eq!(entries[0].sequence, 0);
        assert_eq!(entries[0].prev_hash, GENESIS_HASH);
        assert_eq!(entries[1].prev_hash, entries[0].hash);
        assert_eq!(entries[2].prev_hash, entries[1].hash);
    }

    #[test]
    fn test_prepare_does_not_advance() {
        let chain = HashChain::new(ChainHasher::sha256());
        let pending = PendingEntry::new("a", "s", &json!({})).unwrap();

        let first = chain.prepare(pending.clone()).unwrap();
        let second = chain.prepare(pending).unwrap();

        assert_eq!(first.sequence, second.sequence);
        assert_eq!(chain.next_sequence(), 0);
    }

    #[test]
    fn test_verify_valid_chain() {
        let hasher = ChainHasher::hmac_from_bytes(b"test_secret_key_for_chain_tests");
        let entries = build_chain(hasher.clone(), 5);

        let report = verify_entries(&entries, &hasher, GENESIS_HASH);
        assert!(report.is_valid());
        assert_eq!(report.valid_entries, 5);
    }

    #[test]
    fn test_detect_tampering() {
        let hasher = ChainHasher::sha256();
        let mut entries = build_chain(hasher.clone(), 5);

        entries[2].action = "tampered".to_string();

        let report = verify_entries(&entries, &hasher, GENESIS_HASH);
        assert!(!report.is_valid());
        match report.first_failure() {
            Some(ChainError::IntegrityFailure { sequence, .. }) => assert_eq!(*sequence, 2),
            other => panic!("Expected IntegrityFailure, got {:?}", other),
        }
    }

    #[test]
    fn test_detect_removed_entry() {
        let hasher = ChainHasher::sha256();
        let mut entries = build_chain(hasher.clone(), 4);
        entries.remove(1);

        let report = verify_entries(&entries, &hasher, GENESIS_HASH);
        assert!(report
            .failures
            .iter()
            .any(|f| matches!(f, ChainError::SequenceGap { expected: 1, actual: 2 })));
        assert!(report
            .failures
            .iter()
            .any(|f| matches!(f, ChainError::BrokenLink { sequence: 2 })));
    }

    #[test]
    fn test_wrong_key_fails_verification() {
        let entries = build_chain(ChainHasher::hmac_from_bytes(b"right"), 2);
        let report = verify_entries(&entries, &ChainHasher::hmac_from_bytes(b"wrong"), GENESIS_HASH);
        assert!(!report.is_valid());
    }
}

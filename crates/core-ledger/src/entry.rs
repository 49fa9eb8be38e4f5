//! Ledger entry types

use crate::error::Result;
use crate::signer::payload_digest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// `prev_hash` of the first entry in every chain
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// A record submitted for appending, before it is linked into the chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEntry {
    /// What happened (e.g. `transition:validated`)
    pub action: String,

    /// Entity the action applies to
    pub subject_id: String,

    /// SHA-256 of the canonical payload
    pub payload_hash: String,

    /// Retry-safety key; a second append with the same key is a no-op
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    /// When the action was recorded
    pub timestamp: DateTime<Utc>,
}

impl PendingEntry {
    /// Build an entry whose `payload_hash` is the digest of `payload` as JSON
    pub fn new<P: Serialize>(
        action: impl Into<String>,
        subject_id: impl Into<String>,
        payload: &P,
    ) -> Result<Self> {
        let bytes = serde_json::to_vec(payload)?;
        Ok(Self {
            action: action.into(),
            subject_id: subject_id.into(),
            payload_hash: payload_digest(&bytes),
            idempotency_key: None,
            timestamp: Utc::now(),
        })
    }

    /// Attach an idempotency key
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// A committed, chained ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Position in the chain, starting at 0
    pub sequence: u64,

    pub action: String,

    pub subject_id: String,

    pub payload_hash: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    pub timestamp: DateTime<Utc>,

    /// Hash of the previous entry (or [`GENESIS_HASH`])
    pub prev_hash: String,

    /// Hash of this entry: H(prev_hash || canonical body)
    pub hash: String,
}

/// Hashed portion of an entry; everything except `hash` itself
#[derive(Serialize)]
struct CanonicalBody<'a> {
    sequence: u64,
    action: &'a str,
    subject_id: &'a str,
    payload_hash: &'a str,
    idempotency_key: Option<&'a str>,
    timestamp: &'a DateTime<Utc>,
    prev_hash: &'a str,
}

impl LedgerEntry {
    /// Canonical bytes fed to the chain hasher (after `prev_hash`)
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let body = CanonicalBody {
            sequence: self.sequence,
            action: &self.action,
            subject_id: &self.subject_id,
            payload_hash: &self.payload_hash,
            idempotency_key: self.idempotency_key.as_deref(),
            timestamp: &self.timestamp,
            prev_hash: &self.prev_hash,
        };
        Ok(serde_json::to_vec(&body)?)
    }

    /// The hash this entry commits to
    pub fn committed_hash(&self) -> CommittedHash {
        CommittedHash(self.hash.clone())
    }
}

/// Hash returned by a successful append
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommittedHash(pub String);

impl CommittedHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommittedHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

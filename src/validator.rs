//! Integrity Validator
//!
//! Runs the shard checks in a fixed order (structural, digest, auth tag,
//! attestation) and records every outcome. The verdict is `valid` only if
//! no check failed; the first failing check in order becomes the recorded
//! failure. A check whose input is missing, or whose collaborator is not
//! attached, is recorded as skipped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ValidationConfig;
use crate::error::Result;
use crate::registry::{illegal_transition, ShardRegistry};
use crate::services::{AttestationVerifier, CryptoService};
use crate::shard::{compute_digest, Shard, ShardEvent, ShardId, ShardStatus};

/// Checks in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckName {
    Structural,
    Digest,
    AuthTag,
    Attestation,
}

impl fmt::Display for CheckName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckName::Structural => write!(f, "structural"),
            CheckName::Digest => write!(f, "digest"),
            CheckName::AuthTag => write!(f, "auth_tag"),
            CheckName::Attestation => write!(f, "attestation"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckOutcome {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub outcome: CheckOutcome,
    pub detail: String,
}

impl CheckResult {
    fn pass(detail: impl Into<String>) -> Self {
        Self {
            outcome: CheckOutcome::Pass,
            detail: detail.into(),
        }
    }

    fn fail(detail: impl Into<String>) -> Self {
        Self {
            outcome: CheckOutcome::Fail,
            detail: detail.into(),
        }
    }

    fn skipped(detail: impl Into<String>) -> Self {
        Self {
            outcome: CheckOutcome::Skipped,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Valid,
    Invalid,
}

/// Why a shard failed validation
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ValidationFailure {
    #[error("missing field: {0}")]
    MissingField(String),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("auth tag invalid: {0}")]
    AuthTagInvalid(String),

    #[error("attestation invalid: {0}")]
    AttestationInvalid(String),
}

/// Outcome of one validation attempt, retained for audit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub shard_id: ShardId,
    /// 1-based attempt number
    pub attempt: u32,
    pub checks: BTreeMap<CheckName, CheckResult>,
    pub verdict: Verdict,
    pub failure: Option<ValidationFailure>,
    pub timestamp: DateTime<Utc>,
}

impl ValidationResult {
    /// A result with every check passing
    pub fn passing(shard_id: ShardId) -> Self {
        let checks = [
            CheckName::Structural,
            CheckName::Digest,
            CheckName::AuthTag,
            CheckName::Attestation,
        ]
        .into_iter()
        .map(|name| (name, CheckResult::pass("ok")))
        .collect();

        Self {
            shard_id,
            attempt: 1,
            checks,
            verdict: Verdict::Valid,
            failure: None,
            timestamp: Utc::now(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.verdict == Verdict::Valid
    }

    pub fn outcome(&self, check: CheckName) -> Option<CheckOutcome> {
        self.checks.get(&check).map(|c| c.outcome)
    }
}

pub struct IntegrityValidator {
    config: ValidationConfig,
    crypto: Option<Arc<dyn CryptoService>>,
    attestation: Option<Arc<dyn AttestationVerifier>>,
}

impl IntegrityValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self {
            config,
            crypto: None,
            attestation: None,
        }
    }

    pub fn with_crypto(mut self, crypto: Arc<dyn CryptoService>) -> Self {
        self.crypto = Some(crypto);
        self
    }

    pub fn with_attestation(mut self, verifier: Arc<dyn AttestationVerifier>) -> Self {
        self.attestation = Some(verifier);
        self
    }

    fn auth_tag_enabled(&self) -> bool {
        self.config.verify_auth_tag && self.crypto.is_some()
    }

    /// Evaluate all checks against a shard without changing its state
    pub async fn check(&self, shard: &Shard, attempt: u32) -> ValidationResult {
        let mut checks = BTreeMap::new();
        let mut failures = Vec::new();

        // (a) structural
        let missing: Vec<&str> = [
            (shard.payload.is_empty(), "payload"),
            (shard.integrity_digest.is_empty(), "integrity_digest"),
            (
                self.auth_tag_enabled() && shard.encryption.is_none(),
                "encryption_metadata",
            ),
        ]
        .into_iter()
        .filter_map(|(absent, field)| absent.then_some(field))
        .collect();

        if missing.is_empty() {
            checks.insert(CheckName::Structural, CheckResult::pass("all fields present"));
        } else {
            let detail = missing.join(", ");
            failures.push(ValidationFailure::MissingField(detail.clone()));
            checks.insert(CheckName::Structural, CheckResult::fail(detail));
        }

        // (b) digest
        if shard.payload.is_empty() || shard.integrity_digest.is_empty() {
            checks.insert(CheckName::Digest, CheckResult::skipped("no payload or digest"));
        } else {
            let actual = compute_digest(&shard.payload);
            if actual == shard.integrity_digest {
                checks.insert(CheckName::Digest, CheckResult::pass("digest matches"));
            } else {
                let failure = ValidationFailure::HashMismatch {
                    expected: shard.integrity_digest.clone(),
                    actual,
                };
                checks.insert(CheckName::Digest, CheckResult::fail(failure.to_string()));
                failures.push(failure);
            }
        }

        // (c) auth tag
        let auth_skip = if !self.config.verify_auth_tag {
            Some("disabled")
        } else if self.crypto.is_none() {
            Some("no crypto service")
        } else if shard.encryption.is_none() {
            Some("no encryption metadata")
        } else {
            None
        };

        if let Some(reason) = auth_skip {
            checks.insert(CheckName::AuthTag, CheckResult::skipped(reason));
        } else if let (Some(crypto), Some(metadata)) = (&self.crypto, &shard.encryption) {
            let detail = match crypto.verify_auth_tag(&shard.payload, metadata).await {
                Ok(true) => None,
                Ok(false) => Some("authentication tag rejected".to_string()),
                Err(e) => Some(e.to_string()),
            };
            match detail {
                None => {
                    checks.insert(CheckName::AuthTag, CheckResult::pass("tag verified"));
                }
                Some(detail) => {
                    checks.insert(CheckName::AuthTag, CheckResult::fail(detail.clone()));
                    failures.push(ValidationFailure::AuthTagInvalid(detail));
                }
            }
        }

        // (d) attestation
        match &self.attestation {
            Some(verifier) if self.config.verify_attestation => {
                let detail = match verifier.attest(shard).await {
                    Ok(true) => None,
                    Ok(false) => Some("attestation rejected".to_string()),
                    Err(e) => Some(e.to_string()),
                };
                match detail {
                    None => {
                        checks.insert(CheckName::Attestation, CheckResult::pass("attested"));
                    }
                    Some(detail) => {
                        checks.insert(CheckName::Attestation, CheckResult::fail(detail.clone()));
                        failures.push(ValidationFailure::AttestationInvalid(detail));
                    }
                }
            }
            _ => {
                checks.insert(CheckName::Attestation, CheckResult::skipped("no verifier"));
            }
        }

        let failure = failures.into_iter().next();
        ValidationResult {
            shard_id: shard.id,
            attempt,
            checks,
            verdict: if failure.is_none() {
                Verdict::Valid
            } else {
                Verdict::Invalid
            },
            failure,
            timestamp: Utc::now(),
        }
    }

    /// Validate a registered shard and commit the verdict
    ///
    /// A valid result moves the shard to `validated`, an invalid one to
    /// `invalid`; once failures exceed `max_retries` the shard is
    /// quarantined. The verdict is returned either way; errors are reserved
    /// for state and ledger problems.
    pub async fn validate(&self, registry: &ShardRegistry, id: ShardId) -> Result<ValidationResult> {
        let mut guard = registry.acquire(id).await?;

        if !matches!(guard.status, ShardStatus::Unassigned | ShardStatus::Invalid) {
            return Err(illegal_transition(id, guard.status, "validated"));
        }

        let attempt = guard.validation_failures + 1;
        let result = self.check(&guard, attempt).await;

        if result.is_valid() {
            registry
                .apply(&mut guard, ShardEvent::Validated(result.clone()))
                .await?;
            info!(shard_id = %id, attempt, "Shard validated");
            return Ok(result);
        }

        for (name, check) in &result.checks {
            warn!(
                shard_id = %id,
                attempt,
                check = %name,
                outcome = ?check.outcome,
                detail = %check.detail,
                "Validation check"
            );
        }

        registry
            .apply(&mut guard, ShardEvent::ValidationFailed(result.clone()))
            .await?;

        if guard.validation_failures > self.config.max_retries {
            let reason = match &result.failure {
                Some(failure) => format!(
                    "{} after {} attempts",
                    failure, guard.validation_failures
                ),
                None => "validation failed".to_string(),
            };
            warn!(shard_id = %id, %reason, "Quarantining shard");
            registry
                .apply(&mut guard, ShardEvent::Quarantine { reason })
                .await?;
        }

        Ok(result)
    }
}

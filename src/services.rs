//! External collaborator interfaces
//!
//! The orchestration core never implements cryptography, attestation or
//! anomaly scoring itself. It talks to those services through the traits
//! below; [`crate::crypto::RingCryptoService`] is the bundled reference
//! crypto adapter.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;
use crate::shard::{EncryptionMetadata, Shard};

/// Encryption and signing over byte buffers
#[async_trait]
pub trait CryptoService: Send + Sync {
    /// Encrypt `plaintext`, returning ciphertext and the metadata needed to open it
    async fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, EncryptionMetadata)>;

    async fn decrypt(&self, ciphertext: &[u8], metadata: &EncryptionMetadata) -> Result<Vec<u8>>;

    async fn sign(&self, data: &[u8]) -> Result<Vec<u8>>;

    async fn verify(&self, data: &[u8], signature: &[u8]) -> Result<bool>;

    /// Whether the authentication tag embedded in `payload` is valid
    async fn verify_auth_tag(&self, payload: &[u8], metadata: &EncryptionMetadata) -> Result<bool>;
}

/// Hardware or enclave attestation of a shard's custody
#[async_trait]
pub trait AttestationVerifier: Send + Sync {
    async fn attest(&self, shard: &Shard) -> Result<bool>;
}

/// Named numeric features describing a shard's recent behaviour
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub features: BTreeMap<String, f64>,
}

impl FeatureVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.features.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.features.get(name).copied()
    }
}

/// Black-box risk model
#[async_trait]
pub trait AnomalyScorer: Send + Sync {
    /// Risk severity; callers clamp the result to 0.0..=1.0
    async fn score(&self, features: &FeatureVector) -> Result<f64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_vector_builder() {
        let features = FeatureVector::new()
            .with("bounce_rate", 0.7)
            .with("cpu", 0.2);
        assert_eq!(features.get("bounce_rate"), Some(0.7));
        assert_eq!(features.get("missing"), None);
        assert_eq!(features.features.len(), 2);
    }
}

//! Chain hashing primitives
//!
//! The ledger links entries with either a plain SHA-256 digest (verifiable by
//! anyone holding the entries) or a keyed HMAC-SHA256 (verifiable only by
//! holders of the secret). The keyed variant wraps its key so it is never
//! logged or serialized.

use crate::error::{LedgerError, Result};
use ring::{digest, hmac};
use std::sync::Arc;

/// Environment variable consulted by [`ChainHasher::hmac_from_env`]
pub const LEDGER_SECRET_ENV: &str = "TESSERA_LEDGER_SECRET";

/// Hash function used to link ledger entries
#[derive(Clone, Default)]
pub enum ChainHasher {
    /// Unkeyed SHA-256
    #[default]
    Sha256,
    /// HMAC-SHA256 with a shared secret
    Hmac(Arc<hmac::Key>),
}

impl ChainHasher {
    /// Unkeyed SHA-256 chaining
    pub fn sha256() -> Self {
        ChainHasher::Sha256
    }

    /// Keyed chaining from explicit bytes
    ///
    /// ```
    /// use tessera_core_ledger::ChainHasher;
    ///
    /// let hasher = ChainHasher::hmac_from_bytes(b"my_secret_key_for_testing");
    /// assert!(hasher.is_keyed());
    /// ```
    pub fn hmac_from_bytes(secret: &[u8]) -> Self {
        let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
        ChainHasher::Hmac(Arc::new(key))
    }

    /// Keyed chaining with the secret taken from `TESSERA_LEDGER_SECRET`
    pub fn hmac_from_env() -> Result<Self> {
        let secret = std::env::var(LEDGER_SECRET_ENV)
            .map_err(|_| LedgerError::MissingSecret(LEDGER_SECRET_ENV.to_string()))?;

        if secret.is_empty() {
            return Err(LedgerError::InvalidSecret(format!(
                "{} cannot be empty",
                LEDGER_SECRET_ENV
            )));
        }

        Ok(Self::hmac_from_bytes(secret.as_bytes()))
    }

    /// Whether this hasher requires a secret to verify
    pub fn is_keyed(&self) -> bool {
        matches!(self, ChainHasher::Hmac(_))
    }

    /// Hex digest of `data`
    pub fn digest_hex(&self, data: &[u8]) -> String {
        match self {
            ChainHasher::Sha256 => hex::encode(digest::digest(&digest::SHA256, data).as_ref()),
            ChainHasher::Hmac(key) => hex::encode(hmac::sign(key, data).as_ref()),
        }
    }
}

impl std::fmt::Debug for ChainHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainHasher::Sha256 => f.write_str("ChainHasher::Sha256"),
            ChainHasher::Hmac(_) => f
                .debug_struct("ChainHasher::Hmac")
                .field("key", &"<redacted>")
                .finish(),
        }
    }
}

/// SHA-256 hex digest of arbitrary payload bytes
///
/// Used for `payload_hash` regardless of the chaining mode, so payload
/// digests stay comparable across ledgers.
pub fn payload_digest(bytes: &[u8]) -> String {
    hex::encode(digest::digest(&digest::SHA256, bytes).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_is_deterministic() {
        let hasher = ChainHasher::sha256();
        assert_eq!(hasher.digest_hex(b"abc"), hasher.digest_hex(b"abc"));
        assert_eq!(hasher.digest_hex(b"abc").len(), 64);
    }

    #[test]
    fn test_hmac_differs_from_plain() {
        let plain = ChainHasher::sha256();
        let keyed = ChainHasher::hmac_from_bytes(b"secret");
        assert_ne!(plain.digest_hex(b"abc"), keyed.digest_hex(b"abc"));
    }

    #[test]
    fn test_debug_redacts_key() {
        let hasher = ChainHasher::hmac_from_bytes(b"super_secret_key");
        let debug_output = format!("{:?}", hasher);

        assert!(debug_output.contains("<redacted>"));
        assert!(!debug_output.contains("super_secret_key"));
    }

    #[test]
    fn test_env_secret_handling() {
        std::env::remove_var(LEDGER_SECRET_ENV);
        assert!(matches!(
            ChainHasher::hmac_from_env(),
            Err(LedgerError::MissingSecret(_))
        ));

        std::env::set_var(LEDGER_SECRET_ENV, "");
        assert!(matches!(
            ChainHasher::hmac_from_env(),
            Err(LedgerError::InvalidSecret(_))
        ));

        std::env::set_var(LEDGER_SECRET_ENV, "ledger_secret_123");
        assert!(ChainHasher::hmac_from_env().unwrap().is_keyed());

        std::env::remove_var(LEDGER_SECRET_ENV);
    }
}

//! Reference crypto adapter backed by `ring`
//!
//! AES-256-GCM for payload encryption (the GCM tag doubles as the shard's
//! authentication tag) and HMAC-SHA256 for signatures.

use async_trait::async_trait;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, NONCE_LEN};
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{Result, TesseraError};
use crate::services::CryptoService;
use crate::shard::EncryptionMetadata;

pub const AES_256_GCM: &str = "AES-256-GCM";

pub struct RingCryptoService {
    key_id: String,
    cipher: LessSafeKey,
    signer: hmac::Key,
    rng: SystemRandom,
}

impl std::fmt::Debug for RingCryptoService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingCryptoService")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl RingCryptoService {
    /// Build from a 32-byte key; the signing key is derived from the same material
    pub fn new(key_id: impl Into<String>, key: &[u8; 32]) -> Result<Self> {
        let unbound = UnboundKey::new(&aead::AES_256_GCM, key)
            .map_err(|_| TesseraError::Collaborator("invalid AES-256 key".to_string()))?;
        let signing = hmac::sign(&hmac::Key::new(hmac::HMAC_SHA256, key), b"tessera-signing");

        Ok(Self {
            key_id: key_id.into(),
            cipher: LessSafeKey::new(unbound),
            signer: hmac::Key::new(hmac::HMAC_SHA256, signing.as_ref()),
            rng: SystemRandom::new(),
        })
    }

    /// Build with a freshly generated random key
    pub fn generate(key_id: impl Into<String>) -> Result<Self> {
        let mut key = [0u8; 32];
        SystemRandom::new()
            .fill(&mut key)
            .map_err(|_| TesseraError::Collaborator("system RNG unavailable".to_string()))?;
        Self::new(key_id, &key)
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    fn nonce_from(&self, metadata: &EncryptionMetadata) -> Result<Nonce> {
        if metadata.algorithm != AES_256_GCM {
            return Err(TesseraError::Collaborator(format!(
                "unsupported algorithm {}",
                metadata.algorithm
            )));
        }
        if metadata.key_id != self.key_id {
            return Err(TesseraError::Collaborator(format!(
                "unknown key {}",
                metadata.key_id
            )));
        }
        let bytes = hex::decode(&metadata.nonce)
            .map_err(|e| TesseraError::Collaborator(format!("malformed nonce: {}", e)))?;
        Nonce::try_assume_unique_for_key(&bytes)
            .map_err(|_| TesseraError::Collaborator("nonce has wrong length".to_string()))
    }

    fn open(&self, ciphertext: &[u8], metadata: &EncryptionMetadata) -> Result<Option<Vec<u8>>> {
        let nonce = self.nonce_from(metadata)?;
        let mut in_out = ciphertext.to_vec();
        match self.cipher.open_in_place(nonce, Aad::empty(), &mut in_out) {
            Ok(plaintext) => Ok(Some(plaintext.to_vec())),
            Err(_) => Ok(None),
        }
    }
}

#[async_trait]
impl CryptoService for RingCryptoService {
    async fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, EncryptionMetadata)> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| TesseraError::Collaborator("system RNG unavailable".to_string()))?;

        let mut in_out = plaintext.to_vec();
        self.cipher
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| TesseraError::Collaborator("encryption failed".to_string()))?;

        let metadata = EncryptionMetadata {
            algorithm: AES_256_GCM.to_string(),
            key_id: self.key_id.clone(),
            nonce: hex::encode(nonce_bytes),
        };
        Ok((in_out, metadata))
    }

    async fn decrypt(&self, ciphertext: &[u8], metadata: &EncryptionMetadata) -> Result<Vec<u8>> {
        self.open(ciphertext, metadata)?
            .ok_or_else(|| TesseraError::Collaborator("authentication tag mismatch".to_string()))
    }

    async fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(hmac::sign(&self.signer, data).as_ref().to_vec())
    }

    async fn verify(&self, data: &[u8], signature: &[u8]) -> Result<bool> {
        Ok(hmac::verify(&self.signer, data, signature).is_ok())
    }

    async fn verify_auth_tag(&self, payload: &[u8], metadata: &EncryptionMetadata) -> Result<bool> {
        Ok(self.open(payload, metadata)?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_encrypt_decrypt() {
        let crypto = RingCryptoService::new("k1", &[7u8; 32]).unwrap();
        let (ciphertext, metadata) = crypto.encrypt(b"fragment").await.unwrap();

        assert_ne!(&ciphertext[..], b"fragment");
        assert_eq!(metadata.algorithm, AES_256_GCM);
        assert!(crypto.verify_auth_tag(&ciphertext, &metadata).await.unwrap());
        assert_eq!(
            crypto.decrypt(&ciphertext, &metadata).await.unwrap(),
            b"fragment"
        );
    }

    #[tokio::test]
    async fn test_flipped_byte_fails_auth_tag() {
        let crypto = RingCryptoService::generate("k1").unwrap();
        let (mut ciphertext, metadata) = crypto.encrypt(b"fragment").await.unwrap();
        ciphertext[0] ^= 0x01;

        assert!(!crypto.verify_auth_tag(&ciphertext, &metadata).await.unwrap());
        assert!(crypto.decrypt(&ciphertext, &metadata).await.is_err());
    }

    #[tokio::test]
    async fn test_foreign_key_rejected() {
        let crypto = RingCryptoService::generate("k1").unwrap();
        let (ciphertext, mut metadata) = crypto.encrypt(b"x").await.unwrap();
        metadata.key_id = "k2".to_string();

        assert!(crypto.verify_auth_tag(&ciphertext, &metadata).await.is_err());
    }

    #[tokio::test]
    async fn test_sign_verify() {
        let crypto = RingCryptoService::new("k1", &[1u8; 32]).unwrap();
        let signature = crypto.sign(b"record").await.unwrap();

        assert!(crypto.verify(b"record", &signature).await.unwrap());
        assert!(!crypto.verify(b"recorx", &signature).await.unwrap());
    }
}

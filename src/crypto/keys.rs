// ABOUTME: Master-key management and authenticated encryption for stored secrets
// ABOUTME: Seals upstream provider API keys with AES-256-GCM under an env-provided master key
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tidemark

//! Key vault for provider API keys
//!
//! Users configure an upstream provider API key; at rest it is sealed with
//! AES-256-GCM under a master key loaded from `TIDEMARK_MASTER_KEY`
//! (base64, 32 bytes). In development a key is generated with a loud
//! warning so the server still starts.

use crate::errors::{AppError, AppResult};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit};
use base64::{engine::general_purpose, Engine};
use rand::RngCore;
use zeroize::Zeroize;

/// Size of the AES-GCM nonce prepended to every sealed value
const NONCE_LEN: usize = 12;

/// Vault sealing and opening provider secrets under the master key
pub struct KeyVault {
    key: [u8; 32],
}

impl KeyVault {
    /// Create a vault from raw key bytes - primarily for testing
    #[must_use]
    pub const fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Load the master key from its base64 env representation, or generate
    /// a development key with a warning when none is configured
    ///
    /// # Errors
    ///
    /// Returns an error if the configured value is not valid base64 or is
    /// not exactly 32 bytes.
    pub fn load_or_generate(configured: Option<&str>) -> AppResult<Self> {
        match configured {
            Some(encoded) => Self::load_from_encoded(encoded),
            None => Ok(Self::generate_for_development()),
        }
    }

    /// Decode a base64 master key
    fn load_from_encoded(encoded: &str) -> AppResult<Self> {
        tracing::info!("Loading master key from environment");
        let mut key_bytes = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| AppError::config(format!("Invalid base64 in TIDEMARK_MASTER_KEY: {e}")))?;

        if key_bytes.len() != 32 {
            key_bytes.zeroize();
            return Err(AppError::config(
                "Master key must be exactly 32 bytes".to_owned(),
            ));
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(&key_bytes);
        key_bytes.zeroize();
        Ok(Self { key })
    }

    /// Generate a temporary master key for development
    fn generate_for_development() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);

        tracing::warn!("TIDEMARK_MASTER_KEY not found in environment");
        tracing::warn!(
            "Generated master key (save for production): TIDEMARK_MASTER_KEY={}",
            general_purpose::STANDARD.encode(key)
        );
        tracing::warn!("Keys sealed with this master key will not survive a restart");

        Self { key }
    }

    /// Seal a plaintext secret, returning `nonce || ciphertext`
    ///
    /// # Errors
    ///
    /// Returns an error if encryption fails.
    pub fn seal(&self, plaintext: &[u8]) -> AppResult<Vec<u8>> {
        let cipher = Aes256Gcm::new(GenericArray::from_slice(&self.key));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = GenericArray::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| AppError::internal(format!("Encryption failed: {e}")))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open a sealed secret produced by [`Self::seal`]
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` when the value cannot be authenticated -
    /// typically a rotated or corrupted master key. Callers treat this as
    /// "the stored key must be re-entered".
    pub fn open(&self, sealed: &[u8]) -> AppResult<String> {
        if sealed.len() <= NONCE_LEN {
            return Err(AppError::new(
                crate::errors::ErrorCode::ConfigInvalid,
                "Sealed value too short",
            ));
        }

        let cipher = Aes256Gcm::new(GenericArray::from_slice(&self.key));
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = GenericArray::from_slice(nonce_bytes);

        let mut plaintext = cipher.decrypt(nonce, ciphertext).map_err(|_| {
            AppError::new(
                crate::errors::ErrorCode::ConfigInvalid,
                "Failed to decrypt stored key (master key rotated or data corrupted)",
            )
        })?;

        let secret = String::from_utf8(plaintext.clone())
            .map_err(|e| AppError::internal(format!("Decrypted key is not UTF-8: {e}")));
        plaintext.zeroize();
        secret
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let vault = KeyVault::from_bytes([7u8; 32]);
        let sealed = vault.seal(b"sk-test-key").unwrap();
        assert_eq!(vault.open(&sealed).unwrap(), "sk-test-key");
    }

    #[test]
    fn test_nonce_uniqueness() {
        let vault = KeyVault::from_bytes([7u8; 32]);
        let a = vault.seal(b"sk-test-key").unwrap();
        let b = vault.seal(b"sk-test-key").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_master_key_fails() {
        let vault = KeyVault::from_bytes([7u8; 32]);
        let other = KeyVault::from_bytes([8u8; 32]);

        let sealed = vault.seal(b"sk-test-key").unwrap();
        let err = other.open(&sealed).unwrap_err();
        assert_eq!(err.code, crate::errors::ErrorCode::ConfigInvalid);
    }

    #[test]
    fn test_truncated_value_rejected() {
        let vault = KeyVault::from_bytes([7u8; 32]);
        assert!(vault.open(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_load_from_encoded_validates_length() {
        let short = general_purpose::STANDARD.encode([0u8; 16]);
        assert!(KeyVault::load_or_generate(Some(&short)).is_err());

        let full = general_purpose::STANDARD.encode([0u8; 32]);
        assert!(KeyVault::load_or_generate(Some(&full)).is_ok());
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! AES-256-GCM authenticated encryption.
//!
//! Every ciphertext is prefixed with the random 96-bit IV which was used to create it.
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;

use crate::crypto::CryptoError;
use crate::crypto::secret::Secret;
use crate::traits::{Decrypt, Encrypt};

pub const AES_KEY_SIZE: usize = 32;

pub const AES_IV_SIZE: usize = 12;

/// Symmetric AES-256-GCM key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AesKey(Secret<AES_KEY_SIZE>);

impl AesKey {
    /// Generates a new random key.
    pub fn generate() -> Self {
        Self(Secret::random())
    }

    pub fn from_bytes(bytes: [u8; AES_KEY_SIZE]) -> Self {
        Self(Secret::from_bytes(bytes))
    }

    pub fn try_from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; AES_KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(bytes.len(), AES_KEY_SIZE))?;
        Ok(Self::from_bytes(bytes))
    }

    /// Raw key bytes for persistence.
    pub fn to_bytes(&self) -> [u8; AES_KEY_SIZE] {
        *self.0.as_bytes()
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.0.as_bytes()))
    }
}

impl Encrypt for AesKey {
    /// Encrypts plaintext with a freshly generated IV, returning `IV || ciphertext`.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut iv = [0u8; AES_IV_SIZE];
        OsRng.fill_bytes(&mut iv);

        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(AES_IV_SIZE + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }
}

impl Decrypt for AesKey {
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < AES_IV_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        let (iv, ciphertext) = ciphertext.split_at(AES_IV_SIZE);

        self.cipher()
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

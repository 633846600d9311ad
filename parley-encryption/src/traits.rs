// SPDX-License-Identifier: MIT OR Apache-2.0

//! Capability interfaces over key material.
//!
//! Higher layers never touch raw keys. They compose these capabilities, which allows registering
//! very different kinds of keys (RSA key pairs for published keys and response channels, AES keys
//! for established sessions) side by side in the same index.
use std::fmt::Debug;

use crate::crypto::CryptoError;

/// Encrypts plaintext towards the holder of the matching decryption key.
pub trait Encrypt: Debug + Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Decrypts ciphertexts created with the matching encryption key.
///
/// Fails with [`CryptoError::DecryptionFailed`] for ciphertexts which were not created for this
/// key, which is the expected outcome for most keys during trial decryption.
pub trait Decrypt: Debug + Send + Sync {
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Creates authentication tags over data.
pub trait Sign: Debug + Send + Sync {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Checks authentication tags created with [`Sign`].
pub trait Verify: Debug + Send + Sync {
    fn verify(&self, data: &[u8], signature: &[u8]) -> bool;
}

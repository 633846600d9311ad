// SPDX-License-Identifier: MIT OR Apache-2.0

//! Password-based derivation of the local storage master key.
use sha2::Sha256;

use crate::crypto::aes::{AES_KEY_SIZE, AesKey};

/// Number of PBKDF2 rounds used for the master key.
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 100_000;

/// Derives an AES-256-GCM key from a user password with PBKDF2-HMAC-SHA-256.
pub fn derive_master_key(password: &[u8], salt: &[u8], iterations: u32) -> AesKey {
    let mut bytes = [0u8; AES_KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut bytes);
    AesKey::from_bytes(bytes)
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cryptographic primitives.
//!
//! Algorithms are fixed: ECDH on P-256 for session agreement, RSA-OAEP for published keys and
//! response channels, AES-256-GCM for payloads, HMAC-SHA-256 for frame signatures and
//! PBKDF2-SHA-256 for the local storage master key.
pub mod aes;
pub mod ecdh;
pub mod hmac;
pub mod pbkdf2;
pub mod rsa;
mod secret;

use thiserror::Error;

pub use secret::Secret;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("key generation failed")]
    KeyGeneration,

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("invalid key length {0}, expected {1} bytes")]
    InvalidKeyLength(usize, usize),

    #[error("could not encode {0}")]
    KeyEncoding(&'static str),

    #[error("could not decode {0}")]
    KeyDecoding(&'static str),
}

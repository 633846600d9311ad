// SPDX-License-Identifier: MIT OR Apache-2.0

//! `parley-encryption` holds the key material of parley and the handshake which establishes it.
//!
//! Two peers who have never talked before agree on a symmetric session in four steps, starting
//! from a published RSA-OAEP key one of them shared out-of-band (for example through an invite
//! link or QR code). See [`ConnectionEntry`] for the state machine and the cryptography of each
//! step.
//!
//! Inbound frames do not reveal whom they are addressed to. All key material is therefore
//! registered under the id of its owner in a [`KeysIndex`], which resolves a ciphertext to its
//! owner by racing all keys against it, and a [`SignsIndex`], which verifies frame signatures of
//! established sessions.
//!
//! ## Algorithms
//!
//! Algorithms are fixed and not negotiated:
//!
//! - ECDH on NIST P-256 with HKDF-SHA-256 to derive session keys
//! - RSA-OAEP with SHA-256 (hybrid, see [`crypto::rsa`]) for published keys and response channels
//! - AES-256-GCM for payloads, with a random 96-bit IV prefixed to every ciphertext
//! - HMAC-SHA-256 to sign ciphertexts of sessions
//! - PBKDF2-HMAC-SHA-256 to derive the local storage master key from a password
pub mod connection;
pub mod crypto;
mod id;
mod key_index;
mod published_key;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
pub mod traits;

pub use connection::{
    ConnectionEntry, ConnectionError, ConnectionState, Role, Session, export_connections,
    import_connections,
};
pub use crypto::CryptoError;
pub use crypto::aes::AesKey;
pub use crypto::ecdh::{EcdhPublicKey, EcdhSecretKey, SessionKeys, derive_session_keys};
pub use crypto::hmac::HmacKey;
pub use crypto::pbkdf2::{DEFAULT_PBKDF2_ITERATIONS, derive_master_key};
pub use crypto::rsa::{DEFAULT_RSA_MODULUS_BITS, RsaKeyPair, RsaPublicKey};
pub use id::{KEY_ID_SIZE, KeyId, KeyIdError};
pub use key_index::{KeysIndex, SignsIndex};
pub use published_key::{
    PublishedKey, PublishedKeyError, export_published_keys, import_published_keys,
};

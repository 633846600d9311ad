// SPDX-License-Identifier: MIT OR Apache-2.0

//! ECDH key agreement on the NIST P-256 curve and derivation of session keys.
//!
//! The raw shared secret is never used directly. It is expanded with HKDF-SHA-256 into two
//! independent keys, one for AES-256-GCM and one for HMAC-SHA-256.
use std::fmt;

use hkdf::Hkdf;
use p256::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rand::rngs::OsRng;
use sha2::Sha256;

use crate::crypto::CryptoError;
use crate::crypto::aes::{AES_KEY_SIZE, AesKey};
use crate::crypto::hmac::{HMAC_KEY_SIZE, HmacKey};

const AES_INFO: &[u8] = b"parley aes-gcm";

const HMAC_INFO: &[u8] = b"parley hmac";

/// Secret half of an ECDH P-256 key pair.
#[derive(Clone)]
pub struct EcdhSecretKey(p256::SecretKey);

impl EcdhSecretKey {
    pub fn generate() -> Self {
        Self(p256::SecretKey::random(&mut OsRng))
    }

    pub fn public_key(&self) -> EcdhPublicKey {
        EcdhPublicKey(self.0.public_key())
    }

    /// Exports the secret key in PKCS#8 DER encoding.
    pub fn to_pkcs8(&self) -> Result<Vec<u8>, CryptoError> {
        let document = self
            .0
            .to_pkcs8_der()
            .map_err(|_| CryptoError::KeyEncoding("ecdh secret key"))?;
        Ok(document.as_bytes().to_vec())
    }

    pub fn from_pkcs8(bytes: &[u8]) -> Result<Self, CryptoError> {
        p256::SecretKey::from_pkcs8_der(bytes)
            .map(Self)
            .map_err(|_| CryptoError::KeyDecoding("ecdh secret key"))
    }
}

impl PartialEq for EcdhSecretKey {
    fn eq(&self, other: &Self) -> bool {
        // p256 compares secret scalars in constant time.
        self.0 == other.0
    }
}

impl Eq for EcdhSecretKey {}

impl fmt::Debug for EcdhSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcdhSecretKey")
            .field("value", &"***")
            .finish()
    }
}

/// Public half of an ECDH P-256 key pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EcdhPublicKey(p256::PublicKey);

impl EcdhPublicKey {
    /// Exports the public key in SPKI DER encoding.
    pub fn to_spki(&self) -> Result<Vec<u8>, CryptoError> {
        let document = self
            .0
            .to_public_key_der()
            .map_err(|_| CryptoError::KeyEncoding("ecdh public key"))?;
        Ok(document.as_bytes().to_vec())
    }

    pub fn from_spki(bytes: &[u8]) -> Result<Self, CryptoError> {
        p256::PublicKey::from_public_key_der(bytes)
            .map(Self)
            .map_err(|_| CryptoError::KeyDecoding("ecdh public key"))
    }
}

/// Symmetric key material of an established session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionKeys {
    pub aes: AesKey,
    pub hmac: HmacKey,
}

/// Derives AES and HMAC session keys from our ECDH secret and the other party's public key.
///
/// Both parties arrive at identical keys: `derive(pk_b, sk_a) == derive(pk_a, sk_b)`.
pub fn derive_session_keys(
    their_public_key: &EcdhPublicKey,
    our_secret_key: &EcdhSecretKey,
) -> Result<SessionKeys, CryptoError> {
    let shared_secret = p256::ecdh::diffie_hellman(
        our_secret_key.0.to_nonzero_scalar(),
        their_public_key.0.as_affine(),
    );

    let hkdf = Hkdf::<Sha256>::new(None, shared_secret.raw_secret_bytes().as_slice());

    let mut aes_bytes = [0u8; AES_KEY_SIZE];
    hkdf.expand(AES_INFO, &mut aes_bytes)
        .map_err(|_| CryptoError::KeyDerivation)?;

    let mut hmac_bytes = [0u8; HMAC_KEY_SIZE];
    hkdf.expand(HMAC_INFO, &mut hmac_bytes)
        .map_err(|_| CryptoError::KeyDerivation)?;

    Ok(SessionKeys {
        aes: AesKey::from_bytes(aes_bytes),
        hmac: HmacKey::from_bytes(hmac_bytes),
    })
}

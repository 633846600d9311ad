// SPDX-License-Identifier: MIT OR Apache-2.0

//! RSA-OAEP (SHA-256) encryption for published keys and response channels.
//!
//! RSA-OAEP alone can only encrypt payloads a little smaller than the modulus, which is not enough
//! for a connection request carrying two public keys. Payloads are therefore sealed in a hybrid
//! envelope: a fresh AES-256-GCM content key encrypts the payload and RSA-OAEP encrypts the
//! content key.
//!
//! ```text
//! [u16 len + RSA-OAEP(content key)][IV + AES-GCM(payload)]
//! ```
use std::fmt;

use parley_core::{Reader, Writer};
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey};
use sha2::Sha256;

use crate::crypto::CryptoError;
use crate::crypto::aes::AesKey;
use crate::traits::{Decrypt, Encrypt};

/// Default modulus size of generated RSA key pairs.
pub const DEFAULT_RSA_MODULUS_BITS: usize = 2048;

/// Public RSA-OAEP key other peers use to send us payloads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RsaPublicKey(rsa::RsaPublicKey);

impl RsaPublicKey {
    /// Exports the public key in SPKI DER encoding.
    pub fn to_spki(&self) -> Result<Vec<u8>, CryptoError> {
        let document = self
            .0
            .to_public_key_der()
            .map_err(|_| CryptoError::KeyEncoding("rsa public key"))?;
        Ok(document.as_bytes().to_vec())
    }

    pub fn from_spki(bytes: &[u8]) -> Result<Self, CryptoError> {
        rsa::RsaPublicKey::from_public_key_der(bytes)
            .map(Self)
            .map_err(|_| CryptoError::KeyDecoding("rsa public key"))
    }

    /// Size of the modulus in bits.
    pub fn bits(&self) -> usize {
        self.0.size() * 8
    }
}

impl Encrypt for RsaPublicKey {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let content_key = AesKey::generate();
        let wrapped_key = self
            .0
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &content_key.to_bytes())
            .map_err(|_| CryptoError::EncryptionFailed)?;
        let body = content_key.encrypt(plaintext)?;

        let mut writer = Writer::new();
        writer
            .write_bytes(&wrapped_key)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        writer.write_raw(&body);
        Ok(writer.finish())
    }
}

/// RSA-OAEP key pair. The secret half never leaves this process unencrypted.
#[derive(Clone)]
pub struct RsaKeyPair {
    secret: RsaPrivateKey,
    public: RsaPublicKey,
}

impl RsaKeyPair {
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        let secret =
            RsaPrivateKey::new(&mut OsRng, bits).map_err(|_| CryptoError::KeyGeneration)?;
        let public = RsaPublicKey(secret.to_public_key());
        Ok(Self { secret, public })
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// Exports the secret key in PKCS#8 DER encoding.
    pub fn to_pkcs8(&self) -> Result<Vec<u8>, CryptoError> {
        let document = self
            .secret
            .to_pkcs8_der()
            .map_err(|_| CryptoError::KeyEncoding("rsa secret key"))?;
        Ok(document.as_bytes().to_vec())
    }

    pub fn from_pkcs8(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret = RsaPrivateKey::from_pkcs8_der(bytes)
            .map_err(|_| CryptoError::KeyDecoding("rsa secret key"))?;
        let public = RsaPublicKey(secret.to_public_key());
        Ok(Self { secret, public })
    }
}

impl PartialEq for RsaKeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.public == other.public
    }
}

impl Eq for RsaKeyPair {}

impl fmt::Debug for RsaKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaKeyPair")
            .field("public", &self.public)
            .field("secret", &"***")
            .finish()
    }
}

impl Encrypt for RsaKeyPair {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.public.encrypt(plaintext)
    }
}

impl Decrypt for RsaKeyPair {
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut reader = Reader::new(ciphertext);
        let wrapped_key = reader
            .read_bytes()
            .map_err(|_| CryptoError::DecryptionFailed)?;
        let body = reader.read_remaining();

        let content_key = self
            .secret
            .decrypt(Oaep::new::<Sha256>(), &wrapped_key)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        let content_key =
            AesKey::try_from_slice(&content_key).map_err(|_| CryptoError::DecryptionFailed)?;

        content_key.decrypt(body)
    }
}

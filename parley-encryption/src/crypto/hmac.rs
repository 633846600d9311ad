// SPDX-License-Identifier: MIT OR Apache-2.0

//! HMAC-SHA-256 message authentication.
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::crypto::CryptoError;
use crate::crypto::secret::Secret;
use crate::traits::{Sign, Verify};

pub const HMAC_KEY_SIZE: usize = 32;

pub const HMAC_SIGNATURE_SIZE: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Key to sign and verify data with HMAC-SHA-256.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HmacKey(Secret<HMAC_KEY_SIZE>);

impl HmacKey {
    pub fn generate() -> Self {
        Self(Secret::random())
    }

    pub fn from_bytes(bytes: [u8; HMAC_KEY_SIZE]) -> Self {
        Self(Secret::from_bytes(bytes))
    }

    pub fn try_from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; HMAC_KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(bytes.len(), HMAC_KEY_SIZE))?;
        Ok(Self::from_bytes(bytes))
    }

    pub fn to_bytes(&self) -> [u8; HMAC_KEY_SIZE] {
        *self.0.as_bytes()
    }

    fn mac(&self) -> Result<HmacSha256, CryptoError> {
        HmacSha256::new_from_slice(self.0.as_bytes())
            .map_err(|_| CryptoError::InvalidKeyLength(HMAC_KEY_SIZE, HMAC_KEY_SIZE))
    }
}

impl Sign for HmacKey {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut mac = self.mac()?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

impl Verify for HmacKey {
    fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        let Ok(mut mac) = self.mac() else {
            return false;
        };
        mac.update(data);
        // Constant-time comparison.
        mac.verify_slice(signature).is_ok()
    }
}

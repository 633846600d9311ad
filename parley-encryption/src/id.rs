// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use rand::rngs::OsRng;
use thiserror::Error;

pub const KEY_ID_SIZE: usize = 16;

/// Opaque identifier of a connection or published key.
///
/// The same id is used to register the key material owned by the connection or published key in
/// the key indexes, so a successful trial decryption tells us which of them a frame belongs to.
/// Formatted like a random (version 4) UUID.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId([u8; KEY_ID_SIZE]);

impl KeyId {
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_ID_SIZE];
        OsRng.fill_bytes(&mut bytes);
        // Version 4, RFC 4122 variant.
        bytes[6] = (bytes[6] & 0x0f) | 0x40;
        bytes[8] = (bytes[8] & 0x3f) | 0x80;
        Self(bytes)
    }

    pub const fn from_bytes(bytes: [u8; KEY_ID_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_ID_SIZE] {
        &self.0
    }
}

impl TryFrom<&[u8]> for KeyId {
    type Error = KeyIdError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; KEY_ID_SIZE] = value
            .try_into()
            .map_err(|_| KeyIdError::InvalidLength(value.len()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hex::encode(self.0);
        write!(
            f,
            "{}-{}-{}-{}-{}",
            &hex[0..8],
            &hex[8..12],
            &hex[12..16],
            &hex[16..20],
            &hex[20..32]
        )
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyId").field(&self.to_string()).finish()
    }
}

impl FromStr for KeyId {
    type Err = KeyIdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let hex: String = value.chars().filter(|c| *c != '-').collect();
        let bytes = hex::decode(hex).map_err(|_| KeyIdError::InvalidHexEncoding)?;
        Self::try_from(bytes.as_slice())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyIdError {
    #[error("invalid key id length {0}, expected {size} bytes", size = KEY_ID_SIZE)]
    InvalidLength(usize),

    #[error("invalid hex encoding in key id")]
    InvalidHexEncoding,
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::{KeyId, KeyIdError};

    #[test]
    fn uuid_formatting() {
        let id = KeyId::from_bytes([
            0x12, 0x3e, 0x45, 0x67, 0xe8, 0x9b, 0x42, 0xd3, 0xa4, 0x56, 0x42, 0x66, 0x14, 0x17,
            0x40, 0x00,
        ]);
        assert_eq!(id.to_string(), "123e4567-e89b-42d3-a456-426614174000");
        assert_eq!(
            KeyId::from_str("123e4567-e89b-42d3-a456-426614174000").unwrap(),
            id
        );
    }

    #[test]
    fn random_ids() {
        let id = KeyId::random();
        assert_ne!(id, KeyId::random());
        assert_eq!(id.to_string().len(), 36);
        assert_eq!(&id.to_string()[14..15], "4");
        assert_eq!(KeyId::from_str(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn invalid_ids() {
        assert_eq!(KeyId::from_str("xyz"), Err(KeyIdError::InvalidHexEncoding));
        assert_eq!(KeyId::from_str("abcd"), Err(KeyIdError::InvalidLength(2)));
        assert!(KeyId::try_from(&[0u8; 15][..]).is_err());
    }
}

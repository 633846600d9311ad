// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

use sha2::{Digest, Sha256};
use thiserror::Error;

pub const HASH_LEN: usize = 32;

/// SHA-256 digest of a raw wire frame.
///
/// Frames are identified by their hash when resuming from a checkpoint and when filtering frames
/// which were already processed.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hash([u8; HASH_LEN]);

impl Hash {
    pub fn new(frame: impl AsRef<[u8]>) -> Self {
        Self(Sha256::digest(frame.as_ref()).into())
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl TryFrom<&[u8]> for Hash {
    type Error = HashError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        <[u8; HASH_LEN]>::try_from(bytes)
            .map(Self)
            .map_err(|_| HashError::InvalidLength(bytes.len()))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form, enough to tell frames apart in logs.
        write!(f, "Hash({})", &hex::encode(self.0)[..12])
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HashError {
    #[error("hash needs to be {len} bytes, got {0}", len = HASH_LEN)]
    InvalidLength(usize),
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! Outer frame every encrypted payload travels in.
//!
//! ```text
//! [1 byte has_signature][if has_signature: u16 len + signature][u16 len + ciphertext]
//! ```
//!
//! The signature, when present, is computed over the ciphertext and not over the plaintext.
use thiserror::Error;

use crate::codec::{CodecError, Reader, Writer};

/// Encrypted and optionally signed wire frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub signature: Option<Vec<u8>>,
    pub ciphertext: Vec<u8>,
}

impl Frame {
    pub fn new(ciphertext: Vec<u8>, signature: Option<Vec<u8>>) -> Self {
        Self {
            signature,
            ciphertext,
        }
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        let mut writer = Writer::new();
        match &self.signature {
            Some(signature) => {
                writer.write_byte(1).write_bytes(signature)?;
            }
            None => {
                writer.write_byte(0);
            }
        }
        writer.write_bytes(&self.ciphertext)?;
        Ok(writer.finish())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        let mut reader = Reader::new(bytes);

        let signature = match reader.read_byte()? {
            0 => None,
            1 => Some(reader.read_bytes()?),
            flag => return Err(FrameError::InvalidSignatureFlag(flag)),
        };
        let ciphertext = reader.read_bytes()?;

        if !reader.is_empty() {
            return Err(FrameError::TrailingBytes(reader.remaining()));
        }

        Ok(Self {
            signature,
            ciphertext,
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("invalid signature flag {0}")]
    InvalidSignatureFlag(u8),

    #[error("{0} unexpected bytes after end of frame")]
    TrailingBytes(usize),
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! Marker of the last frame which was processed, used to resume after reconnects.
use thiserror::Error;

use crate::codec::{CodecError, Reader, Writer};
use crate::hash::{HASH_LEN, Hash};
use crate::time::Timestamp;

/// Timestamp and hash of the last protocol frame which was successfully processed, inbound or
/// outbound.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    timestamp: Timestamp,
    hash: Hash,
}

impl Checkpoint {
    pub fn new(timestamp: Timestamp, hash: Hash) -> Self {
        Self { timestamp, hash }
    }

    /// Checkpoint for the given raw frame bytes.
    pub fn from_frame(timestamp: Timestamp, frame: &[u8]) -> Self {
        Self::new(timestamp, Hash::new(frame))
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    /// Replaces the current checkpoint unless the candidate is older or the same.
    ///
    /// Frames the relay received within the same millisecond share a timestamp, the one processed
    /// last wins. Returns `true` if the checkpoint was updated.
    pub fn advance(current: &mut Option<Checkpoint>, candidate: Checkpoint) -> bool {
        match current {
            Some(existing) if candidate.timestamp < existing.timestamp => false,
            Some(existing) if *existing == candidate => false,
            _ => {
                *current = Some(candidate);
                true
            }
        }
    }

    /// Encodes an optional checkpoint for persistence.
    ///
    /// An absent checkpoint is encoded as an empty buffer, otherwise as an 8-byte timestamp
    /// followed by the 32-byte hash.
    pub fn export(checkpoint: Option<&Checkpoint>) -> Vec<u8> {
        let Some(checkpoint) = checkpoint else {
            return Vec::new();
        };
        let mut writer = Writer::new();
        writer
            .write_uint64(checkpoint.timestamp)
            .write_raw(checkpoint.hash.as_bytes());
        writer.finish()
    }

    pub fn import(bytes: &[u8]) -> Result<Option<Checkpoint>, CheckpointError> {
        if bytes.is_empty() {
            return Ok(None);
        }
        let mut reader = Reader::new(bytes);
        let timestamp = reader.read_uint64()?;
        let hash = Hash::try_from(reader.read_raw(HASH_LEN)?)
            .map_err(|_| CheckpointError::InvalidHash)?;
        if !reader.is_empty() {
            return Err(CheckpointError::TrailingBytes(reader.remaining()));
        }
        Ok(Some(Checkpoint::new(timestamp, hash)))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CheckpointError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("invalid checkpoint hash")]
    InvalidHash,

    #[error("{0} unexpected bytes after end of checkpoint")]
    TrailingBytes(usize),
}

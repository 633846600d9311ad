// SPDX-License-Identifier: MIT OR Apache-2.0

//! Binary format of the relay's message history response.
//!
//! ```text
//! [u16 count][per entry: u64 timestamp, u16 len + payload]
//! ```
use crate::codec::{CodecError, Reader, Writer};
use crate::time::Timestamp;

/// Raw frame as stored by the relay, together with the time it was received there.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryEntry {
    pub timestamp: Timestamp,
    pub payload: Vec<u8>,
}

impl HistoryEntry {
    pub fn new(timestamp: Timestamp, payload: Vec<u8>) -> Self {
        Self { timestamp, payload }
    }
}

pub fn decode_history(bytes: &[u8]) -> Result<Vec<HistoryEntry>, CodecError> {
    let mut reader = Reader::new(bytes);
    let count = reader.read_uint16()?;

    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let timestamp = reader.read_uint64()?;
        let payload = reader.read_bytes()?;
        entries.push(HistoryEntry { timestamp, payload });
    }

    Ok(entries)
}

pub fn encode_history(entries: &[HistoryEntry]) -> Result<Vec<u8>, CodecError> {
    let count =
        u16::try_from(entries.len()).map_err(|_| CodecError::LengthOverflow(entries.len()))?;

    let mut writer = Writer::new();
    writer.write_uint16(count);
    for entry in entries {
        writer.write_uint64(entry.timestamp);
        writer.write_bytes(&entry.payload)?;
    }

    Ok(writer.finish())
}

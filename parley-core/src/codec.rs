// SPDX-License-Identifier: MIT OR Apache-2.0

//! Length-prefixed binary writer and reader.
//!
//! Every variable-length field is prefixed with its length as a big-endian `u16` unless the
//! caller explicitly writes it "raw" (fixed-size contexts or "remainder of buffer" fields) or
//! "long" with a `u64` prefix for containers which can outgrow 16 bits. All numeric fields are
//! encoded big-endian.
//!
//! The [`Writer`] collects typed operations together with a running size estimate and
//! materialises them into one contiguous buffer in a single allocation when [`Writer::finish`] is
//! called. The [`Reader`] is a forward-only cursor over a byte slice.
use thiserror::Error;

/// Largest value a 2-byte length prefix can hold.
pub const MAX_LENGTH_PREFIX: usize = u16::MAX as usize;

/// Size of a length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Size of a long length prefix in bytes.
pub const LONG_LENGTH_PREFIX_SIZE: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Op {
    Byte(u8),
    Uint16(u16),
    Uint64(u64),
    Bytes { bytes: Vec<u8>, prefix: Prefix },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Prefix {
    None,
    Short,
    Long,
}

impl Prefix {
    fn size(self) -> usize {
        match self {
            Prefix::None => 0,
            Prefix::Short => LENGTH_PREFIX_SIZE,
            Prefix::Long => LONG_LENGTH_PREFIX_SIZE,
        }
    }
}

impl Op {
    fn size(&self) -> usize {
        match self {
            Op::Byte(_) => 1,
            Op::Uint16(_) => 2,
            Op::Uint64(_) => 8,
            Op::Bytes { bytes, prefix } => prefix.size() + bytes.len(),
        }
    }

    fn write_into(self, buf: &mut Vec<u8>) {
        match self {
            Op::Byte(value) => buf.push(value),
            Op::Uint16(value) => buf.extend_from_slice(&value.to_be_bytes()),
            Op::Uint64(value) => buf.extend_from_slice(&value.to_be_bytes()),
            Op::Bytes { bytes, prefix } => {
                match prefix {
                    Prefix::None => (),
                    // Length was checked when the operation was queued.
                    Prefix::Short => buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes()),
                    Prefix::Long => buf.extend_from_slice(&(bytes.len() as u64).to_be_bytes()),
                }
                buf.extend_from_slice(&bytes);
            }
        }
    }
}

/// Accumulates typed write operations and turns them into one buffer.
#[derive(Clone, Debug, Default)]
pub struct Writer {
    ops: Vec<Op>,
    size: usize,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes the finished buffer will have.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn write_byte(&mut self, value: u8) -> &mut Self {
        self.push(Op::Byte(value))
    }

    pub fn write_uint16(&mut self, value: u16) -> &mut Self {
        self.push(Op::Uint16(value))
    }

    pub fn write_uint64(&mut self, value: u64) -> &mut Self {
        self.push(Op::Uint64(value))
    }

    /// Writes a length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) -> Result<&mut Self, CodecError> {
        self.write_bytes(value.as_bytes())
    }

    /// Writes a length-prefixed byte buffer.
    pub fn write_bytes(&mut self, value: &[u8]) -> Result<&mut Self, CodecError> {
        if value.len() > MAX_LENGTH_PREFIX {
            return Err(CodecError::LengthOverflow(value.len()));
        }

        Ok(self.push(Op::Bytes {
            bytes: value.to_vec(),
            prefix: Prefix::Short,
        }))
    }

    /// Writes a byte buffer with an 8-byte length prefix.
    pub fn write_bytes_long(&mut self, value: &[u8]) -> &mut Self {
        self.push(Op::Bytes {
            bytes: value.to_vec(),
            prefix: Prefix::Long,
        })
    }

    /// Writes bytes without a length prefix.
    ///
    /// Only use this for fixed-size fields or for the last field of a buffer which extends to its
    /// end.
    pub fn write_raw(&mut self, value: &[u8]) -> &mut Self {
        self.push(Op::Bytes {
            bytes: value.to_vec(),
            prefix: Prefix::None,
        })
    }

    /// Materialises all queued operations into one buffer.
    pub fn finish(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size);
        for op in self.ops {
            op.write_into(&mut buf);
        }
        debug_assert_eq!(buf.len(), self.size);
        buf
    }

    fn push(&mut self, op: Op) -> &mut Self {
        self.size += op.size();
        self.ops.push(op);
        self
    }
}

/// Forward-only cursor over a byte buffer.
#[derive(Clone, Debug)]
pub struct Reader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    /// Number of bytes which have not been read yet.
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.position
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_byte(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_uint16(&mut self) -> Result<u16, CodecError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_uint64(&mut self) -> Result<u64, CodecError> {
        let mut out = [0u8; 8];
        out.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(out))
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
    }

    /// Reads a length-prefixed byte buffer.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.read_uint16()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Reads a byte buffer with an 8-byte length prefix.
    pub fn read_bytes_long(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.read_uint64()?;
        let len = usize::try_from(len).unwrap_or(usize::MAX);
        Ok(self.take(len)?.to_vec())
    }

    /// Reads exactly `len` bytes without a length prefix.
    pub fn read_raw(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        self.take(len)
    }

    /// Reads everything up to the end of the buffer.
    pub fn read_remaining(&mut self) -> &'a [u8] {
        let rest = &self.bytes[self.position..];
        self.position = self.bytes.len();
        rest
    }

    /// Reads everything up to the end of the buffer as an UTF-8 string.
    pub fn read_remaining_string(&mut self) -> Result<String, CodecError> {
        String::from_utf8(self.read_remaining().to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < len {
            return Err(CodecError::OutOfBounds {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let slice = &self.bytes[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("tried to read {needed} bytes but only {remaining} remain")]
    OutOfBounds { needed: usize, remaining: usize },

    #[error("value of {0} bytes exceeds the maximum length prefix of {max}", max = MAX_LENGTH_PREFIX)]
    LengthOverflow(usize),

    #[error("bytes are not valid utf-8")]
    InvalidUtf8,
}

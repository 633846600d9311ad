// SPDX-License-Identifier: MIT OR Apache-2.0

//! `parley-core` contains the data types every other parley crate speaks: a length-prefixed
//! binary codec, the plaintext layouts of all protocol messages, the encrypted frame format they
//! travel in, the relay's history response format and the checkpoint used to resume a session
//! after a reconnect.
//!
//! None of these types perform any cryptography. Encryption, signing and key management live in
//! `parley-encryption`, the protocol and chat orchestration in `parley-client`.
pub mod checkpoint;
pub mod codec;
pub mod frame;
pub mod hash;
pub mod history;
pub mod message;
pub mod time;

pub use checkpoint::{Checkpoint, CheckpointError};
pub use codec::{CodecError, Reader, Writer};
pub use frame::{Frame, FrameError};
pub use hash::{Hash, HashError};
pub use history::{HistoryEntry, decode_history, encode_history};
pub use message::{MessageError, ProtocolMessage};
pub use time::{Timestamp, now_millis};

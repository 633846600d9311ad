// SPDX-License-Identifier: MIT OR Apache-2.0

//! Plaintext protocol messages and their fixed binary layouts.
//!
//! These are the payloads which get encrypted before they travel inside a [`Frame`]. They are
//! never observed on the wire unencrypted.
//!
//! The first byte of every layout is a message-type tag:
//!
//! ```text
//! 0  message                  text (UTF-8, remainder of buffer)
//! 1  connection request       u16 len + ECDH SPKI, u16 len + RSA SPKI, display name (remainder)
//! 2  connection status        status byte:
//!                               0 accept       ECDH SPKI (remainder)
//!                               1 decline      -
//!                               2 established  -
//! ```
//!
//! [`Frame`]: crate::Frame
use thiserror::Error;

use crate::codec::{CodecError, Reader, Writer};

const TAG_MESSAGE: u8 = 0;
const TAG_CONNECTION_REQUEST: u8 = 1;
const TAG_CONNECTION_STATUS: u8 = 2;

const STATUS_ACCEPT: u8 = 0;
const STATUS_DECLINE: u8 = 1;
const STATUS_ESTABLISHED: u8 = 2;

/// Plaintext payload exchanged between two peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtocolMessage {
    /// Chat message inside an established session.
    Message { text: String },

    /// Initial request to connect, sent towards a published key of the other peer.
    ConnectionRequest {
        from_name: String,
        /// Initiator's ECDH P-256 public key (SPKI).
        ecdh_public_key: Vec<u8>,
        /// RSA-OAEP public key (SPKI) of the dedicated response channel for this request.
        response_rsa_public_key: Vec<u8>,
    },

    /// Peer accepted our request, carrying their freshly generated ECDH public key (SPKI).
    ConnectionRequestAccept { ecdh_public_key: Vec<u8> },

    /// Peer declined our request.
    ConnectionRequestDecline,

    /// Handshake acknowledgement sent under the derived session keys.
    ConnectionEstablished,
}

impl ProtocolMessage {
    /// Human-readable name of the message type, used for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolMessage::Message { .. } => "message",
            ProtocolMessage::ConnectionRequest { .. } => "connection_request",
            ProtocolMessage::ConnectionRequestAccept { .. } => "connection_request_accept",
            ProtocolMessage::ConnectionRequestDecline => "connection_request_decline",
            ProtocolMessage::ConnectionEstablished => "connection_established",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        let mut writer = Writer::new();

        match self {
            ProtocolMessage::Message { text } => {
                writer.write_byte(TAG_MESSAGE).write_raw(text.as_bytes());
            }
            ProtocolMessage::ConnectionRequest {
                from_name,
                ecdh_public_key,
                response_rsa_public_key,
            } => {
                writer.write_byte(TAG_CONNECTION_REQUEST);
                writer.write_bytes(ecdh_public_key)?;
                writer.write_bytes(response_rsa_public_key)?;
                writer.write_raw(from_name.as_bytes());
            }
            ProtocolMessage::ConnectionRequestAccept { ecdh_public_key } => {
                writer
                    .write_byte(TAG_CONNECTION_STATUS)
                    .write_byte(STATUS_ACCEPT)
                    .write_raw(ecdh_public_key);
            }
            ProtocolMessage::ConnectionRequestDecline => {
                writer
                    .write_byte(TAG_CONNECTION_STATUS)
                    .write_byte(STATUS_DECLINE);
            }
            ProtocolMessage::ConnectionEstablished => {
                writer
                    .write_byte(TAG_CONNECTION_STATUS)
                    .write_byte(STATUS_ESTABLISHED);
            }
        }

        Ok(writer.finish())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        let mut reader = Reader::new(bytes);

        let message = match reader.read_byte()? {
            TAG_MESSAGE => ProtocolMessage::Message {
                text: reader.read_remaining_string()?,
            },
            TAG_CONNECTION_REQUEST => {
                let ecdh_public_key = reader.read_bytes()?;
                let response_rsa_public_key = reader.read_bytes()?;
                let from_name = reader.read_remaining_string()?;
                ProtocolMessage::ConnectionRequest {
                    from_name,
                    ecdh_public_key,
                    response_rsa_public_key,
                }
            }
            TAG_CONNECTION_STATUS => match reader.read_byte()? {
                STATUS_ACCEPT => {
                    let ecdh_public_key = reader.read_remaining().to_vec();
                    if ecdh_public_key.is_empty() {
                        return Err(MessageError::MissingKey);
                    }
                    ProtocolMessage::ConnectionRequestAccept { ecdh_public_key }
                }
                STATUS_DECLINE => ProtocolMessage::ConnectionRequestDecline,
                STATUS_ESTABLISHED => ProtocolMessage::ConnectionEstablished,
                status => return Err(MessageError::UnknownStatus(status)),
            },
            tag => return Err(MessageError::UnknownTag(tag)),
        };

        if !reader.is_empty() {
            return Err(MessageError::TrailingBytes(reader.remaining()));
        }

        Ok(message)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("unknown message type tag {0}")]
    UnknownTag(u8),

    #[error("unknown connection request status {0}")]
    UnknownStatus(u8),

    #[error("connection request accept is missing the ecdh public key")]
    MissingKey,

    #[error("{0} unexpected bytes after end of message")]
    TrailingBytes(usize),
}

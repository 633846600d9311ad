// SPDX-License-Identifier: MIT OR Apache-2.0

//! Handshake state machine turning a published key into a shared symmetric session.
//!
//! Every relationship to another peer is one [`ConnectionEntry`] in one of four states:
//!
//! ```text
//! initiator:  requested ──confirm──> pre-established ──finish──> established
//! acceptor:   pending   ──accept───> pre-established ──finish──> established
//! ```
//!
//! 1. The initiator generates an ECDH key pair for the session and an RSA key pair as a dedicated
//!    response channel for this request only. It sends a `connectionRequest` encrypted towards
//!    the published key of the other peer.
//! 2. The acceptor stores the received public keys in a pending entry until the user decides. On
//!    accept it generates its own ECDH key pair, derives the session keys and answers over the
//!    response channel with its ECDH public key. On decline it answers with a decline and forgets
//!    the entry.
//! 3. The initiator derives the same session keys and sends `connectionEstablished` encrypted with
//!    the AES key and signed with the HMAC key.
//! 4. The acceptor finishes and echoes `connectionEstablished`, so both sides observe the final
//!    transition through an authenticated message.
//!
//! All transitions are pure: they take the current entry and return a new one together with the
//! message which needs to be sent, leaving persistence and delivery to the caller. A transition
//! invoked in the wrong state fails with [`ConnectionError::InvalidState`].
use std::sync::Arc;

use parley_core::{CodecError, ProtocolMessage, Reader, Timestamp, Writer};
use thiserror::Error;
use tracing::{debug, error};

use crate::crypto::CryptoError;
use crate::crypto::aes::{AES_KEY_SIZE, AesKey};
use crate::crypto::ecdh::{EcdhPublicKey, EcdhSecretKey, SessionKeys, derive_session_keys};
use crate::crypto::hmac::{HMAC_KEY_SIZE, HmacKey};
use crate::crypto::rsa::{RsaKeyPair, RsaPublicKey};
use crate::id::{KEY_ID_SIZE, KeyId, KeyIdError};
use crate::key_index::{KeysIndex, SignsIndex};

const STATE_REQUESTED: u8 = 0;
const STATE_PENDING: u8 = 1;
const STATE_PRE_ESTABLISHED: u8 = 2;
const STATE_ESTABLISHED: u8 = 3;

/// Which side of the handshake we were on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Acceptor,
}

impl Role {
    fn to_byte(self) -> u8 {
        match self {
            Role::Initiator => 0,
            Role::Acceptor => 1,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, ConnectionError> {
        match byte {
            0 => Ok(Role::Initiator),
            1 => Ok(Role::Acceptor),
            byte => Err(ConnectionError::UnknownRole(byte)),
        }
    }
}

/// Derived key material of a (pre-)established session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub role: Role,
    pub keys: SessionKeys,
    /// Time when this session entered its current state.
    pub since: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// We initiated and wait for the other peer to accept or decline.
    Requested {
        ecdh_secret_key: EcdhSecretKey,
        response_key_pair: RsaKeyPair,
        created_at: Timestamp,
    },

    /// Other peer initiated and waits for our decision.
    Pending {
        their_ecdh_public_key: EcdhPublicKey,
        their_response_key: RsaPublicKey,
        from_name: String,
        registered_at: Timestamp,
    },

    /// Session keys are derived, waiting for the final acknowledgement.
    PreEstablished(Session),

    /// Fully usable for messaging.
    Established(Session),
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Requested { .. } => "requested",
            ConnectionState::Pending { .. } => "pending",
            ConnectionState::PreEstablished(_) => "pre-established",
            ConnectionState::Established(_) => "established",
        }
    }
}

/// One relationship with another peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionEntry {
    id: KeyId,
    state: ConnectionState,
}

// Transitions.

impl ConnectionEntry {
    /// Starts a new handshake as the initiator.
    ///
    /// Returns the new entry in `requested` state and the connection request which needs to be
    /// encrypted towards the published key of the other peer.
    pub fn initiate(
        from_name: &str,
        rsa_modulus_bits: usize,
        now: Timestamp,
    ) -> Result<(Self, ProtocolMessage), ConnectionError> {
        let ecdh_secret_key = EcdhSecretKey::generate();
        let response_key_pair = RsaKeyPair::generate(rsa_modulus_bits)?;

        let message = ProtocolMessage::ConnectionRequest {
            from_name: from_name.to_owned(),
            ecdh_public_key: ecdh_secret_key.public_key().to_spki()?,
            response_rsa_public_key: response_key_pair.public_key().to_spki()?,
        };

        let entry = Self {
            id: KeyId::random(),
            state: ConnectionState::Requested {
                ecdh_secret_key,
                response_key_pair,
                created_at: now,
            },
        };
        debug!(id = %entry.id, "initiated connection");

        Ok((entry, message))
    }

    /// Creates a pending entry from a received connection request.
    pub fn receive_request(
        from_name: &str,
        ecdh_public_key: &[u8],
        response_rsa_public_key: &[u8],
        now: Timestamp,
    ) -> Result<Self, ConnectionError> {
        let entry = Self {
            id: KeyId::random(),
            state: ConnectionState::Pending {
                their_ecdh_public_key: EcdhPublicKey::from_spki(ecdh_public_key)?,
                their_response_key: RsaPublicKey::from_spki(response_rsa_public_key)?,
                from_name: from_name.to_owned(),
                registered_at: now,
            },
        };
        debug!(id = %entry.id, from_name, "received connection request");
        Ok(entry)
    }

    /// Accepts a pending request and derives the session keys.
    ///
    /// Returns the pre-established entry, the accept message and the response channel key it
    /// needs to be encrypted with.
    pub fn accept(
        &self,
        now: Timestamp,
    ) -> Result<(Self, ProtocolMessage, RsaPublicKey), ConnectionError> {
        let ConnectionState::Pending {
            their_ecdh_public_key,
            their_response_key,
            ..
        } = &self.state
        else {
            return Err(self.invalid_state("pending"));
        };

        let our_secret_key = EcdhSecretKey::generate();
        let keys = derive_session_keys(their_ecdh_public_key, &our_secret_key)?;

        let message = ProtocolMessage::ConnectionRequestAccept {
            ecdh_public_key: our_secret_key.public_key().to_spki()?,
        };

        let entry = Self {
            id: self.id,
            state: ConnectionState::PreEstablished(Session {
                role: Role::Acceptor,
                keys,
                since: now,
            }),
        };
        debug!(id = %self.id, "accepted connection");

        Ok((entry, message, their_response_key.clone()))
    }

    /// Declines a pending request.
    ///
    /// The entry ceases to exist, only the decline message and the response channel key it needs
    /// to be encrypted with are returned.
    pub fn decline(&self) -> Result<(ProtocolMessage, RsaPublicKey), ConnectionError> {
        let ConnectionState::Pending {
            their_response_key, ..
        } = &self.state
        else {
            return Err(self.invalid_state("pending"));
        };
        debug!(id = %self.id, "declined connection");
        Ok((
            ProtocolMessage::ConnectionRequestDecline,
            their_response_key.clone(),
        ))
    }

    /// Derives the session keys after the other peer accepted our request.
    ///
    /// Returns the pre-established entry and the `connectionEstablished` message which needs to be
    /// encrypted and signed with the new session keys.
    pub fn confirm(
        &self,
        their_ecdh_public_key: &[u8],
        now: Timestamp,
    ) -> Result<(Self, ProtocolMessage), ConnectionError> {
        let ConnectionState::Requested {
            ecdh_secret_key, ..
        } = &self.state
        else {
            return Err(self.invalid_state("requested"));
        };

        let their_ecdh_public_key = EcdhPublicKey::from_spki(their_ecdh_public_key)?;
        let keys = derive_session_keys(&their_ecdh_public_key, ecdh_secret_key)?;

        let entry = Self {
            id: self.id,
            state: ConnectionState::PreEstablished(Session {
                role: Role::Initiator,
                keys,
                since: now,
            }),
        };
        debug!(id = %self.id, "confirmed connection");

        Ok((entry, ProtocolMessage::ConnectionEstablished))
    }

    /// Completes the handshake after receiving `connectionEstablished`.
    ///
    /// The acceptor additionally returns a `connectionEstablished` echo which needs to be sent
    /// back under the session keys.
    pub fn finish(
        &self,
        now: Timestamp,
    ) -> Result<(Self, Option<ProtocolMessage>), ConnectionError> {
        let ConnectionState::PreEstablished(session) = &self.state else {
            return Err(self.invalid_state("pre-established"));
        };

        let echo = match session.role {
            Role::Acceptor => Some(ProtocolMessage::ConnectionEstablished),
            Role::Initiator => None,
        };

        let entry = Self {
            id: self.id,
            state: ConnectionState::Established(Session {
                role: session.role,
                keys: session.keys.clone(),
                since: now,
            }),
        };
        debug!(id = %self.id, role = ?session.role, "established connection");

        Ok((entry, echo))
    }

    fn invalid_state(&self, expected: &'static str) -> ConnectionError {
        let actual = self.state.name();
        error!(id = %self.id, expected, actual, "connection operation called in invalid state");
        ConnectionError::InvalidState { expected, actual }
    }
}

// Accessors and predicates.

impl ConnectionEntry {
    pub fn id(&self) -> KeyId {
        self.id
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_requested(&self) -> bool {
        matches!(self.state, ConnectionState::Requested { .. })
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, ConnectionState::Pending { .. })
    }

    pub fn is_pre_established(&self) -> bool {
        matches!(self.state, ConnectionState::PreEstablished(_))
    }

    pub fn is_established(&self) -> bool {
        matches!(self.state, ConnectionState::Established(_))
    }

    /// Display name of the peer who sent us a pending request.
    pub fn from_name(&self) -> Option<&str> {
        match &self.state {
            ConnectionState::Pending { from_name, .. } => Some(from_name),
            _ => None,
        }
    }

    /// Session keys of a pre-established or established connection.
    pub fn session_keys(&self) -> Option<&SessionKeys> {
        match &self.state {
            ConnectionState::PreEstablished(session) | ConnectionState::Established(session) => {
                Some(&session.keys)
            }
            _ => None,
        }
    }
}

// Key registration.

impl ConnectionEntry {
    /// Registers the key material of the current state in the indexes.
    ///
    /// A requested connection decrypts the answer arriving on its response channel. Sessions
    /// decrypt with their AES key and expect every frame to be signed with their HMAC key. Pending
    /// connections hold no decryption material.
    pub fn register(&self, keys: &KeysIndex, signs: &SignsIndex) {
        match &self.state {
            ConnectionState::Requested {
                response_key_pair, ..
            } => {
                keys.add(self.id, Arc::new(response_key_pair.clone()));
                signs.remove(&self.id);
            }
            ConnectionState::Pending { .. } => {
                keys.remove(&self.id);
                signs.remove(&self.id);
            }
            ConnectionState::PreEstablished(session) | ConnectionState::Established(session) => {
                keys.add(self.id, Arc::new(session.keys.aes.clone()));
                signs.add(self.id, Arc::new(session.keys.hmac.clone()));
            }
        }
    }

    /// Removes all key material of this connection from the indexes.
    pub fn unregister(&self, keys: &KeysIndex, signs: &SignsIndex) {
        keys.remove(&self.id);
        signs.remove(&self.id);
    }
}

// Persistence.

impl ConnectionEntry {
    fn write(&self, writer: &mut Writer) -> Result<(), ConnectionError> {
        writer.write_raw(self.id.as_bytes());

        match &self.state {
            ConnectionState::Requested {
                ecdh_secret_key,
                response_key_pair,
                created_at,
            } => {
                writer.write_byte(STATE_REQUESTED).write_uint64(*created_at);
                writer.write_bytes(&ecdh_secret_key.to_pkcs8()?)?;
                writer.write_bytes(&response_key_pair.to_pkcs8()?)?;
            }
            ConnectionState::Pending {
                their_ecdh_public_key,
                their_response_key,
                from_name,
                registered_at,
            } => {
                writer.write_byte(STATE_PENDING).write_uint64(*registered_at);
                writer.write_bytes(&their_ecdh_public_key.to_spki()?)?;
                writer.write_bytes(&their_response_key.to_spki()?)?;
                writer.write_string(from_name)?;
            }
            ConnectionState::PreEstablished(session) => {
                writer.write_byte(STATE_PRE_ESTABLISHED);
                write_session(writer, session);
            }
            ConnectionState::Established(session) => {
                writer.write_byte(STATE_ESTABLISHED);
                write_session(writer, session);
            }
        }

        Ok(())
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, ConnectionError> {
        let id = KeyId::try_from(reader.read_raw(KEY_ID_SIZE)?)?;

        let state = match reader.read_byte()? {
            STATE_REQUESTED => {
                let created_at = reader.read_uint64()?;
                let ecdh_secret_key = EcdhSecretKey::from_pkcs8(&reader.read_bytes()?)?;
                let response_key_pair = RsaKeyPair::from_pkcs8(&reader.read_bytes()?)?;
                ConnectionState::Requested {
                    ecdh_secret_key,
                    response_key_pair,
                    created_at,
                }
            }
            STATE_PENDING => {
                let registered_at = reader.read_uint64()?;
                let their_ecdh_public_key = EcdhPublicKey::from_spki(&reader.read_bytes()?)?;
                let their_response_key = RsaPublicKey::from_spki(&reader.read_bytes()?)?;
                let from_name = reader.read_string()?;
                ConnectionState::Pending {
                    their_ecdh_public_key,
                    their_response_key,
                    from_name,
                    registered_at,
                }
            }
            STATE_PRE_ESTABLISHED => ConnectionState::PreEstablished(read_session(reader)?),
            STATE_ESTABLISHED => ConnectionState::Established(read_session(reader)?),
            tag => return Err(ConnectionError::UnknownState(tag)),
        };

        Ok(Self { id, state })
    }
}

fn write_session(writer: &mut Writer, session: &Session) {
    writer
        .write_byte(session.role.to_byte())
        .write_uint64(session.since)
        .write_raw(&session.keys.aes.to_bytes())
        .write_raw(&session.keys.hmac.to_bytes());
}

fn read_session(reader: &mut Reader<'_>) -> Result<Session, ConnectionError> {
    let role = Role::from_byte(reader.read_byte()?)?;
    let since = reader.read_uint64()?;
    let aes = AesKey::try_from_slice(reader.read_raw(AES_KEY_SIZE)?)?;
    let hmac = HmacKey::try_from_slice(reader.read_raw(HMAC_KEY_SIZE)?)?;
    Ok(Session {
        role,
        keys: SessionKeys { aes, hmac },
        since,
    })
}

/// Encodes all connections for the local store.
pub fn export_connections<'a>(
    entries: impl ExactSizeIterator<Item = &'a ConnectionEntry>,
) -> Result<Vec<u8>, ConnectionError> {
    let count =
        u16::try_from(entries.len()).map_err(|_| ConnectionError::TooMany(entries.len()))?;
    let mut writer = Writer::new();
    writer.write_uint16(count);
    for entry in entries {
        entry.write(&mut writer)?;
    }
    Ok(writer.finish())
}

/// Decodes connections which were encoded with [`export_connections`].
pub fn import_connections(bytes: &[u8]) -> Result<Vec<ConnectionEntry>, ConnectionError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }

    let mut reader = Reader::new(bytes);
    let count = reader.read_uint16()?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        entries.push(ConnectionEntry::read(&mut reader)?);
    }

    if !reader.is_empty() {
        return Err(ConnectionError::TrailingBytes(reader.remaining()));
    }

    Ok(entries)
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection is {actual} but operation requires it to be {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    KeyId(#[from] KeyIdError),

    #[error("unknown connection state tag {0}")]
    UnknownState(u8),

    #[error("unknown handshake role {0}")]
    UnknownRole(u8),

    #[error("can not export more than {max} connections, got {0}", max = u16::MAX)]
    TooMany(usize),

    #[error("{0} unexpected bytes after end of connections")]
    TrailingBytes(usize),
}

#[cfg(test)]
mod tests {
    use parley_core::ProtocolMessage;

    use crate::key_index::{KeysIndex, SignsIndex};
    use crate::test_utils::TEST_RSA_MODULUS_BITS;
    use crate::traits::{Encrypt, Sign};

    use super::{
        ConnectionEntry, ConnectionError, ConnectionState, Role, export_connections,
        import_connections,
    };

    /// Runs both sides of the handshake up to the pre-established state.
    fn pre_established() -> (ConnectionEntry, ConnectionEntry) {
        let (alice, request) =
            ConnectionEntry::initiate("Alice", TEST_RSA_MODULUS_BITS, 1).unwrap();
        let ProtocolMessage::ConnectionRequest {
            from_name,
            ecdh_public_key,
            response_rsa_public_key,
        } = request
        else {
            panic!("expected connection request");
        };
        assert_eq!(from_name, "Alice");

        let bob =
            ConnectionEntry::receive_request(&from_name, &ecdh_public_key, &response_rsa_public_key, 2)
                .unwrap();
        assert!(bob.is_pending());
        assert_eq!(bob.from_name(), Some("Alice"));

        let (bob, accept, _) = bob.accept(3).unwrap();
        let ProtocolMessage::ConnectionRequestAccept { ecdh_public_key } = accept else {
            panic!("expected accept");
        };

        let (alice, established) = alice.confirm(&ecdh_public_key, 4).unwrap();
        assert_eq!(established, ProtocolMessage::ConnectionEstablished);

        (alice, bob)
    }

    #[test]
    fn handshake_derives_identical_keys() {
        let (alice, bob) = pre_established();
        assert!(alice.is_pre_established());
        assert!(bob.is_pre_established());

        // The acceptor echoes the acknowledgement, the initiator does not.
        let (bob, echo) = bob.finish(5).unwrap();
        assert_eq!(echo, Some(ProtocolMessage::ConnectionEstablished));
        let (alice, echo) = alice.finish(6).unwrap();
        assert_eq!(echo, None);

        assert!(alice.is_established());
        assert!(bob.is_established());
        assert_eq!(alice.session_keys(), bob.session_keys());

        let ConnectionState::Established(session) = alice.state() else {
            panic!("expected established");
        };
        assert_eq!(session.role, Role::Initiator);
        assert_eq!(session.since, 6);
    }

    #[test]
    fn invalid_state_transitions() {
        let (requested, _) = ConnectionEntry::initiate("Alice", TEST_RSA_MODULUS_BITS, 1).unwrap();

        assert!(matches!(
            requested.accept(2),
            Err(ConnectionError::InvalidState {
                expected: "pending",
                actual: "requested"
            })
        ));
        assert!(matches!(
            requested.decline(),
            Err(ConnectionError::InvalidState { .. })
        ));
        assert!(matches!(
            requested.finish(2),
            Err(ConnectionError::InvalidState {
                expected: "pre-established",
                actual: "requested"
            })
        ));

        let (alice, bob) = pre_established();
        assert!(matches!(
            alice.confirm(&[0; 91], 5),
            Err(ConnectionError::InvalidState { .. })
        ));
        let (bob, _) = bob.finish(5).unwrap();
        assert!(matches!(
            bob.finish(6),
            Err(ConnectionError::InvalidState {
                expected: "pre-established",
                actual: "established"
            })
        ));
    }

    #[test]
    fn malformed_request_keys() {
        assert!(matches!(
            ConnectionEntry::receive_request("Mallory", &[1, 2, 3], &[4, 5, 6], 1),
            Err(ConnectionError::Crypto(_))
        ));

        let (alice, _) = ConnectionEntry::initiate("Alice", TEST_RSA_MODULUS_BITS, 1).unwrap();
        assert!(matches!(
            alice.confirm(&[1, 2, 3], 2),
            Err(ConnectionError::Crypto(_))
        ));
    }

    #[tokio::test]
    async fn registered_material_follows_state() {
        let keys = KeysIndex::new();
        let signs = SignsIndex::new();

        let (alice, request) = ConnectionEntry::initiate("Alice", TEST_RSA_MODULUS_BITS, 1).unwrap();
        alice.register(&keys, &signs);
        assert!(keys.contains(&alice.id()));
        assert!(!signs.has_key(&alice.id()));

        let ProtocolMessage::ConnectionRequest {
            ecdh_public_key,
            response_rsa_public_key,
            ..
        } = request
        else {
            panic!("expected connection request");
        };
        let bob =
            ConnectionEntry::receive_request("Alice", &ecdh_public_key, &response_rsa_public_key, 2)
                .unwrap();
        bob.register(&keys, &signs);
        assert!(!keys.contains(&bob.id()));

        // Answers on the response channel reach the requested connection.
        let (bob, accept, response_key) = bob.accept(3).unwrap();
        let ciphertext = response_key.encrypt(&accept.to_bytes().unwrap()).unwrap();
        let (id, plaintext) = keys.try_decrypt(&ciphertext).await.unwrap();
        assert_eq!(id, alice.id());
        assert_eq!(ProtocolMessage::from_bytes(&plaintext).unwrap(), accept);

        bob.register(&keys, &signs);
        assert!(signs.has_key(&bob.id()));

        let keys_of_bob = bob.session_keys().unwrap();
        let ciphertext = keys_of_bob.aes.encrypt(b"hi").unwrap();
        let signature = keys_of_bob.hmac.sign(&ciphertext).unwrap();
        assert!(signs.verify(&bob.id(), &ciphertext, &signature));

        bob.unregister(&keys, &signs);
        alice.unregister(&keys, &signs);
        assert!(keys.is_empty());
        assert!(!signs.has_key(&bob.id()));
    }

    #[test]
    fn export_and_import_every_state() {
        let (requested, request) =
            ConnectionEntry::initiate("Alice", TEST_RSA_MODULUS_BITS, 1).unwrap();
        let ProtocolMessage::ConnectionRequest {
            ecdh_public_key,
            response_rsa_public_key,
            ..
        } = request
        else {
            panic!("expected connection request");
        };
        let pending =
            ConnectionEntry::receive_request("Alice", &ecdh_public_key, &response_rsa_public_key, 2)
                .unwrap();
        let (alice, bob) = pre_established();
        let (established, _) = bob.finish(5).unwrap();

        let entries = vec![requested, pending, alice, established];
        let bytes = export_connections(entries.iter()).unwrap();
        assert_eq!(import_connections(&bytes).unwrap(), entries);

        assert!(import_connections(&[]).unwrap().is_empty());
        assert!(import_connections(&bytes[..bytes.len() - 3]).is_err());

        let mut trailing = bytes.clone();
        trailing.push(0);
        assert!(matches!(
            import_connections(&trailing),
            Err(ConnectionError::TrailingBytes(1))
        ));
    }
}

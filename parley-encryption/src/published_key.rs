// SPDX-License-Identifier: MIT OR Apache-2.0

//! RSA-OAEP key pairs shared out-of-band (invite link, QR code) to receive connection requests.
use std::sync::Arc;

use parley_core::{CodecError, Reader, Timestamp, Writer};
use thiserror::Error;
use tracing::debug;

use crate::crypto::CryptoError;
use crate::crypto::rsa::{RsaKeyPair, RsaPublicKey};
use crate::id::{KEY_ID_SIZE, KeyId, KeyIdError};
use crate::key_index::KeysIndex;

/// Key pair the user has shared with others, together with a human label and usage statistics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedKey {
    id: KeyId,
    label: String,
    key_pair: RsaKeyPair,
    usage_count: u64,
    created_at: Timestamp,
}

impl PublishedKey {
    /// Generates a new published key.
    pub fn issue(
        label: &str,
        rsa_modulus_bits: usize,
        now: Timestamp,
    ) -> Result<Self, PublishedKeyError> {
        let key_pair = RsaKeyPair::generate(rsa_modulus_bits)?;
        let key = Self {
            id: KeyId::random(),
            label: label.to_owned(),
            key_pair,
            usage_count: 0,
            created_at: now,
        };
        debug!(id = %key.id, label, "issued published key");
        Ok(key)
    }

    pub fn id(&self) -> KeyId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Public half which gets shared with others.
    pub fn public_key(&self) -> &RsaPublicKey {
        self.key_pair.public_key()
    }

    /// Number of connection requests received through this key.
    pub fn usage_count(&self) -> u64 {
        self.usage_count
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn increment_usage(&mut self) {
        self.usage_count = self.usage_count.saturating_add(1);
    }

    /// Makes the key available for trial decryption of inbound connection requests.
    pub fn register(&self, keys: &KeysIndex) {
        keys.add(self.id, Arc::new(self.key_pair.clone()));
    }

    pub fn unregister(&self, keys: &KeysIndex) {
        keys.remove(&self.id);
    }

    fn write(&self, writer: &mut Writer) -> Result<(), PublishedKeyError> {
        writer.write_raw(self.id.as_bytes());
        writer.write_string(&self.label)?;
        writer
            .write_uint64(self.usage_count)
            .write_uint64(self.created_at);
        writer.write_bytes(&self.key_pair.to_pkcs8()?)?;
        Ok(())
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, PublishedKeyError> {
        let id = KeyId::try_from(reader.read_raw(KEY_ID_SIZE)?)?;
        let label = reader.read_string()?;
        let usage_count = reader.read_uint64()?;
        let created_at = reader.read_uint64()?;
        let key_pair = RsaKeyPair::from_pkcs8(&reader.read_bytes()?)?;
        Ok(Self {
            id,
            label,
            key_pair,
            usage_count,
            created_at,
        })
    }
}

/// Encodes all published keys for the local store.
pub fn export_published_keys<'a>(
    keys: impl ExactSizeIterator<Item = &'a PublishedKey>,
) -> Result<Vec<u8>, PublishedKeyError> {
    let count = u16::try_from(keys.len()).map_err(|_| PublishedKeyError::TooMany(keys.len()))?;
    let mut writer = Writer::new();
    writer.write_uint16(count);
    for key in keys {
        key.write(&mut writer)?;
    }
    Ok(writer.finish())
}

/// Decodes published keys which were encoded with [`export_published_keys`].
pub fn import_published_keys(bytes: &[u8]) -> Result<Vec<PublishedKey>, PublishedKeyError> {
    // Nothing was ever exported.
    if bytes.is_empty() {
        return Ok(Vec::new());
    }

    let mut reader = Reader::new(bytes);
    let count = reader.read_uint16()?;
    let mut keys = Vec::with_capacity(count as usize);
    for _ in 0..count {
        keys.push(PublishedKey::read(&mut reader)?);
    }

    if !reader.is_empty() {
        return Err(PublishedKeyError::TrailingBytes(reader.remaining()));
    }

    Ok(keys)
}

#[derive(Debug, Error)]
pub enum PublishedKeyError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    KeyId(#[from] KeyIdError),

    #[error("can not export more than {max} published keys, got {0}", max = u16::MAX)]
    TooMany(usize),

    #[error("{0} unexpected bytes after end of published keys")]
    TrailingBytes(usize),
}

#[cfg(test)]
mod tests {
    use crate::key_index::KeysIndex;
    use crate::test_utils::{TEST_RSA_MODULUS_BITS, published_key};
    use crate::traits::Encrypt;

    use super::{PublishedKey, export_published_keys, import_published_keys};

    #[tokio::test]
    async fn registered_key_decrypts_requests() {
        let keys = KeysIndex::new();
        let key = published_key("Invite for Bob");
        key.register(&keys);

        let ciphertext = key.public_key().encrypt(b"request").unwrap();
        let (id, plaintext) = keys.try_decrypt(&ciphertext).await.unwrap();
        assert_eq!(id, key.id());
        assert_eq!(plaintext, b"request");

        key.unregister(&keys);
        assert!(keys.try_decrypt(&ciphertext).await.is_none());
    }

    #[test]
    fn usage_counter() {
        let mut key = PublishedKey::issue("QR code", TEST_RSA_MODULUS_BITS, 1_000).unwrap();
        assert_eq!(key.usage_count(), 0);
        key.increment_usage();
        key.increment_usage();
        assert_eq!(key.usage_count(), 2);
        assert_eq!(key.label(), "QR code");
        assert_eq!(key.created_at(), 1_000);
    }

    #[test]
    fn export_and_import() {
        let mut key_1 = published_key("first");
        key_1.increment_usage();
        let key_2 = published_key("second");

        let bytes = export_published_keys([&key_1, &key_2].into_iter()).unwrap();
        let imported = import_published_keys(&bytes).unwrap();
        assert_eq!(imported, vec![key_1, key_2]);

        assert!(import_published_keys(&[]).unwrap().is_empty());
        assert!(import_published_keys(&bytes[..bytes.len() - 1]).is_err());
    }
}

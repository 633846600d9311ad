// SPDX-License-Identifier: MIT OR Apache-2.0

//! Lookup of key material for inbound frames.
//!
//! Frames on the relay carry no recipient or sender information, so [`KeysIndex`] finds the key
//! which belongs to a ciphertext by trial: it races all registered keys against each other and the
//! first one which decrypts wins. [`SignsIndex`] holds the HMAC keys of sessions and is queried
//! explicitly by the id of the key which decrypted the frame.
//!
//! Both indexes are cheap to clone and share their state, one instance lives as long as the
//! application session and gets handed to every component which needs it.
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::task::JoinSet;
use tracing::trace;

use crate::id::KeyId;
use crate::traits::{Decrypt, Verify};

/// Registered decryption keys, addressed by the id of their owner.
#[derive(Clone, Default)]
pub struct KeysIndex {
    keys: Arc<RwLock<HashMap<KeyId, Arc<dyn Decrypt>>>>,
}

impl KeysIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a decryption key, replacing any key which was registered before under that id.
    pub fn add(&self, id: KeyId, key: Arc<dyn Decrypt>) {
        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        keys.insert(id, key);
    }

    pub fn remove(&self, id: &KeyId) -> bool {
        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        keys.remove(id).is_some()
    }

    pub fn contains(&self, id: &KeyId) -> bool {
        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        keys.contains_key(id)
    }

    pub fn len(&self) -> usize {
        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attempts to decrypt the ciphertext with every registered key concurrently.
    ///
    /// Returns the id of the first key which succeeded together with the plaintext, or `None` if
    /// no key could decrypt it. Failures of the other keys are discarded and tasks which are still
    /// running once a winner was found are abandoned.
    ///
    /// The set of keys is snapshotted before the race starts, keys added or removed concurrently
    /// do not affect an ongoing trial.
    pub async fn try_decrypt(&self, ciphertext: &[u8]) -> Option<(KeyId, Vec<u8>)> {
        let snapshot: Vec<(KeyId, Arc<dyn Decrypt>)> = {
            let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
            keys.iter().map(|(id, key)| (*id, key.clone())).collect()
        };

        if snapshot.is_empty() {
            return None;
        }

        let ciphertext: Arc<[u8]> = Arc::from(ciphertext);
        let mut race = JoinSet::new();
        for (id, key) in snapshot {
            let ciphertext = ciphertext.clone();
            race.spawn_blocking(move || {
                key.decrypt(&ciphertext)
                    .ok()
                    .map(|plaintext| (id, plaintext))
            });
        }

        while let Some(result) = race.join_next().await {
            if let Ok(Some((id, plaintext))) = result {
                trace!(%id, "trial decryption succeeded");
                // Dropping the join set abandons the remaining attempts.
                return Some((id, plaintext));
            }
        }

        None
    }
}

impl fmt::Debug for KeysIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("KeysIndex")
            .field("ids", &keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Registered signature verification keys, addressed by the id of their owner.
#[derive(Clone, Default)]
pub struct SignsIndex {
    keys: Arc<RwLock<HashMap<KeyId, Arc<dyn Verify>>>>,
}

impl SignsIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, id: KeyId, key: Arc<dyn Verify>) {
        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        keys.insert(id, key);
    }

    pub fn remove(&self, id: &KeyId) -> bool {
        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        keys.remove(id).is_some()
    }

    /// Returns true if frames decrypted by the key with this id are expected to be signed.
    pub fn has_key(&self, id: &KeyId) -> bool {
        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        keys.contains_key(id)
    }

    /// Verifies the signature with the key registered under this id.
    ///
    /// Returns false if no key is registered.
    pub fn verify(&self, id: &KeyId, data: &[u8], signature: &[u8]) -> bool {
        let key = {
            let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
            keys.get(id).cloned()
        };
        match key {
            Some(key) => key.verify(data, signature),
            None => false,
        }
    }
}

impl fmt::Debug for SignsIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("SignsIndex")
            .field("ids", &keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

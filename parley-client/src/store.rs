// SPDX-License-Identifier: MIT OR Apache-2.0

//! Encrypted local store holding the whole client state in one container.
//!
//! The state is serialized into four length-prefixed sections and encrypted as one AES-256-GCM
//! ciphertext with a random IV prefix. The master key is derived once from the user's password.
//! Sections carry 8-byte length prefixes, chat history easily outgrows 64 KiB.
//!
//! ```text
//! IV (12 bytes) || AES-GCM(
//!     [u64 len + chat history][u64 len + connections]
//!     [u64 len + published keys][u64 len + checkpoint]
//! )
//! ```
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use parley_core::{Checkpoint, CheckpointError, CodecError, Reader, Writer};
use parley_encryption::traits::{Decrypt, Encrypt};
use parley_encryption::{
    AesKey, ConnectionEntry, ConnectionError, CryptoError, KeysIndex, PublishedKey,
    PublishedKeyError, SignsIndex, derive_master_key, export_connections, export_published_keys,
    import_connections, import_published_keys,
};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::chat::ChatClient;
use crate::config::Config;
use crate::transport::Transport;

/// Fixed salt of the master key derivation.
const MASTER_KEY_SALT: &[u8] = b"parley local store";

/// Everything a client persists between runs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreState {
    /// Opaque chat history of the application.
    pub history: Vec<u8>,
    pub connections: Vec<ConnectionEntry>,
    pub published_keys: Vec<PublishedKey>,
    pub checkpoint: Option<Checkpoint>,
}

impl StoreState {
    /// Registers the key material of all connections and published keys.
    ///
    /// Needs to happen before the socket is opened, so frames of long-lived sessions decrypt
    /// right away.
    pub fn seed(&self, keys: &KeysIndex, signs: &SignsIndex) {
        for key in &self.published_keys {
            key.register(keys);
        }
        for entry in &self.connections {
            entry.register(keys, signs);
        }
    }
}

/// Where the encrypted container is kept.
pub trait Storage: Send + Sync + 'static {
    type Error: Error + Send + Sync + 'static;

    fn load(&self) -> impl Future<Output = Result<Option<Vec<u8>>, Self::Error>> + Send;

    fn save(&self, container: Vec<u8>) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Storage keeping the container in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryStorage {
    container: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    type Error = std::convert::Infallible;

    async fn load(&self) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(self
            .container
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn save(&self, container: Vec<u8>) -> Result<(), Self::Error> {
        *self
            .container
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(container);
        Ok(())
    }
}

/// Local store encrypting all state with a password-derived master key.
#[derive(Debug)]
pub struct EncryptedStore<S> {
    storage: S,
    master_key: AesKey,
}

impl<S> EncryptedStore<S>
where
    S: Storage,
{
    /// Derives the master key from the password.
    pub async fn open(storage: S, password: &str, config: &Config) -> Result<Self, StoreError> {
        let password = password.to_owned();
        let iterations = config.pbkdf2_iterations;
        let master_key = tokio::task::spawn_blocking(move || {
            derive_master_key(password.as_bytes(), MASTER_KEY_SALT, iterations)
        })
        .await?;
        Ok(Self {
            storage,
            master_key,
        })
    }

    pub async fn save(&self, state: &StoreState) -> Result<(), StoreError> {
        let container = self.seal(state)?;
        self.storage
            .save(container)
            .await
            .map_err(|err| StoreError::Storage(Box::new(err)))?;
        debug!(
            connections = state.connections.len(),
            published_keys = state.published_keys.len(),
            "saved state"
        );
        Ok(())
    }

    /// Loads and decrypts the persisted state, `None` if nothing was saved yet.
    pub async fn load(&self) -> Result<Option<StoreState>, StoreError> {
        let Some(container) = self
            .storage
            .load()
            .await
            .map_err(|err| StoreError::Storage(Box::new(err)))?
        else {
            return Ok(None);
        };
        self.unseal(&container).map(Some)
    }

    /// Encrypts the state into a container.
    pub fn seal(&self, state: &StoreState) -> Result<Vec<u8>, StoreError> {
        let mut writer = Writer::new();
        writer
            .write_bytes_long(&state.history)
            .write_bytes_long(&export_connections(state.connections.iter())?)
            .write_bytes_long(&export_published_keys(state.published_keys.iter())?)
            .write_bytes_long(&Checkpoint::export(state.checkpoint.as_ref()));
        Ok(self.master_key.encrypt(&writer.finish())?)
    }

    /// Decrypts a container. Fails on a wrong password, never returning garbage.
    pub fn unseal(&self, container: &[u8]) -> Result<StoreState, StoreError> {
        let plaintext = self
            .master_key
            .decrypt(container)
            .map_err(|_| StoreError::DecryptionFailed)?;

        let mut reader = Reader::new(&plaintext);
        let history = reader.read_bytes_long()?;
        let connections = import_connections(&reader.read_bytes_long()?)?;
        let published_keys = import_published_keys(&reader.read_bytes_long()?)?;
        let checkpoint = Checkpoint::import(&reader.read_bytes_long()?)?;
        if !reader.is_empty() {
            return Err(StoreError::TrailingBytes(reader.remaining()));
        }

        Ok(StoreState {
            history,
            connections,
            published_keys,
            checkpoint,
        })
    }
}

/// Task saving the client state whenever connections, published keys or the checkpoint change.
///
/// Changes arriving while a save is in flight are coalesced into one follow-up save. Once the
/// protocol client was destroyed the state is saved one last time and the task stops.
pub struct Autosave {
    history: watch::Sender<Vec<u8>>,
    saves: watch::Receiver<u64>,
    handle: JoinHandle<()>,
}

impl Autosave {
    /// Spawns the task. `history` is the application's chat history saved alongside the state.
    ///
    /// Needs to be spawned before the session, changes made earlier are only saved together with
    /// the next one.
    pub fn spawn<T, S>(chat: &ChatClient<T>, store: EncryptedStore<S>, history: Vec<u8>) -> Self
    where
        T: Transport,
        S: Storage,
    {
        let (history, mut history_rx) = watch::channel(history);
        let (saves_tx, saves) = watch::channel(0);
        let mut changes = chat.watch_changes();
        let mut checkpoints = chat.protocol().watch_checkpoint();
        let destroyed = chat.protocol().destroyed_token();
        let chat = chat.clone();

        let handle = tokio::spawn(async move {
            loop {
                let last = tokio::select! {
                    _ = destroyed.cancelled() => true,
                    Ok(()) = changes.changed() => false,
                    Ok(()) = checkpoints.changed() => false,
                    Ok(()) = history_rx.changed() => false,
                    else => true,
                };

                // Everything changed up to here goes into this save.
                changes.mark_unchanged();
                checkpoints.mark_unchanged();
                let history = history_rx.borrow_and_update().clone();

                let state = chat.snapshot(history).await;
                match store.save(&state).await {
                    Ok(()) => {
                        saves_tx.send_modify(|count| *count += 1);
                    }
                    Err(err) => error!(%err, "saving state failed"),
                }

                if last {
                    break;
                }
            }
            debug!("autosave stopped");
        });

        Self {
            history,
            saves,
            handle,
        }
    }

    /// Replaces the chat history and saves.
    pub fn set_history(&self, history: Vec<u8>) {
        self.history.send_replace(history);
    }

    /// Receiver of the number of successful saves.
    pub fn watch_saves(&self) -> watch::Receiver<u64> {
        self.saves.clone()
    }

    /// Waits until the final save after the protocol client was destroyed.
    pub async fn closed(self) -> Result<(), StoreError> {
        Ok(self.handle.await?)
    }
}

impl fmt::Debug for Autosave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Autosave")
            .field("saves", &*self.saves.borrow())
            .field("finished", &self.handle.is_finished())
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("could not decrypt local store, wrong password or corrupted container")]
    DecryptionFailed,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    PublishedKey(#[from] PublishedKeyError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("{0} unexpected bytes after end of local store")]
    TrailingBytes(usize),

    #[error("storage failed: {0}")]
    Storage(Box<dyn Error + Send + Sync>),

    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire protocol: framing, encryption and signing of outbound messages, decryption, verification
//! and dispatch of inbound frames.
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use parley_core::{Checkpoint, Frame, FrameError, Hash, MessageError, ProtocolMessage, Timestamp};
use parley_encryption::traits::{Encrypt, Sign};
use parley_encryption::{CryptoError, KeyId, KeysIndex, SignsIndex};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::transport::{InboundFrame, Transport};

/// Number of recently processed frame hashes remembered to filter duplicates.
const RECENT_FRAMES_CAPACITY: usize = 1024;

/// Events emitted for inbound frames.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// Frame decrypted with the key registered under `key_id` and passed all checks.
    Message {
        key_id: KeyId,
        timestamp: Timestamp,
        message: ProtocolMessage,
    },

    /// Frame decrypted but its signature was invalid, or it was unsigned although the session
    /// requires signatures. The frame was discarded.
    SignatureMismatch { key_id: KeyId, timestamp: Timestamp },
}

/// Hashes of frames we have sent or processed recently.
///
/// The relay's live stream and the fetched history overlap after reconnects and history contains
/// our own frames, neither must be dispatched twice.
#[derive(Debug, Default)]
struct RecentFrames {
    order: VecDeque<Hash>,
    hashes: HashSet<Hash>,
}

impl RecentFrames {
    /// Returns false if the hash was already known.
    fn insert(&mut self, hash: Hash) -> bool {
        if !self.hashes.insert(hash) {
            return false;
        }
        self.order.push_back(hash);
        if self.order.len() > RECENT_FRAMES_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.hashes.remove(&oldest);
            }
        }
        true
    }
}

/// Client speaking the parley wire protocol over a [`Transport`].
///
/// Clones share the same state.
pub struct ProtocolClient<T> {
    transport: Arc<T>,
    keys: KeysIndex,
    signs: SignsIndex,
    recent: Arc<Mutex<RecentFrames>>,
    checkpoint: Arc<watch::Sender<Option<Checkpoint>>>,
    events: broadcast::Sender<ProtocolEvent>,
    destroyed: CancellationToken,
}

impl<T> ProtocolClient<T>
where
    T: Transport,
{
    pub fn new(transport: Arc<T>, keys: KeysIndex, signs: SignsIndex, config: &Config) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        Self {
            transport,
            keys,
            signs,
            recent: Arc::new(Mutex::new(RecentFrames::default())),
            checkpoint: Arc::new(watch::channel(None).0),
            events,
            destroyed: CancellationToken::new(),
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.events.subscribe()
    }

    pub fn checkpoint(&self) -> Option<Checkpoint> {
        *self.checkpoint.borrow()
    }

    /// Receiver notified whenever the checkpoint moves.
    pub fn watch_checkpoint(&self) -> watch::Receiver<Option<Checkpoint>> {
        self.checkpoint.subscribe()
    }

    /// Restores a persisted checkpoint.
    pub fn restore_checkpoint(&self, checkpoint: Option<Checkpoint>) {
        self.checkpoint.send_replace(checkpoint);
    }

    /// Moves the checkpoint to another timestamp of the same frame, unless it moved on meanwhile.
    pub(crate) fn reanchor_checkpoint(&self, current: Checkpoint, timestamp: Timestamp) {
        self.checkpoint.send_if_modified(|checkpoint| {
            if *checkpoint != Some(current) {
                return false;
            }
            *checkpoint = Some(Checkpoint::new(timestamp, *current.hash()));
            true
        });
    }

    /// Serializes, encrypts and optionally signs a message and hands the frame to the transport.
    ///
    /// The signature is computed over the ciphertext. Returns the hash of the sent frame. The
    /// checkpoint moves to the frame, stamped with the time the relay received it.
    pub async fn post_message(
        &self,
        message: &ProtocolMessage,
        encryption_key: &dyn Encrypt,
        signing_key: Option<&dyn Sign>,
    ) -> Result<Hash, ProtocolError> {
        if self.is_destroyed() {
            return Err(ProtocolError::Destroyed);
        }

        let plaintext = message.to_bytes()?;
        let ciphertext = encryption_key.encrypt(&plaintext)?;
        let signature = match signing_key {
            Some(key) => Some(key.sign(&ciphertext)?),
            None => None,
        };
        let bytes = Frame::new(ciphertext, signature).to_bytes()?;
        let hash = Hash::new(&bytes);

        // Remember the frame before sending so it can never be dispatched as inbound.
        self.recent().insert(hash);

        let timestamp = self
            .transport
            .send(bytes)
            .await
            .map_err(|err| ProtocolError::Transport(Box::new(err)))?;

        trace!(kind = message.kind(), %hash, timestamp, "posted frame");
        self.advance_checkpoint(timestamp, hash);

        Ok(hash)
    }

    /// Processes one inbound frame and emits the resulting event to all subscribers.
    ///
    /// Frames which are malformed, can not be decrypted with any registered key or were already
    /// processed are silently dropped. Every frame not seen before moves the checkpoint, using the
    /// relay's timestamp so it can be found again in the relay's history. Returns the emitted
    /// event, if any.
    pub async fn handle_frame(&self, frame: &InboundFrame) -> Option<ProtocolEvent> {
        if self.is_destroyed() {
            return None;
        }

        let hash = Hash::new(&frame.bytes);
        let fresh = self.recent().insert(hash);
        if !fresh {
            trace!(%hash, "drop already processed frame");
            return None;
        }

        let event = self.process_frame(frame).await;

        // Results of work which completed after destruction are discarded.
        if self.is_destroyed() {
            return None;
        }

        self.advance_checkpoint(frame.timestamp, hash);

        if let Some(event) = &event {
            // Sending only fails when there are no subscribers.
            let _ = self.events.send(event.clone());
        }

        event
    }

    /// Stops processing. In-flight operations complete but their results are discarded.
    pub fn destroy(&self) {
        debug!("destroy protocol client");
        self.destroyed.cancel();
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.is_cancelled()
    }

    pub(crate) fn destroyed_token(&self) -> CancellationToken {
        self.destroyed.clone()
    }

    async fn process_frame(&self, inbound: &InboundFrame) -> Option<ProtocolEvent> {
        let frame = match Frame::from_bytes(&inbound.bytes) {
            Ok(frame) => frame,
            Err(err) => {
                trace!(%err, "drop malformed frame");
                return None;
            }
        };

        let Some((key_id, plaintext)) = self.keys.try_decrypt(&frame.ciphertext).await else {
            trace!("drop frame which is not addressed to us");
            return None;
        };

        // A missing signature on a session which requires one is treated exactly like an invalid
        // signature, otherwise unsigned frames could be replayed into authenticated sessions.
        let authentic = match &frame.signature {
            Some(signature) => self.signs.verify(&key_id, &frame.ciphertext, signature),
            None => !self.signs.has_key(&key_id),
        };
        if !authentic {
            warn!(%key_id, signed = frame.is_signed(), "signature mismatch");
            return Some(ProtocolEvent::SignatureMismatch {
                key_id,
                timestamp: inbound.timestamp,
            });
        }

        match ProtocolMessage::from_bytes(&plaintext) {
            Ok(message) => {
                trace!(%key_id, kind = message.kind(), "received message");
                Some(ProtocolEvent::Message {
                    key_id,
                    timestamp: inbound.timestamp,
                    message,
                })
            }
            Err(err) => {
                debug!(%key_id, %err, "drop frame with malformed plaintext");
                None
            }
        }
    }

    fn advance_checkpoint(&self, timestamp: Timestamp, hash: Hash) {
        let candidate = Checkpoint::new(timestamp, hash);
        let moved = self
            .checkpoint
            .send_if_modified(|current| Checkpoint::advance(current, candidate));
        if !moved {
            trace!(%hash, timestamp, "checkpoint not moved by older frame");
        }
    }

    fn recent(&self) -> std::sync::MutexGuard<'_, RecentFrames> {
        self.recent.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Clone for ProtocolClient<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            keys: self.keys.clone(),
            signs: self.signs.clone(),
            recent: self.recent.clone(),
            checkpoint: self.checkpoint.clone(),
            events: self.events.clone(),
            destroyed: self.destroyed.clone(),
        }
    }
}

impl<T> fmt::Debug for ProtocolClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolClient")
            .field("keys", &self.keys)
            .field("signs", &self.signs)
            .field("destroyed", &self.destroyed.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("transport failed: {0}")]
    Transport(Box<dyn std::error::Error + Send + Sync>),

    #[error("protocol client was destroyed")]
    Destroyed,
}

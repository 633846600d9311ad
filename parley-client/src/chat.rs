// SPDX-License-Identifier: MIT OR Apache-2.0

//! Chat orchestration on top of the protocol client.
//!
//! [`ChatClient`] owns all connections and published keys. It turns user operations and inbound
//! protocol events into handshake transitions, keeps the key indexes in sync with the state of
//! every connection and re-emits what happened as [`ChatEvent`]s.
//!
//! Inbound events which do not fit the current state of their connection are ignored, the other
//! peer might be retransmitting a stale message.
//!
//! A transition only sticks if its handshake message reached the relay. When sending fails the
//! connection is rolled back to its previous state and the operation can be retried.
//!
//! Every change of connections or published keys bumps a revision observable with
//! [`ChatClient::watch_changes`], see [`Autosave`] for persisting them.
//!
//! [`Autosave`]: crate::Autosave
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parley_core::{ProtocolMessage, Timestamp, now_millis};
use parley_encryption::traits::{Encrypt, Sign};
use parley_encryption::{
    ConnectionEntry, ConnectionError, KeyId, KeysIndex, PublishedKey, PublishedKeyError,
    RsaPublicKey, SessionKeys, SignsIndex,
};
use thiserror::Error;
use tokio::sync::{RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::protocol::{ProtocolClient, ProtocolError, ProtocolEvent};
use crate::store::StoreState;
use crate::transport::Transport;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChatEvent {
    /// Someone sent us a connection request through one of our published keys.
    NewPendingConnection { id: KeyId, from_name: String },

    /// Handshake completed, the session keys are ready to use.
    ConnectionEstablished { id: KeyId, keys: SessionKeys },

    /// Our connection request was declined.
    ConnectionDeclined { id: KeyId },

    Message {
        id: KeyId,
        timestamp: Timestamp,
        text: String,
    },

    /// A frame of this connection carried an invalid or missing signature and was discarded.
    SignatureMismatch { id: KeyId },
}

#[derive(Debug, Default)]
struct ChatState {
    connections: HashMap<KeyId, ConnectionEntry>,
    published_keys: HashMap<KeyId, PublishedKey>,
}

/// Chat client managing connections and published keys.
///
/// Clones share the same state.
pub struct ChatClient<T> {
    protocol: ProtocolClient<T>,
    keys: KeysIndex,
    signs: SignsIndex,
    state: Arc<RwLock<ChatState>>,
    events: broadcast::Sender<ChatEvent>,
    changes: Arc<watch::Sender<u64>>,
    config: Config,
}

impl<T> ChatClient<T>
where
    T: Transport,
{
    pub fn new(
        protocol: ProtocolClient<T>,
        keys: KeysIndex,
        signs: SignsIndex,
        config: Config,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        Self {
            protocol,
            keys,
            signs,
            state: Arc::new(RwLock::new(ChatState::default())),
            events,
            changes: Arc::new(watch::channel(0).0),
            config,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    pub fn protocol(&self) -> &ProtocolClient<T> {
        &self.protocol
    }

    /// Receiver of the state revision, bumped on every change of connections or published keys.
    pub fn watch_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Consistent copy of everything which needs to be persisted.
    pub async fn snapshot(&self, history: Vec<u8>) -> StoreState {
        let state = self.state.read().await;
        StoreState {
            history,
            connections: state.connections.values().cloned().collect(),
            published_keys: state.published_keys.values().cloned().collect(),
            checkpoint: self.protocol.checkpoint(),
        }
    }

    /// Spawns a task handling all events of the protocol client.
    ///
    /// The subscription is created before this method returns, no event emitted afterwards is
    /// missed. The task ends when the protocol client was destroyed.
    pub fn start(&self) -> JoinHandle<()> {
        let mut protocol_events = self.protocol.subscribe();
        let destroyed = self.protocol.destroyed_token();
        let client = self.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = destroyed.cancelled() => break,
                    event = protocol_events.recv() => event,
                };

                match event {
                    Ok(event) => {
                        if let Err(err) = client.handle_event(event).await {
                            warn!(%err, "failed handling protocol event");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "chat client lagged behind protocol events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("chat client stopped");
        })
    }

    // Published keys.

    /// Issues a new published key and registers it for inbound connection requests.
    ///
    /// Returns its id and the public key to share out-of-band.
    pub async fn issue_key(&self, label: &str) -> Result<(KeyId, RsaPublicKey), ChatError> {
        let label = label.to_owned();
        let bits = self.config.rsa_modulus_bits;
        let key =
            tokio::task::spawn_blocking(move || PublishedKey::issue(&label, bits, now_millis()))
                .await??;

        let result = (key.id(), key.public_key().clone());
        key.register(&self.keys);
        self.state.write().await.published_keys.insert(key.id(), key);
        self.changed();
        Ok(result)
    }

    /// Deletes a published key, requests sent to it afterwards are not received anymore.
    pub async fn delete_published_key(&self, id: &KeyId) -> Result<(), ChatError> {
        let key = self
            .state
            .write()
            .await
            .published_keys
            .remove(id)
            .ok_or(ChatError::UnknownPublishedKey(*id))?;
        key.unregister(&self.keys);
        self.changed();
        debug!(%id, "deleted published key");
        Ok(())
    }

    pub async fn published_keys(&self) -> Vec<PublishedKey> {
        self.state
            .read()
            .await
            .published_keys
            .values()
            .cloned()
            .collect()
    }

    // Connections.

    /// Sends a connection request to the owner of the published key.
    pub async fn send_connection_request(
        &self,
        published_key: &RsaPublicKey,
        from_name: &str,
    ) -> Result<KeyId, ChatError> {
        let name = from_name.to_owned();
        let bits = self.config.rsa_modulus_bits;
        let (entry, request) = tokio::task::spawn_blocking(move || {
            ConnectionEntry::initiate(&name, bits, now_millis())
        })
        .await??;

        let id = entry.id();
        let mut state = self.state.write().await;
        self.commit(&mut state, entry);

        if let Err(err) = self.protocol.post_message(&request, published_key, None).await {
            warn!(%id, %err, "sending connection request failed, forget connection");
            self.forget(&mut state, &id);
            return Err(err.into());
        }
        Ok(id)
    }

    /// Accepts a pending connection request.
    pub async fn accept_connection(&self, id: &KeyId) -> Result<(), ChatError> {
        let mut state = self.state.write().await;
        let previous = state
            .connections
            .get(id)
            .cloned()
            .ok_or(ChatError::UnknownConnection(*id))?;
        let (entry, accept, response_key) = previous.accept(now_millis())?;
        self.commit(&mut state, entry);

        // Sent over the response channel, the other peer does not know our session keys yet.
        if let Err(err) = self.protocol.post_message(&accept, &response_key, None).await {
            warn!(%id, %err, "sending accept failed, connection stays pending");
            self.commit(&mut state, previous);
            return Err(err.into());
        }
        Ok(())
    }

    /// Declines a pending connection request and forgets it.
    pub async fn decline_connection(&self, id: &KeyId) -> Result<(), ChatError> {
        let mut state = self.state.write().await;
        let previous = state
            .connections
            .get(id)
            .cloned()
            .ok_or(ChatError::UnknownConnection(*id))?;
        let (decline, response_key) = previous.decline()?;
        self.forget(&mut state, id);

        if let Err(err) = self.protocol.post_message(&decline, &response_key, None).await {
            warn!(%id, %err, "sending decline failed, connection stays pending");
            self.commit(&mut state, previous);
            return Err(err.into());
        }
        Ok(())
    }

    /// Sends a text message through an established connection.
    pub async fn send_message(&self, id: &KeyId, text: &str) -> Result<(), ChatError> {
        let keys = {
            let state = self.state.read().await;
            let entry = state
                .connections
                .get(id)
                .ok_or(ChatError::UnknownConnection(*id))?;
            match (entry.is_established(), entry.session_keys()) {
                (true, Some(keys)) => keys.clone(),
                _ => return Err(ChatError::NotEstablished(*id)),
            }
        };

        let message = ProtocolMessage::Message {
            text: text.to_owned(),
        };
        self.post_in_session(&message, &keys).await
    }

    /// Removes a connection in any state together with all its key material.
    pub async fn delete_connection(&self, id: &KeyId) -> Result<(), ChatError> {
        let entry = self
            .state
            .write()
            .await
            .connections
            .remove(id)
            .ok_or(ChatError::UnknownConnection(*id))?;
        entry.unregister(&self.keys, &self.signs);
        self.changed();
        debug!(%id, "deleted connection");
        Ok(())
    }

    pub async fn connection(&self, id: &KeyId) -> Option<ConnectionEntry> {
        self.state.read().await.connections.get(id).cloned()
    }

    pub async fn connections(&self) -> Vec<ConnectionEntry> {
        self.state
            .read()
            .await
            .connections
            .values()
            .cloned()
            .collect()
    }

    /// Takes over persisted connections and published keys and registers their key material.
    pub async fn restore(
        &self,
        connections: Vec<ConnectionEntry>,
        published_keys: Vec<PublishedKey>,
    ) {
        let mut state = self.state.write().await;
        for key in published_keys {
            key.register(&self.keys);
            state.published_keys.insert(key.id(), key);
        }
        for entry in connections {
            entry.register(&self.keys, &self.signs);
            state.connections.insert(entry.id(), entry);
        }
    }

    // Inbound events.

    /// Advances the handshake or delivers a message for one protocol event.
    pub async fn handle_event(&self, event: ProtocolEvent) -> Result<(), ChatError> {
        let (key_id, timestamp, message) = match event {
            ProtocolEvent::Message {
                key_id,
                timestamp,
                message,
            } => (key_id, timestamp, message),
            ProtocolEvent::SignatureMismatch { key_id, .. } => {
                self.emit(ChatEvent::SignatureMismatch { id: key_id });
                return Ok(());
            }
        };

        match message {
            ProtocolMessage::ConnectionRequest {
                from_name,
                ecdh_public_key,
                response_rsa_public_key,
            } => {
                self.on_request(key_id, &from_name, &ecdh_public_key, &response_rsa_public_key)
                    .await
            }
            ProtocolMessage::ConnectionRequestAccept { ecdh_public_key } => {
                self.on_accept(key_id, &ecdh_public_key).await
            }
            ProtocolMessage::ConnectionRequestDecline => self.on_decline(key_id).await,
            ProtocolMessage::ConnectionEstablished => self.on_established(key_id).await,
            ProtocolMessage::Message { text } => self.on_message(key_id, timestamp, text).await,
        }
    }

    async fn on_request(
        &self,
        key_id: KeyId,
        from_name: &str,
        ecdh_public_key: &[u8],
        response_rsa_public_key: &[u8],
    ) -> Result<(), ChatError> {
        let id = {
            let mut state = self.state.write().await;
            let Some(published_key) = state.published_keys.get_mut(&key_id) else {
                trace!(%key_id, "ignore connection request outside of published key");
                return Ok(());
            };

            let entry = ConnectionEntry::receive_request(
                from_name,
                ecdh_public_key,
                response_rsa_public_key,
                now_millis(),
            )?;
            published_key.increment_usage();

            let id = entry.id();
            self.commit(&mut state, entry);
            id
        };

        self.emit(ChatEvent::NewPendingConnection {
            id,
            from_name: from_name.to_owned(),
        });
        Ok(())
    }

    async fn on_accept(&self, id: KeyId, ecdh_public_key: &[u8]) -> Result<(), ChatError> {
        let mut state = self.state.write().await;
        let previous = match state.connections.get(&id) {
            Some(entry) if entry.is_requested() => entry.clone(),
            _ => {
                trace!(%id, "ignore accept for connection which is not requested");
                return Ok(());
            }
        };
        let (entry, established) = previous.confirm(ecdh_public_key, now_millis())?;
        let Some(keys) = entry.session_keys().cloned() else {
            return Ok(());
        };
        self.commit(&mut state, entry);

        if let Err(err) = self.post_in_session(&established, &keys).await {
            warn!(%id, %err, "sending confirmation failed, connection stays requested");
            self.commit(&mut state, previous);
            return Err(err);
        }
        Ok(())
    }

    async fn on_decline(&self, id: KeyId) -> Result<(), ChatError> {
        {
            let mut state = self.state.write().await;
            match state.connections.get(&id) {
                Some(entry) if entry.is_requested() => (),
                _ => {
                    trace!(%id, "ignore decline for connection which is not requested");
                    return Ok(());
                }
            }
            self.forget(&mut state, &id);
        }

        debug!(%id, "connection was declined");
        self.emit(ChatEvent::ConnectionDeclined { id });
        Ok(())
    }

    async fn on_established(&self, id: KeyId) -> Result<(), ChatError> {
        let keys = {
            let mut state = self.state.write().await;
            let previous = match state.connections.get(&id) {
                Some(entry) if entry.is_pre_established() => entry.clone(),
                _ => {
                    trace!(%id, "ignore acknowledgement for connection in wrong state");
                    return Ok(());
                }
            };
            let (entry, echo) = previous.finish(now_millis())?;
            let Some(keys) = entry.session_keys().cloned() else {
                return Ok(());
            };
            self.commit(&mut state, entry);

            let sent = match echo {
                Some(echo) => self.post_in_session(&echo, &keys).await,
                None => Ok(()),
            };
            if let Err(err) = sent {
                warn!(
                    %id,
                    %err,
                    "sending acknowledgement failed, connection stays pre-established"
                );
                self.commit(&mut state, previous);
                return Err(err);
            }
            keys
        };

        self.emit(ChatEvent::ConnectionEstablished { id, keys });
        Ok(())
    }

    async fn on_message(
        &self,
        id: KeyId,
        timestamp: Timestamp,
        text: String,
    ) -> Result<(), ChatError> {
        let established = {
            let state = self.state.read().await;
            state
                .connections
                .get(&id)
                .is_some_and(ConnectionEntry::is_established)
        };

        if !established {
            trace!(%id, "ignore message for connection which is not established");
            return Ok(());
        }

        self.emit(ChatEvent::Message {
            id,
            timestamp,
            text,
        });
        Ok(())
    }

    /// Stores the entry and registers the key material of its new state.
    ///
    /// Registering replaces the key material of the entry's previous state, committing an older
    /// entry rolls the connection back.
    fn commit(&self, state: &mut ChatState, entry: ConnectionEntry) {
        entry.register(&self.keys, &self.signs);
        state.connections.insert(entry.id(), entry);
        self.changed();
    }

    /// Removes the entry together with its key material.
    fn forget(&self, state: &mut ChatState, id: &KeyId) {
        if let Some(entry) = state.connections.remove(id) {
            entry.unregister(&self.keys, &self.signs);
            self.changed();
        }
    }

    fn changed(&self) {
        self.changes.send_modify(|revision| *revision = revision.wrapping_add(1));
    }

    async fn post_in_session(
        &self,
        message: &ProtocolMessage,
        keys: &SessionKeys,
    ) -> Result<(), ChatError> {
        self.protocol
            .post_message(message, &keys.aes as &dyn Encrypt, Some(&keys.hmac as &dyn Sign))
            .await?;
        Ok(())
    }

    fn emit(&self, event: ChatEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl<T> Clone for ChatClient<T> {
    fn clone(&self) -> Self {
        Self {
            protocol: self.protocol.clone(),
            keys: self.keys.clone(),
            signs: self.signs.clone(),
            state: self.state.clone(),
            events: self.events.clone(),
            changes: self.changes.clone(),
            config: self.config.clone(),
        }
    }
}

impl<T> fmt::Debug for ChatClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatClient")
            .field("protocol", &self.protocol)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("unknown connection {0}")]
    UnknownConnection(KeyId),

    #[error("unknown published key {0}")]
    UnknownPublishedKey(KeyId),

    #[error("connection {0} is not established")]
    NotEstablished(KeyId),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    PublishedKey(#[from] PublishedKeyError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("key generation task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

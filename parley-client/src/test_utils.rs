// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory relay and helpers for tests.
//!
//! [`MemoryRelay`] keeps a history of all frames and broadcasts them live to every connected
//! [`RelayClient`] except the sender. It can be taken offline and can drop all live connections
//! to simulate network failures.
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use futures_core::Stream;
use parley_core::{HistoryEntry, Timestamp, encode_history, now_millis};
use thiserror::Error;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::Config;
use crate::transport::{InboundFrame, Transport};

/// Client id used for frames published by the test itself, for example forged frames.
const OUTSIDER: u64 = 0;

#[derive(Debug)]
struct RelayState {
    online: bool,
    next_client_id: u64,
    connect_attempts: usize,
    history: Vec<HistoryEntry>,
    live: tokio::sync::broadcast::Sender<(u64, InboundFrame)>,
}

#[derive(Clone, Debug)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        let (live, _) = tokio::sync::broadcast::channel(1024);
        Self {
            state: Arc::new(Mutex::new(RelayState {
                online: true,
                next_client_id: OUTSIDER + 1,
                connect_attempts: 0,
                history: Vec::new(),
                live,
            })),
        }
    }

    /// Transport handle for one peer.
    pub fn client(&self) -> RelayClient {
        let mut state = self.lock();
        let id = state.next_client_id;
        state.next_client_id += 1;
        RelayClient {
            id,
            relay: self.clone(),
        }
    }

    /// All frames the relay received so far.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.lock().history.clone()
    }

    /// Refuses or accepts new connections.
    pub fn set_online(&self, online: bool) {
        self.lock().online = online;
    }

    /// Closes all live streams. Clients need to reconnect.
    pub fn disconnect_all(&self) {
        let (live, _) = tokio::sync::broadcast::channel(1024);
        self.lock().live = live;
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    /// Publishes a frame which does not originate from any client.
    pub fn inject(&self, bytes: Vec<u8>) -> Timestamp {
        self.publish(OUTSIDER, bytes)
    }

    /// Stores a frame in history without delivering it live, as if it arrived while a client was
    /// disconnected.
    pub fn inject_into_history(&self, bytes: Vec<u8>) -> Timestamp {
        let timestamp = now_millis();
        self.inject_into_history_at(timestamp, bytes);
        timestamp
    }

    /// Stores a frame in history as if the relay received it at the given time.
    pub fn inject_into_history_at(&self, timestamp: Timestamp, bytes: Vec<u8>) {
        let mut state = self.lock();
        state.history.push(HistoryEntry::new(timestamp, bytes));
        state.history.sort_by_key(|entry| entry.timestamp);
    }

    fn publish(&self, sender: u64, bytes: Vec<u8>) -> Timestamp {
        let timestamp = now_millis();
        let mut state = self.lock();
        state
            .history
            .push(HistoryEntry::new(timestamp, bytes.clone()));
        // No live subscribers is fine.
        let _ = state
            .live
            .send((sender, InboundFrame::new(timestamp, bytes)));
        timestamp
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection of one peer to the [`MemoryRelay`].
#[derive(Clone, Debug)]
pub struct RelayClient {
    id: u64,
    relay: MemoryRelay,
}

pub type RelayStream = Pin<Box<dyn Stream<Item = Result<InboundFrame, RelayError>> + Send>>;

impl Transport for RelayClient {
    type Error = RelayError;

    type FrameStream = RelayStream;

    async fn connect(&self) -> Result<Self::FrameStream, Self::Error> {
        let mut state = self.relay.lock();
        state.connect_attempts += 1;
        if !state.online {
            return Err(RelayError::Offline);
        }

        let own_id = self.id;
        let stream = BroadcastStream::new(state.live.subscribe()).filter_map(move |item| {
            match item {
                Ok((sender, _)) if sender == own_id => None,
                Ok((_, frame)) => Some(Ok(frame)),
                // Lagging behind is treated as a dropped connection.
                Err(_) => Some(Err(RelayError::Lagged)),
            }
        });

        Ok(Box::pin(stream))
    }

    async fn send(&self, frame: Vec<u8>) -> Result<Timestamp, Self::Error> {
        if !self.relay.lock().online {
            return Err(RelayError::Offline);
        }
        Ok(self.relay.publish(self.id, frame))
    }

    async fn fetch_history(&self, from: Timestamp, to: Timestamp) -> Result<Vec<u8>, Self::Error> {
        let entries: Vec<HistoryEntry> = {
            let state = self.relay.lock();
            if !state.online {
                return Err(RelayError::Offline);
            }
            state
                .history
                .iter()
                .filter(|entry| entry.timestamp >= from && entry.timestamp <= to)
                .cloned()
                .collect()
        };
        encode_history(&entries).map_err(|_| RelayError::HistoryTooLarge)
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay is offline")]
    Offline,

    #[error("live stream lagged behind")]
    Lagged,

    #[error("history response exceeds the encodable size")]
    HistoryTooLarge,
}

/// Configuration with cheap key generation.
pub fn test_config() -> Config {
    Config {
        rsa_modulus_bits: parley_encryption::test_utils::TEST_RSA_MODULUS_BITS,
        pbkdf2_iterations: 1_000,
        ..Config::default()
    }
}

pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

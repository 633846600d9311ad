// SPDX-License-Identifier: MIT OR Apache-2.0

//! `parley-client` runs end-to-end encrypted chats between peers over an untrusted relay.
//!
//! The crate is layered, each layer being usable on its own:
//!
//! 1. [`ProtocolClient`] frames, encrypts and signs outbound messages and decrypts, verifies and
//!    dispatches inbound frames, resolving the key of a frame by trial decryption.
//! 2. [`ChatClient`] turns protocol events into handshake transitions of the connections it owns
//!    and emits [`ChatEvent`]s to the application.
//! 3. [`Session`] keeps the connection to the relay alive, resynchronizing missed frames after
//!    every reconnect.
//! 4. [`EncryptedStore`] persists all state in one password-protected container and re-seeds the
//!    key indexes on startup. [`Autosave`] saves it after every change.
//!
//! ## Startup
//!
//! ```text
//! EncryptedStore::load ─> StoreState::seed(keys, signs) ─> ChatClient::restore
//!     ─> ChatClient::start ─> Autosave::spawn ─> Session::spawn
//! ```
//!
//! Key material has to be seeded before the session opens the socket, otherwise frames of
//! long-lived sessions arriving during resync can not be decrypted.
mod chat;
mod config;
mod protocol;
mod resync;
mod session;
mod store;
#[cfg(test)]
mod tests;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
mod transport;

pub use chat::{ChatClient, ChatError, ChatEvent};
pub use config::{
    Config, DEFAULT_EVENT_CAPACITY, DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_INTERVAL,
    DEFAULT_RESYNC_SKEW,
};
pub use protocol::{ProtocolClient, ProtocolError, ProtocolEvent};
pub use resync::{ResyncError, resync};
pub use session::{Session, SessionError, SessionEvent};
pub use store::{Autosave, EncryptedStore, MemoryStorage, Storage, StoreError, StoreState};
pub use transport::{InboundFrame, Transport};

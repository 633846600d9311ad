// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interface to the relay server.
//!
//! The relay is a dumb, authenticated pipe: it forwards every frame to all connected clients and
//! keeps a history of them. It never learns who a frame is addressed to.
use std::error::Error;
use std::future::Future;

use futures_core::Stream;
use parley_core::Timestamp;

/// Raw frame received from the relay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundFrame {
    /// Time the relay received the frame.
    pub timestamp: Timestamp,
    pub bytes: Vec<u8>,
}

impl InboundFrame {
    pub fn new(timestamp: Timestamp, bytes: Vec<u8>) -> Self {
        Self { timestamp, bytes }
    }
}

/// Connection to a relay.
///
/// Frames a client sent itself are not delivered back to it on the live stream, the history
/// however contains all frames.
pub trait Transport: Send + Sync + 'static {
    type Error: Error + Send + Sync + 'static;

    type FrameStream: Stream<Item = Result<InboundFrame, Self::Error>> + Send + Unpin;

    /// Opens the socket and returns the live stream of frames. The stream ending means the socket
    /// was closed.
    fn connect(&self) -> impl Future<Output = Result<Self::FrameStream, Self::Error>> + Send;

    /// Publishes a frame, returning the time the relay received it.
    fn send(&self, frame: Vec<u8>) -> impl Future<Output = Result<Timestamp, Self::Error>> + Send;

    /// Fetches all frames the relay received between both timestamps (inclusive), encoded in the
    /// history format of [`parley_core::history`].
    fn fetch_history(
        &self,
        from: Timestamp,
        to: Timestamp,
    ) -> impl Future<Output = Result<Vec<u8>, Self::Error>> + Send;
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! Catching up on frames missed while disconnected.
//!
//! After every (re)connect the relay's history is fetched from shortly before the checkpoint up
//! to now. The frame matching the checkpoint hash marks where we left off, every frame after it is
//! dispatched through the regular inbound pipeline in its original order. Checkpoints carry the
//! relay's timestamps, the found frame re-anchors the checkpoint to the relay's clock before
//! replaying.
//!
//! If the checkpoint frame is not part of the fetched history we can not know which frames were
//! already processed. The window is widened (doubling the skew) as often as configured and the
//! resync fails closed afterwards, the session never resumes from a guessed position.
use std::time::Duration;

use parley_core::{CodecError, Hash, Timestamp, decode_history, now_millis};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::protocol::ProtocolClient;
use crate::transport::{InboundFrame, Transport};

/// Replays all frames after the current checkpoint.
///
/// Returns the number of replayed frames. Without a checkpoint there is nothing to resume from and
/// nothing gets replayed.
pub async fn resync<T: Transport>(
    protocol: &ProtocolClient<T>,
    config: &Config,
) -> Result<usize, ResyncError> {
    let Some(checkpoint) = protocol.checkpoint() else {
        debug!("no checkpoint, skip resync");
        return Ok(0);
    };

    let now = now_millis();
    let mut skew = config.resync_skew;

    for attempt in 0..=config.resync_max_widenings {
        let from = checkpoint.timestamp().saturating_sub(as_millis(skew));
        let bytes = protocol
            .transport()
            .fetch_history(from, now.max(checkpoint.timestamp()))
            .await
            .map_err(|err| ResyncError::Transport(Box::new(err)))?;
        let history = decode_history(&bytes)?;

        let Some(index) = history
            .iter()
            .position(|entry| &Hash::new(&entry.payload) == checkpoint.hash())
        else {
            warn!(
                attempt,
                candidates = history.len(),
                skew_ms = as_millis(skew),
                "checkpoint not found in history"
            );
            skew = skew.saturating_mul(2);
            continue;
        };

        let anchor = &history[index];
        if anchor.timestamp != checkpoint.timestamp() {
            debug!(
                from = checkpoint.timestamp(),
                to = anchor.timestamp,
                "re-anchor checkpoint to relay time"
            );
            protocol.reanchor_checkpoint(checkpoint, anchor.timestamp);
        }

        let missed = &history[index + 1..];
        debug!(replayed = missed.len(), "resync from checkpoint");
        for entry in missed {
            protocol
                .handle_frame(&InboundFrame::new(entry.timestamp, entry.payload.clone()))
                .await;
        }

        return Ok(missed.len());
    }

    error!(
        timestamp = checkpoint.timestamp(),
        hash = %checkpoint.hash(),
        "resync failed, checkpoint not found in history"
    );
    Err(ResyncError::CheckpointNotFound {
        timestamp: checkpoint.timestamp(),
        hash: *checkpoint.hash(),
    })
}

fn as_millis(duration: Duration) -> Timestamp {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Error)]
pub enum ResyncError {
    #[error("checkpoint {hash} at {timestamp} not found in history")]
    CheckpointNotFound { timestamp: Timestamp, hash: Hash },

    #[error("malformed history response: {0}")]
    History(#[from] CodecError),

    #[error("fetching history failed: {0}")]
    Transport(Box<dyn std::error::Error + Send + Sync>),
}

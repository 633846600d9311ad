// SPDX-License-Identifier: MIT OR Apache-2.0

//! Connection lifecycle: connect, resync, pump inbound frames and reconnect.
//!
//! After the live stream ends or a connect attempt fails, the session waits a fixed interval and
//! tries again. Once the configured number of consecutive attempts is exhausted the session fails
//! for good and needs to be re-created by the application. A successful connect resets the
//! attempt counter.
use std::fmt;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::protocol::ProtocolClient;
use crate::resync::{ResyncError, resync};
use crate::transport::Transport;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,

    /// Frames missed while disconnected were replayed.
    Resynced { replayed: usize },

    Disconnected,

    /// Waiting before the next connect attempt.
    Reconnecting { attempt: u32 },

    /// Terminal, the session stopped.
    Failed { reason: String },
}

/// Handle to a running session task.
pub struct Session {
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
    handle: JoinHandle<Result<(), SessionError>>,
}

impl Session {
    /// Spawns the session task driving the protocol client.
    pub fn spawn<T: Transport>(protocol: ProtocolClient<T>, config: Config) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        // Destroying the protocol client stops the session as well.
        let cancel = protocol.destroyed_token().child_token();

        let runner = Runner {
            protocol,
            config,
            events: events.clone(),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(runner.run());

        Self {
            events,
            cancel,
            handle,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Stops the session and closes the socket.
    pub fn destroy(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits until the session stopped, either destroyed or failed.
    pub async fn closed(self) -> Result<(), SessionError> {
        self.handle.await?
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("finished", &self.handle.is_finished())
            .finish()
    }
}

struct Runner<T> {
    protocol: ProtocolClient<T>,
    config: Config,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
}

impl<T: Transport> Runner<T> {
    async fn run(self) -> Result<(), SessionError> {
        let result = self.run_inner().await;
        if let Err(err) = &result {
            error!(%err, "session failed");
            self.emit(SessionEvent::Failed {
                reason: err.to_string(),
            });
        }
        result
    }

    async fn run_inner(&self) -> Result<(), SessionError> {
        let mut attempts = 0;

        loop {
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                result = self.protocol.transport().connect() => result,
            };

            match connected {
                Ok(mut stream) => {
                    attempts = 0;
                    debug!("connected to relay");
                    self.emit(SessionEvent::Connected);

                    let replayed = tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(()),
                        result = resync(&self.protocol, &self.config) => result?,
                    };
                    self.emit(SessionEvent::Resynced { replayed });

                    loop {
                        let item = tokio::select! {
                            _ = self.cancel.cancelled() => return Ok(()),
                            item = stream.next() => item,
                        };
                        match item {
                            Some(Ok(frame)) => {
                                self.protocol.handle_frame(&frame).await;
                            }
                            Some(Err(err)) => {
                                warn!(%err, "live stream failed");
                                break;
                            }
                            None => break,
                        }
                    }

                    debug!("disconnected from relay");
                    self.emit(SessionEvent::Disconnected);
                }
                Err(err) => {
                    warn!(%err, attempts, "connecting to relay failed");
                }
            }

            if attempts >= self.config.max_reconnect_attempts {
                return Err(SessionError::ReconnectsExhausted(attempts));
            }
            attempts += 1;

            warn!(
                attempt = attempts,
                interval_s = self.config.reconnect_interval.as_secs(),
                "reconnecting"
            );
            self.emit(SessionEvent::Reconnecting { attempt: attempts });

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.reconnect_interval) => (),
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("giving up after {0} reconnect attempts")]
    ReconnectsExhausted(u32),

    #[error(transparent)]
    Resync(#[from] ResyncError),

    #[error("session task panicked or was aborted: {0}")]
    Task(#[from] tokio::task::JoinError),
}

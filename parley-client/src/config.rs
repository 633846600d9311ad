// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use parley_encryption::{DEFAULT_PBKDF2_ITERATIONS, DEFAULT_RSA_MODULUS_BITS};
use serde::{Deserialize, Serialize};

/// Default fixed waiting time between reconnect attempts.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(30);

/// Default number of reconnect attempts before a session fails for good.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Default backward skew applied to the checkpoint when fetching history, absorbing clock drift
/// between us and the relay.
pub const DEFAULT_RESYNC_SKEW: Duration = Duration::from_millis(2000);

/// Default capacity of event channels.
pub const DEFAULT_EVENT_CAPACITY: usize = 128;

/// Configuration of the parley client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Fixed backoff between reconnect attempts.
    ///
    /// Defaults to 30 seconds.
    pub reconnect_interval: Duration,

    /// Number of reconnect attempts after which the session becomes terminally failed.
    ///
    /// Defaults to 5.
    pub max_reconnect_attempts: u32,

    /// Backward skew applied to the checkpoint timestamp when fetching history after reconnects.
    ///
    /// Defaults to 2 seconds.
    pub resync_skew: Duration,

    /// Number of additional history fetches, each with doubled skew, before a resync fails when
    /// the checkpoint could not be found.
    ///
    /// Defaults to 0, failing on the first miss.
    pub resync_max_widenings: u32,

    /// Modulus size of generated RSA-OAEP key pairs.
    pub rsa_modulus_bits: usize,

    /// PBKDF2 rounds to derive the local store master key.
    pub pbkdf2_iterations: u32,

    /// Capacity of broadcast channels carrying protocol, chat and session events.
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            resync_skew: DEFAULT_RESYNC_SKEW,
            resync_max_widenings: 0,
            rsa_modulus_bits: DEFAULT_RSA_MODULUS_BITS,
            pbkdf2_iterations: DEFAULT_PBKDF2_ITERATIONS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

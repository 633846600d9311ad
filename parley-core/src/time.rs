// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since UNIX epoch.
pub type Timestamp = u64;

/// Current system time in milliseconds since UNIX epoch.
///
/// Falls back to zero if the system clock is set before the epoch.
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as Timestamp)
        .unwrap_or_default()
}

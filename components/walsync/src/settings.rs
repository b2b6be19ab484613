/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::time::Duration;

/// Tunables shared by both ends of the protocol. Embedders override
/// individual fields; the defaults are the wire-contract defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Maximum time to wait for a connection to open.
    pub connect_timeout: Duration,
    /// A sender closes the connection when a chunk stays unacknowledged for
    /// this long.
    pub chunk_timeout: Duration,
    /// Interval between outbound heartbeats. Absence of *any* inbound
    /// traffic for twice this interval is a protocol timeout.
    pub heartbeat_interval: Duration,
    /// Fixed reconnect interval - deliberately not exponential, to keep
    /// flaky mobile clients close to live.
    pub reconnect_interval: Duration,
    /// Reconnect jitter, as a percentage of `reconnect_interval` in each
    /// direction.
    pub reconnect_jitter_pct: u32,
    /// Maximum number of changes per chunk.
    pub chunk_size: usize,
    /// Maximum number of outbound records drained per `send_changes` batch.
    pub outbound_batch_size: usize,
    /// Retry budget for retryable applier and outbound failures.
    pub max_retries: u32,
    /// How long a blocking frame read waits before yielding an idle tick.
    /// Ticks drive heartbeats, chunk deadlines and the outbound drain.
    pub poll_interval: Duration,
    /// Frames larger than this are a framing error.
    pub max_frame_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            chunk_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(300),
            reconnect_interval: Duration::from_secs(30),
            reconnect_jitter_pct: 10,
            chunk_size: 100,
            outbound_batch_size: 50,
            max_retries: 3,
            poll_interval: Duration::from_millis(250),
            max_frame_bytes: 8 * 1024 * 1024,
        }
    }
}

impl Settings {
    /// The inactivity window after which a session is considered dead.
    pub fn inactivity_timeout(&self) -> Duration {
        self.heartbeat_interval * 2
    }
}

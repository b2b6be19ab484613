/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The connection supervisor: opens connections, runs sessions, reconnects
//! on a fixed jittered interval, and translates connectivity into events
//! for the UI. Transport trouble stays in here - the embedder only ever
//! sees `status_changed`.

use crate::error::Error;
use crate::session::SyncSession;
use crate::ReplicaStore;
use rand::Rng;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};
use walsync::Settings;

/// What the engine reports upward. Connectivity is a boolean; data problems
/// carry the failing record's identity, per the error-handling rules.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StatusChanged { connected: bool },
    OutboundFailed { record_id: i64, error: String },
    FatalRecord {
        table: String,
        primary_key: String,
        message: String,
    },
    AuthRequired,
}

pub type EventSender = Sender<SyncEvent>;

/// Shared knobs the embedder can flip while a session runs. The session
/// polls these on its idle ticks and disconnects cleanly when asked.
#[derive(Debug, Default)]
pub struct SessionControl {
    offline: AtomicBool,
    shutdown: AtomicBool,
    auth_blocked: AtomicBool,
}

impl SessionControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The "hard offline" toggle: stops reconnect attempts until flipped
    /// back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Clears the auth block after the embedder refreshed the identity.
    pub fn identity_refreshed(&self) {
        self.auth_blocked.store(false, Ordering::SeqCst);
    }

    pub fn is_auth_blocked(&self) -> bool {
        self.auth_blocked.load(Ordering::SeqCst)
    }

    pub(crate) fn should_disconnect(&self) -> bool {
        self.is_offline() || self.is_shutdown()
    }
}

/// Opens the byte stream a session runs over. The production connector
/// dials TCP; tests hand out in-memory pipes.
pub trait Connector {
    type Stream: Read + Write;
    fn connect(&self, settings: &Settings) -> anyhow::Result<Self::Stream>;
}

pub struct TcpConnector {
    pub addr: SocketAddr,
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&self, settings: &Settings) -> anyhow::Result<TcpStream> {
        let stream = TcpStream::connect_timeout(&self.addr, settings.connect_timeout)?;
        stream.set_read_timeout(Some(settings.poll_interval))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

pub struct SyncSupervisor<C> {
    store: Arc<ReplicaStore>,
    connector: C,
    settings: Settings,
    control: Arc<SessionControl>,
    events: EventSender,
}

impl<C: Connector> SyncSupervisor<C> {
    pub fn new(
        store: Arc<ReplicaStore>,
        connector: C,
        settings: Settings,
        events: EventSender,
    ) -> Self {
        Self {
            store,
            connector,
            settings,
            control: SessionControl::new(),
            events,
        }
    }

    pub fn control(&self) -> Arc<SessionControl> {
        Arc::clone(&self.control)
    }

    /// The supervisor loop. Runs until `shutdown` - typically on its own
    /// thread.
    pub fn run(&self) {
        loop {
            if self.control.is_shutdown() {
                return;
            }
            if self.control.is_offline() || self.control.is_auth_blocked() {
                std::thread::sleep(self.settings.poll_interval);
                continue;
            }
            match self.connector.connect(&self.settings) {
                Err(e) => log::debug!("connect failed: {}", e),
                Ok(stream) => {
                    self.emit(SyncEvent::StatusChanged { connected: true });
                    let mut session = SyncSession::new(
                        stream,
                        Arc::clone(&self.store),
                        self.settings.clone(),
                        Arc::clone(&self.control),
                        self.events.clone(),
                        false,
                    );
                    let result = session.run();
                    self.emit(SyncEvent::StatusChanged { connected: false });
                    match result {
                        Ok(()) => log::debug!("session ended"),
                        Err(Error::SyncError(walsync::Error::Auth(msg))) => {
                            // No point hammering the server with a dead
                            // identity; wait for the embedder.
                            log::error!("authentication rejected: {}", msg);
                            self.control.auth_blocked.store(true, Ordering::SeqCst);
                            self.emit(SyncEvent::AuthRequired);
                        }
                        Err(e) => log::warn!("session failed: {}", e),
                    }
                }
            }
            self.wait_before_reconnect();
        }
    }

    fn wait_before_reconnect(&self) {
        let roll = rand::thread_rng().gen_range(
            -(self.settings.reconnect_jitter_pct as i32)..=self.settings.reconnect_jitter_pct as i32,
        );
        let wait = jittered_interval(self.settings.reconnect_interval, roll);
        log::trace!("reconnecting in {:?}", wait);
        let deadline = Instant::now() + wait;
        while Instant::now() < deadline && !self.control.is_shutdown() {
            std::thread::sleep(self.settings.poll_interval.min(Duration::from_millis(100)));
        }
    }

    fn emit(&self, event: SyncEvent) {
        if self.events.send(event).is_err() {
            log::trace!("no one is listening for sync events");
        }
    }
}

/// A fixed interval nudged by `roll` percent. Fixed rather than exponential
/// so flaky clients come back quickly; the jitter keeps a reconnecting
/// fleet from stampeding.
fn jittered_interval(base: Duration, roll: i32) -> Duration {
    base.mul_f64((100 + roll) as f64 / 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    struct NeverConnects;

    impl Connector for NeverConnects {
        type Stream = TcpStream;
        fn connect(&self, _settings: &Settings) -> anyhow::Result<TcpStream> {
            anyhow::bail!("nope")
        }
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let base = Duration::from_secs(30);
        assert_eq!(jittered_interval(base, 0), base);
        assert_eq!(jittered_interval(base, 10), Duration::from_secs(33));
        assert_eq!(jittered_interval(base, -10), Duration::from_secs(27));
    }

    #[test]
    fn test_shutdown_stops_the_loop() {
        let store = Arc::new(crate::ReplicaStore::new_in_memory().unwrap());
        let (events, _rx) = channel();
        let supervisor = SyncSupervisor::new(
            store,
            NeverConnects,
            Settings {
                reconnect_interval: Duration::from_millis(10),
                poll_interval: Duration::from_millis(5),
                ..Settings::default()
            },
            events,
        );
        let control = supervisor.control();
        control.shutdown();
        // returns instead of spinning forever
        supervisor.run();
        assert!(control.is_shutdown());
    }

    #[test]
    fn test_offline_toggle() {
        let control = SessionControl::new();
        assert!(!control.should_disconnect());
        control.set_offline(true);
        assert!(control.should_disconnect());
        control.set_offline(false);
        assert!(!control.should_disconnect());
    }
}

/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Server-wide wiring: one `ReplicationHub` owns the shared collaborators
//! and hands out per-connection sessions. The embedding server routes
//! `/api/replication/init` to `ensure_started` and each upgraded `/api/sync`
//! connection to `session`/`serve`.

use crate::error::Result;
use crate::server::backend::{ServerStore, WalTail};
use crate::server::session::ServerSession;
use crate::settings::Settings;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct ReplicationHub {
    store: Arc<dyn ServerStore>,
    wal: Arc<dyn WalTail>,
    settings: Settings,
    started: AtomicBool,
}

impl ReplicationHub {
    pub fn new(store: Arc<dyn ServerStore>, wal: Arc<dyn WalTail>, settings: Settings) -> Self {
        Self {
            store,
            wal,
            settings,
            started: AtomicBool::new(false),
        }
    }

    /// Makes sure the WAL tailer behind us is alive. Idempotent: the first
    /// call probes the tail, every later call is a no-op. This is the
    /// target of the once-per-boot `/api/replication/init` request.
    pub fn ensure_started(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            log::debug!("replication already started");
            return Ok(());
        }
        let lsn = self.wal.current_lsn()?;
        log::info!("replication started, WAL at {}", lsn);
        Ok(())
    }

    /// A session for one upgraded connection. The stream must already have
    /// its read timeout set to something like `settings.poll_interval`.
    pub fn session<S: Read + Write>(&self, stream: S) -> ServerSession<S> {
        ServerSession::new(
            stream,
            Arc::clone(&self.store),
            Arc::clone(&self.wal),
            self.settings.clone(),
        )
    }

    /// Accept loop for the sync endpoint: one thread per replica session.
    /// Never returns except on listener failure.
    pub fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        self.ensure_started()?;
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    log::warn!("accept failed: {}", e);
                    continue;
                }
            };
            if let Err(e) = stream.set_read_timeout(Some(self.settings.poll_interval)) {
                log::warn!("failed to set read timeout: {}", e);
                continue;
            }
            let peer = stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".into());
            log::debug!("accepted sync connection from {}", peer);
            let hub = Arc::clone(self);
            std::thread::Builder::new()
                .name(format!("sync-session-{}", peer))
                .spawn(move || {
                    if let Err(e) = hub.session(stream).run() {
                        log::debug!("session from {} ended: {}", peer, e);
                    }
                })
                .expect("failed to spawn session thread");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::memory::MemoryBackend;

    #[test]
    fn test_ensure_started_is_idempotent() {
        let backend = Arc::new(MemoryBackend::new());
        let hub = ReplicationHub::new(
            Arc::clone(&backend) as Arc<dyn ServerStore>,
            backend as Arc<dyn WalTail>,
            Settings::default(),
        );
        hub.ensure_started().unwrap();
        hub.ensure_started().unwrap();
        assert!(hub.started.load(Ordering::SeqCst));
    }
}

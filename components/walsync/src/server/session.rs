/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The per-connection server session. One blocking message loop drives the
//! whole lifecycle: `sync` handshake, then initial sync or catch-up, then
//! live streaming in both directions. Exactly one handler processes inbound
//! messages in arrival order; nothing here is shared with other sessions
//! except the store behind its trait.

use crate::chunk::{chunk_changes, AckEngine, Chunk};
use crate::error::{Error, Result};
use crate::framing::{FramedStream, Received};
use crate::lsn::Lsn;
use crate::messages::{validate_changes, ClientMessage, MessageIds, ServerMessage};
use crate::server::backend::{ServerStore, WalTail};
use crate::settings::Settings;
use crate::tables::TABLES;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Instant;

/// Upper bound on one WAL pull, so a replica that is years behind streams
/// in several rounds instead of one giant allocation.
const WAL_PULL_BATCH: usize = 4096;

enum LiveStep {
    Continue,
    Stop,
}

pub struct ServerSession<S> {
    conn: FramedStream<S>,
    store: Arc<dyn ServerStore>,
    wal: Arc<dyn WalTail>,
    settings: Settings,
    ids: MessageIds,
    client_id: String,
    /// Highest LSN handed to the framing layer (or queued for it).
    sent_lsn: Lsn,
    acks: AckEngine,
    /// Live chunks waiting their turn behind an unacknowledged one.
    outgoing: VecDeque<(String, Chunk)>,
    last_inbound: Instant,
    last_heartbeat: Instant,
}

impl<S: Read + Write> ServerSession<S> {
    pub fn new(
        stream: S,
        store: Arc<dyn ServerStore>,
        wal: Arc<dyn WalTail>,
        settings: Settings,
    ) -> Self {
        let now = Instant::now();
        Self {
            conn: FramedStream::new(stream, settings.max_frame_bytes),
            store,
            wal,
            acks: AckEngine::new(settings.chunk_timeout),
            settings,
            ids: MessageIds::server(),
            client_id: String::new(),
            sent_lsn: Lsn::ZERO,
            outgoing: VecDeque::new(),
            last_inbound: now,
            last_heartbeat: now,
        }
    }

    /// Runs the session to completion. Clean disconnects return Ok;
    /// protocol failures come back as the error after a best-effort `error`
    /// frame to the peer.
    pub fn run(mut self) -> Result<()> {
        match self.run_inner() {
            Ok(()) => {
                log::debug!("session for {:?} finished cleanly", self.client_id);
                Ok(())
            }
            Err(err) => {
                log::warn!("session for {:?} failed: {}", self.client_id, err);
                let frame = ServerMessage::Error {
                    message_id: self.ids.next(),
                    code: err.wire_code(),
                    message: err.to_string(),
                };
                let _ = self.conn.send(&frame);
                Err(err)
            }
        }
    }

    fn run_inner(&mut self) -> Result<()> {
        let (last_lsn, reset) = self.await_sync()?;
        log::info!(
            "client {:?} connected at {} (reset={})",
            self.client_id,
            last_lsn,
            reset
        );
        let resume_from = if last_lsn.is_zero() || reset {
            self.initial_sync()?
        } else {
            last_lsn
        };
        let live_from = self.catchup(resume_from)?;
        self.live(live_from)
    }

    /// The handshake: the first frame must be `sync`, announcing the client
    /// id and its stored applied LSN.
    fn await_sync(&mut self) -> Result<(Lsn, bool)> {
        let deadline = Instant::now() + self.settings.connect_timeout;
        loop {
            match self.conn.recv::<ClientMessage>()? {
                Received::Message(ClientMessage::Sync {
                    client_id,
                    last_lsn,
                    reset_sync,
                    ..
                }) => {
                    if client_id.is_empty() {
                        return Err(Error::Auth("session opened without a client id".into()));
                    }
                    self.note_inbound();
                    self.client_id = client_id;
                    return Ok((last_lsn, reset_sync));
                }
                Received::Message(other) => {
                    return Err(Error::Protocol(format!(
                        "expected sync as the first message, got {:?}",
                        other
                    )))
                }
                Received::Idle => {
                    if Instant::now() >= deadline {
                        return Err(Error::Protocol(
                            "no sync message within the connect timeout".into(),
                        ));
                    }
                }
                Received::Closed => return Err(Error::Closed),
            }
        }
    }

    /// Streams a full snapshot, table by table, one chunked message per
    /// table. The snapshot LSN is captured up front; anything the WAL emits
    /// while we stream is covered by the catch-up that follows.
    fn initial_sync(&mut self) -> Result<Lsn> {
        let snapshot_lsn = self.wal.current_lsn()?;
        let message_id = self.ids.next();
        self.send(&ServerMessage::InitStart {
            message_id,
            server_lsn: snapshot_lsn,
        })?;
        for descriptor in TABLES {
            let rows = self.store.snapshot(descriptor.name)?;
            if rows.is_empty() {
                continue;
            }
            log::debug!(
                "snapshotting {} rows of {} for {:?}",
                rows.len(),
                descriptor.name,
                self.client_id
            );
            let message_id = self.ids.next();
            for chunk in chunk_changes(rows, self.settings.chunk_size, Lsn::ZERO) {
                self.send(&ServerMessage::InitChanges {
                    message_id: message_id.clone(),
                    sequence: chunk.sequence,
                    changes: chunk.changes,
                })?;
                self.await_init_ack(&message_id, chunk.sequence.chunk)?;
            }
        }
        let message_id = self.ids.next();
        self.send(&ServerMessage::InitComplete {
            message_id,
            server_lsn: snapshot_lsn,
        })?;
        self.await_init_processed()?;
        Ok(snapshot_lsn)
    }

    fn await_init_ack(&mut self, message_id: &str, chunk: u32) -> Result<()> {
        let deadline = Instant::now() + self.settings.chunk_timeout;
        loop {
            match self.conn.recv::<ClientMessage>()? {
                Received::Message(ClientMessage::InitReceived {
                    in_reply_to,
                    chunk: acked,
                    ..
                }) => {
                    self.note_inbound();
                    if in_reply_to != message_id || acked != chunk {
                        return Err(Error::Protocol(format!(
                            "unexpected init ACK for {:?} chunk {}",
                            in_reply_to, acked
                        )));
                    }
                    return Ok(());
                }
                Received::Message(ClientMessage::Heartbeat { .. }) => self.note_inbound(),
                Received::Message(ClientMessage::Disconnect { .. }) | Received::Closed => {
                    return Err(Error::Closed)
                }
                Received::Message(other) => {
                    return Err(Error::Protocol(format!(
                        "unexpected message during initial sync: {:?}",
                        other
                    )))
                }
                Received::Idle => {
                    if Instant::now() >= deadline {
                        return Err(Error::ChunkTimeout {
                            message_id: message_id.to_string(),
                            chunk,
                        });
                    }
                }
            }
        }
    }

    fn await_init_processed(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.settings.chunk_timeout;
        loop {
            match self.conn.recv::<ClientMessage>()? {
                Received::Message(ClientMessage::InitProcessed { .. }) => {
                    self.note_inbound();
                    return Ok(());
                }
                Received::Message(ClientMessage::Heartbeat { .. }) => self.note_inbound(),
                Received::Message(ClientMessage::Disconnect { .. }) | Received::Closed => {
                    return Err(Error::Closed)
                }
                Received::Message(other) => {
                    return Err(Error::Protocol(format!(
                        "expected init_processed, got {:?}",
                        other
                    )))
                }
                Received::Idle => {
                    if Instant::now() >= deadline {
                        return Err(Error::Protocol(
                            "client never confirmed init_complete".into(),
                        ));
                    }
                }
            }
        }
    }

    /// Streams every WAL change with LSN > `from`, in LSN order, chunked
    /// and individually acknowledged. Ends with `catchup_completed`, or
    /// `live_start` when there was nothing to stream.
    fn catchup(&mut self, from: Lsn) -> Result<Lsn> {
        let mut cursor = from;
        let mut change_count: u64 = 0;
        let mut streamed_any = false;
        loop {
            let changes = self.wal.changes_since(cursor, WAL_PULL_BATCH)?;
            if changes.is_empty() {
                break;
            }
            streamed_any = true;
            let message_id = self.ids.next();
            for chunk in chunk_changes(changes, self.settings.chunk_size, cursor) {
                change_count += chunk.changes.len() as u64;
                let last_lsn = chunk.last_lsn;
                let size = chunk.changes.len();
                self.send(&ServerMessage::CatchupChanges {
                    message_id: message_id.clone(),
                    sequence: chunk.sequence,
                    changes: chunk.changes,
                    last_lsn,
                })?;
                self.acks.track(&message_id, chunk.sequence.chunk, last_lsn, size);
                self.await_catchup_ack()?;
                cursor = cursor.max(last_lsn);
            }
        }
        if streamed_any {
            log::info!(
                "catch-up for {:?} complete: {} changes to {}",
                self.client_id,
                change_count,
                cursor
            );
            let message_id = self.ids.next();
            self.send(&ServerMessage::CatchupCompleted {
                message_id,
                final_lsn: cursor,
                change_count,
                success: true,
            })?;
        } else {
            let message_id = self.ids.next();
            self.send(&ServerMessage::LiveStart {
                message_id,
                final_lsn: cursor,
            })?;
        }
        Ok(cursor)
    }

    fn await_catchup_ack(&mut self) -> Result<()> {
        loop {
            match self.conn.recv::<ClientMessage>()? {
                Received::Message(ClientMessage::CatchupReceived {
                    in_reply_to,
                    chunk,
                    lsn,
                    ..
                }) => {
                    self.note_inbound();
                    self.acks.ack(&in_reply_to, chunk, lsn)?;
                    if self.acks.is_empty() {
                        return Ok(());
                    }
                }
                Received::Message(ClientMessage::Heartbeat { .. }) => self.note_inbound(),
                Received::Message(ClientMessage::Disconnect { .. }) | Received::Closed => {
                    return Err(Error::Closed)
                }
                Received::Message(other) => {
                    return Err(Error::Protocol(format!(
                        "unexpected message during catch-up: {:?}",
                        other
                    )))
                }
                Received::Idle => {
                    if let Some(pending) = self.acks.expired(Instant::now()) {
                        return Err(Error::ChunkTimeout {
                            message_id: pending.message_id.clone(),
                            chunk: pending.chunk,
                        });
                    }
                }
            }
        }
    }

    /// Steady state: relay WAL changes out, accept client changes in, keep
    /// the heartbeat and chunk deadlines honest.
    fn live(&mut self, from: Lsn) -> Result<()> {
        self.sent_lsn = from;
        log::debug!("client {:?} is live at {}", self.client_id, from);
        loop {
            match self.conn.recv::<ClientMessage>()? {
                Received::Message(msg) => match self.handle_live_message(msg)? {
                    LiveStep::Continue => {}
                    LiveStep::Stop => return Ok(()),
                },
                Received::Idle => self.live_tick()?,
                Received::Closed => return Ok(()),
            }
        }
    }

    fn handle_live_message(&mut self, msg: ClientMessage) -> Result<LiveStep> {
        self.note_inbound();
        match msg {
            ClientMessage::Heartbeat { lsn, active, .. } => {
                log::trace!(
                    "heartbeat from {:?}: lsn={} active={}",
                    self.client_id,
                    lsn,
                    active
                );
            }
            ClientMessage::ChangesReceived {
                in_reply_to,
                chunk,
                last_lsn,
                ..
            } => {
                self.acks.ack(&in_reply_to, chunk, last_lsn)?;
            }
            ClientMessage::ChangesApplied {
                applied_changes, ..
            } => {
                log::trace!(
                    "{:?} applied {} live changes",
                    self.client_id,
                    applied_changes.len()
                );
            }
            ClientMessage::SendChanges {
                client_id, changes, ..
            } => {
                if client_id != self.client_id {
                    return Err(Error::Protocol(format!(
                        "send_changes for {:?} on a session owned by {:?}",
                        client_id, self.client_id
                    )));
                }
                validate_changes(&changes)?;
                let message_id = self.ids.next();
                self.send(&ServerMessage::ChangesReceived {
                    message_id,
                    change_ids: changes.iter().filter_map(|c| c.change_id).collect(),
                })?;
                let result = self.store.apply_client_changes(&client_id, &changes)?;
                let success = result.rejected.is_empty();
                let error = if success {
                    None
                } else {
                    Some(
                        result
                            .rejected
                            .iter()
                            .map(|r| r.reason.as_str())
                            .collect::<Vec<_>>()
                            .join("; "),
                    )
                };
                let message_id = self.ids.next();
                self.send(&ServerMessage::ChangesApplied {
                    message_id,
                    applied_changes: result.applied,
                    success,
                    error,
                })?;
            }
            ClientMessage::Disconnect { reason, .. } => {
                log::info!(
                    "client {:?} disconnected: {}",
                    self.client_id,
                    reason.as_deref().unwrap_or("no reason")
                );
                return Ok(LiveStep::Stop);
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected message in live phase: {:?}",
                    other
                )))
            }
        }
        Ok(LiveStep::Continue)
    }

    fn live_tick(&mut self) -> Result<()> {
        let now = Instant::now();
        if now.duration_since(self.last_inbound) > self.settings.inactivity_timeout() {
            return Err(Error::InactivityTimeout);
        }
        if let Some(pending) = self.acks.expired(now) {
            return Err(Error::ChunkTimeout {
                message_id: pending.message_id.clone(),
                chunk: pending.chunk,
            });
        }
        if now.duration_since(self.last_heartbeat) >= self.settings.heartbeat_interval {
            self.last_heartbeat = now;
            let message_id = self.ids.next();
            self.send(&ServerMessage::Heartbeat { message_id })?;
        }
        // One chunk in flight at a time; the rest of the stream waits here.
        if self.acks.is_empty() {
            if let Some((message_id, chunk)) = self.outgoing.pop_front() {
                self.send_live_chunk(message_id, chunk)?;
            } else {
                self.pull_wal()?;
            }
        }
        Ok(())
    }

    fn pull_wal(&mut self) -> Result<()> {
        let changes = self.wal.changes_since(self.sent_lsn, WAL_PULL_BATCH)?;
        if changes.is_empty() {
            let current = self.wal.current_lsn()?;
            if current > self.sent_lsn {
                // The WAL advanced without anything for our tables.
                self.sent_lsn = current;
                let message_id = self.ids.next();
                self.send(&ServerMessage::LsnUpdate { message_id, lsn: current })?;
            }
            return Ok(());
        }
        let message_id = self.ids.next();
        let mut chunks: VecDeque<Chunk> =
            chunk_changes(changes, self.settings.chunk_size, self.sent_lsn).into();
        if let Some(last) = chunks.back() {
            self.sent_lsn = last.last_lsn;
        }
        let first = chunks.pop_front().expect("chunk_changes never returns empty");
        for chunk in chunks {
            self.outgoing.push_back((message_id.clone(), chunk));
        }
        self.send_live_chunk(message_id, first)
    }

    fn send_live_chunk(&mut self, message_id: String, chunk: Chunk) -> Result<()> {
        let last_lsn = chunk.last_lsn;
        let size = chunk.changes.len();
        let sequence = chunk.sequence;
        self.send(&ServerMessage::LiveChanges {
            message_id: message_id.clone(),
            sequence,
            changes: chunk.changes,
            last_lsn,
        })?;
        self.acks.track(&message_id, sequence.chunk, last_lsn, size);
        Ok(())
    }

    fn send(&mut self, msg: &ServerMessage) -> Result<()> {
        log::trace!("-> {:?}: {}", self.client_id, msg.message_id());
        self.conn.send(msg)
    }

    fn note_inbound(&mut self) {
        self.last_inbound = Instant::now();
    }
}

/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The client session state machine. One blocking loop owns the connection
//! for its whole life: announce `sync`, follow the server through initial
//! sync or catch-up, then stay live - applying inbound chunks and draining
//! the outbound queue. Inbound messages are handled strictly in arrival
//! order; idle ticks drive heartbeats, deadlines and the drainer.

use crate::applier::{apply_with_retry, ApplyOutcome};
use crate::changelog;
use crate::error::{Error, Result};
use crate::outbound::{InFlightBatch, OutboundQueue};
use crate::supervisor::{EventSender, SessionControl, SyncEvent};
use crate::ReplicaStore;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Instant;
use walsync::chunk::{ChunkReceiver, Disposition};
use walsync::framing::{FramedStream, Received};
use walsync::messages::{
    validate_changes, Change, ChunkSequence, ClientMessage, MessageIds, ServerMessage,
};
use walsync::{ErrorCode, Lsn, Settings};

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    InitialSync,
    Catchup,
    Live,
}

enum Step {
    Continue,
    Stop,
}

pub struct SyncSession<S> {
    conn: FramedStream<S>,
    store: Arc<ReplicaStore>,
    settings: Settings,
    control: Arc<SessionControl>,
    events: EventSender,
    ids: MessageIds,
    phase: Phase,
    client_id: String,
    /// Last LSN the server told us about.
    server_lsn: Lsn,
    /// Last LSN applied locally (mirrors the persisted value).
    applied: Lsn,
    receiver: ChunkReceiver,
    queue: OutboundQueue,
    in_flight: Option<InFlightBatch>,
    /// Changes applied during catch-up, checked against the server's
    /// `changeCount` accounting.
    catchup_count: u64,
    reset_sync: bool,
    last_inbound: Instant,
    last_heartbeat: Instant,
}

impl<S: Read + Write> SyncSession<S> {
    pub fn new(
        stream: S,
        store: Arc<ReplicaStore>,
        settings: Settings,
        control: Arc<SessionControl>,
        events: EventSender,
        reset_sync: bool,
    ) -> Self {
        let now = Instant::now();
        Self {
            conn: FramedStream::new(stream, settings.max_frame_bytes),
            store,
            queue: OutboundQueue::new(settings.outbound_batch_size, settings.max_retries),
            settings,
            control,
            events,
            ids: MessageIds::client(),
            phase: Phase::Disconnected,
            client_id: String::new(),
            server_lsn: Lsn::ZERO,
            applied: Lsn::ZERO,
            receiver: ChunkReceiver::new(),
            in_flight: None,
            catchup_count: 0,
            reset_sync,
            last_inbound: now,
            last_heartbeat: now,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The server's position as of the last message that told us.
    pub fn server_lsn(&self) -> Lsn {
        self.server_lsn
    }

    /// Runs the session until the connection goes away. A clean disconnect
    /// (ours or the peer's) is Ok - the supervisor decides whether to come
    /// back. Protocol and data errors are returned for it to triage.
    pub fn run(&mut self) -> Result<()> {
        self.phase = Phase::Connecting;
        {
            let storage = self.store.storage.lock();
            self.client_id = storage.client_id()?;
            self.applied = storage.applied_lsn()?;
            if !self.applied.is_zero() {
                // Only a full initial sync may run with missing migrations.
                storage.check_required_migrations()?;
            }
        }
        log::info!(
            "starting session as {} from {}",
            self.client_id,
            self.applied
        );
        let opener = ClientMessage::Sync {
            message_id: self.ids.next(),
            client_id: self.client_id.clone(),
            last_lsn: self.applied,
            reset_sync: self.reset_sync,
        };
        self.send(&opener)?;

        loop {
            match self.conn.recv::<ServerMessage>()? {
                Received::Message(msg) => {
                    if let Step::Stop = self.handle(msg)? {
                        return Ok(());
                    }
                }
                Received::Idle => {
                    if let Step::Stop = self.tick()? {
                        return Ok(());
                    }
                }
                Received::Closed => {
                    log::debug!("server closed the connection");
                    self.phase = Phase::Disconnected;
                    return Ok(());
                }
            }
        }
    }

    fn handle(&mut self, msg: ServerMessage) -> Result<Step> {
        self.note_inbound();
        match msg {
            ServerMessage::Heartbeat { .. } => {}

            ServerMessage::Error { code, message, .. } => {
                log::warn!("server error {:?}: {}", code, message);
                return Err(match code {
                    ErrorCode::Auth => walsync::Error::Auth(message).into(),
                    _ => walsync::Error::Protocol(format!(
                        "server closed the session: {}",
                        message
                    ))
                    .into(),
                });
            }

            ServerMessage::InitStart { server_lsn, .. } => {
                self.expect_phase(&[Phase::Connecting], "init_start")?;
                log::info!("initial sync starting, server at {}", server_lsn);
                self.server_lsn = server_lsn;
                self.store.storage.lock().clear_mirrors()?;
                self.phase = Phase::InitialSync;
            }

            ServerMessage::InitChanges {
                message_id,
                sequence,
                changes,
            } => {
                self.expect_phase(&[Phase::InitialSync], "init_changes")?;
                // applied or duplicate - either way the ACK is the same
                self.accept_and_apply(&message_id, sequence, &changes, None)?;
                let ack = ClientMessage::InitReceived {
                    message_id: self.ids.next(),
                    in_reply_to: message_id,
                    chunk: sequence.chunk,
                };
                self.send(&ack)?;
            }

            ServerMessage::InitComplete { server_lsn, .. } => {
                self.expect_phase(&[Phase::InitialSync], "init_complete")?;
                self.store.storage.lock().set_applied_lsn(server_lsn)?;
                self.applied = server_lsn;
                log::info!("initial sync complete at {}", server_lsn);
                let done = ClientMessage::InitProcessed {
                    message_id: self.ids.next(),
                };
                self.send(&done)?;
                self.phase = Phase::Catchup;
            }

            ServerMessage::CatchupChanges {
                message_id,
                sequence,
                changes,
                last_lsn,
            } => {
                // A replica reconnecting with state goes straight to
                // catch-up; there is no marker message before the first
                // chunk.
                self.expect_phase(&[Phase::Connecting, Phase::Catchup], "catchup_changes")?;
                self.phase = Phase::Catchup;
                if self.accept_and_apply(&message_id, sequence, &changes, Some(last_lsn))? {
                    self.catchup_count += changes.len() as u64;
                }
                let ack = ClientMessage::CatchupReceived {
                    message_id: self.ids.next(),
                    in_reply_to: message_id,
                    chunk: sequence.chunk,
                    lsn: self.applied,
                };
                self.send(&ack)?;
            }

            ServerMessage::CatchupCompleted {
                final_lsn,
                change_count,
                success,
                ..
            } => {
                self.expect_phase(&[Phase::Catchup], "catchup_completed")?;
                if !success {
                    return Err(
                        walsync::Error::Protocol("server reported catch-up failure".into()).into(),
                    );
                }
                if final_lsn != self.applied {
                    return Err(walsync::Error::Protocol(format!(
                        "catch-up ended at {} but we applied up to {}",
                        final_lsn, self.applied
                    ))
                    .into());
                }
                if change_count != self.catchup_count {
                    // Replayed chunks we skipped explain a shortfall; a
                    // mismatch is still worth an operator's attention.
                    log::warn!(
                        "server counted {} catch-up changes, we applied {}",
                        change_count,
                        self.catchup_count
                    );
                }
                log::info!("caught up: {} changes to {}", change_count, final_lsn);
                self.server_lsn = final_lsn;
                self.go_live();
            }

            ServerMessage::LiveStart { final_lsn, .. } => {
                self.expect_phase(&[Phase::Connecting, Phase::Catchup], "live_start")?;
                if final_lsn != self.applied {
                    return Err(walsync::Error::Protocol(format!(
                        "live_start at {} but we are at {}",
                        final_lsn, self.applied
                    ))
                    .into());
                }
                self.server_lsn = final_lsn;
                self.go_live();
            }

            ServerMessage::LiveChanges {
                message_id,
                sequence,
                changes,
                last_lsn,
            } => {
                self.expect_phase(&[Phase::Live], "live_changes")?;
                let applied = self.accept_and_apply(&message_id, sequence, &changes, Some(last_lsn))?;
                let ack = ClientMessage::ChangesReceived {
                    message_id: self.ids.next(),
                    in_reply_to: message_id,
                    chunk: sequence.chunk,
                    last_lsn: self.applied,
                };
                self.send(&ack)?;
                if applied {
                    let report = ClientMessage::ChangesApplied {
                        message_id: self.ids.next(),
                        applied_changes: changes.iter().filter_map(|c| c.lsn).collect(),
                        last_lsn: self.applied,
                    };
                    self.send(&report)?;
                }
            }

            ServerMessage::LsnUpdate { lsn, .. } => {
                self.expect_phase(&[Phase::Live], "lsn_update")?;
                self.server_lsn = self.server_lsn.max(lsn);
                if lsn > self.applied {
                    self.store.storage.lock().set_applied_lsn(lsn)?;
                    self.applied = lsn;
                    log::trace!("LSN advanced to {} with no changes", lsn);
                }
            }

            ServerMessage::ChangesReceived { change_ids, .. } => {
                self.expect_phase(&[Phase::Live], "changes_received")?;
                log::trace!("server accepted {} outbound changes", change_ids.len());
            }

            ServerMessage::ChangesApplied {
                applied_changes,
                success,
                error,
                ..
            } => {
                self.expect_phase(&[Phase::Live], "changes_applied")?;
                let batch = self.in_flight.take().ok_or_else(|| {
                    walsync::Error::Protocol("changes_applied with no batch in flight".into())
                })?;
                if !success {
                    log::warn!(
                        "server rejected part of batch {}: {}",
                        batch.message_id,
                        error.as_deref().unwrap_or("no reason given")
                    );
                }
                let failures = {
                    let storage = self.store.storage.lock();
                    self.queue.handle_applied(
                        storage.conn(),
                        &batch,
                        &applied_changes,
                        error.as_deref(),
                    )?
                };
                for failure in failures {
                    self.emit(SyncEvent::OutboundFailed {
                        record_id: failure.record_id,
                        error: failure.error,
                    });
                }
            }
        }
        Ok(Step::Continue)
    }

    /// Chunk intake shared by the three change-carrying messages. Returns
    /// true when the chunk was actually applied (as opposed to skipped as a
    /// duplicate or replay).
    fn accept_and_apply(
        &mut self,
        message_id: &str,
        sequence: ChunkSequence,
        changes: &[Change],
        last_lsn: Option<Lsn>,
    ) -> Result<bool> {
        match self.receiver.accept(message_id, sequence)? {
            Disposition::Duplicate => {
                log::debug!(
                    "duplicate chunk {}/{} of {}; re-ACKing",
                    sequence.chunk,
                    sequence.total,
                    message_id
                );
                return Ok(false);
            }
            Disposition::Apply => {}
        }
        if let Some(last_lsn) = last_lsn {
            if last_lsn <= self.applied {
                // Resume overlap: the server is replaying something we
                // already committed. ACK it, don't reapply.
                log::debug!(
                    "chunk {}/{} ends at {} <= applied {}; skipping",
                    sequence.chunk,
                    sequence.total,
                    last_lsn,
                    self.applied
                );
                return Ok(false);
            }
        }
        validate_changes(changes)?;
        let outcome = {
            let storage = self.store.storage.lock();
            apply_with_retry(storage.conn(), changes, last_lsn, self.settings.max_retries)
        };
        match outcome {
            ApplyOutcome::Applied { count } => {
                if let Some(last_lsn) = last_lsn {
                    self.applied = last_lsn;
                }
                log::debug!(
                    "applied chunk {}/{} ({} changes), now at {}",
                    sequence.chunk,
                    sequence.total,
                    count,
                    self.applied
                );
                Ok(true)
            }
            ApplyOutcome::Retryable { message } => {
                // apply_with_retry escalates exhausted retries to fatal, so
                // this arm never runs; keep the compiler honest.
                Err(walsync::Error::Protocol(message).into())
            }
            ApplyOutcome::Fatal {
                table,
                primary_key,
                message,
            } => {
                {
                    let storage = self.store.storage.lock();
                    if let Some(change) = changes.iter().find(|c| {
                        c.identity()
                            .map(|(t, pk)| t == table && pk == primary_key)
                            .unwrap_or(false)
                    }) {
                        changelog::record_failed_server_change(storage.conn(), change, &message)?;
                    }
                }
                self.emit(SyncEvent::FatalRecord {
                    table: table.clone(),
                    primary_key: primary_key.clone(),
                    message: message.clone(),
                });
                Err(Error::FatalChange {
                    table,
                    primary_key,
                    message,
                })
            }
        }
    }

    fn tick(&mut self) -> Result<Step> {
        let now = Instant::now();
        if self.control.should_disconnect() {
            log::info!("disconnecting on request");
            let farewell = ClientMessage::Disconnect {
                message_id: self.ids.next(),
                reason: Some("going offline".into()),
            };
            let _ = self.conn.send(&farewell);
            self.phase = Phase::Disconnected;
            return Ok(Step::Stop);
        }
        if now.duration_since(self.last_inbound) > self.settings.inactivity_timeout() {
            return Err(walsync::Error::InactivityTimeout.into());
        }
        if now.duration_since(self.last_heartbeat) >= self.settings.heartbeat_interval {
            self.last_heartbeat = now;
            let beat = ClientMessage::Heartbeat {
                message_id: self.ids.next(),
                lsn: self.applied,
                active: true,
            };
            self.send(&beat)?;
        }
        // The outbound queue drains only in live, one batch in flight.
        if self.phase == Phase::Live && self.in_flight.is_none() {
            self.drain_outbound()?;
        }
        Ok(Step::Continue)
    }

    fn drain_outbound(&mut self) -> Result<()> {
        let records = {
            let storage = self.store.storage.lock();
            self.queue.next_batch(storage.conn())?
        };
        if records.is_empty() {
            return Ok(());
        }
        let message_id = self.ids.next();
        let batch = InFlightBatch {
            message_id: message_id.clone(),
            record_ids: records.iter().map(|r| r.id).collect(),
        };
        log::debug!(
            "sending {} outbound changes as {}",
            records.len(),
            message_id
        );
        let send = ClientMessage::SendChanges {
            message_id,
            client_id: self.client_id.clone(),
            changes: OutboundQueue::to_changes(&records),
        };
        self.send(&send)?;
        self.in_flight = Some(batch);
        Ok(())
    }

    fn go_live(&mut self) {
        log::info!("session is live at {}", self.applied);
        self.phase = Phase::Live;
    }

    fn expect_phase(&self, allowed: &[Phase], what: &str) -> Result<()> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(walsync::Error::Protocol(format!(
                "{} received in phase {:?}",
                what, self.phase
            ))
            .into())
        }
    }

    fn send(&mut self, msg: &ClientMessage) -> Result<()> {
        log::trace!("-> server: {}", msg.message_id());
        self.conn.send(msg)?;
        Ok(())
    }

    fn emit(&self, event: SyncEvent) {
        if self.events.send(event).is_err() {
            log::trace!("no one is listening for sync events");
        }
    }

    fn note_inbound(&mut self) {
        self.last_inbound = Instant::now();
    }
}

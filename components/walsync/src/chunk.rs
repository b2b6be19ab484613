/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Chunked delivery with per-chunk acknowledgements.
//!
//! The sender splits a change set into ordered chunks under one message id
//! and retains each chunk until its ACK arrives; a chunk that stays
//! unacknowledged past the chunk timeout fails the session, and the
//! supervisor resumes from the last *acknowledged* LSN - never from the
//! unacknowledged chunk. The receiver applies chunks strictly in order and
//! silently re-ACKs duplicates.

use crate::error::{Error, Result};
use crate::lsn::Lsn;
use crate::messages::{Change, ChunkSequence};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// One outbound chunk produced by `chunk_changes`.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub sequence: ChunkSequence,
    pub changes: Vec<Change>,
    /// Highest LSN at or before the end of this chunk.
    pub last_lsn: Lsn,
}

/// Splits an ordered change stream into chunks of at most `chunk_size`.
/// `base_lsn` seeds `last_lsn` for leading changes that carry no LSN (the
/// initial-sync snapshot does this).
pub fn chunk_changes(changes: Vec<Change>, chunk_size: usize, base_lsn: Lsn) -> Vec<Chunk> {
    assert!(chunk_size > 0, "chunk_size must be positive");
    let total = changes.len().div_ceil(chunk_size).max(1) as u32;
    let mut out = Vec::with_capacity(total as usize);
    let mut cursor = base_lsn;
    let mut iter = changes.into_iter().peekable();
    for index in 1..=total {
        let mut batch = Vec::with_capacity(chunk_size);
        while batch.len() < chunk_size {
            match iter.next() {
                Some(change) => {
                    if let Some(lsn) = change.lsn {
                        cursor = cursor.max(lsn);
                    }
                    batch.push(change);
                }
                None => break,
            }
        }
        out.push(Chunk {
            sequence: ChunkSequence {
                chunk: index,
                total,
            },
            changes: batch,
            last_lsn: cursor,
        });
    }
    debug_assert!(iter.peek().is_none());
    out
}

#[derive(Debug, Clone)]
pub struct PendingChunk {
    pub message_id: String,
    pub chunk: u32,
    pub last_lsn: Lsn,
    pub size: usize,
    pub deadline: Instant,
}

/// Sender-side bookkeeping: which chunks are awaiting an ACK, and the
/// highest LSN the peer has confirmed.
#[derive(Debug)]
pub struct AckEngine {
    timeout: Duration,
    in_flight: Vec<PendingChunk>,
    acked_lsn: Lsn,
}

impl AckEngine {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            in_flight: Vec::new(),
            acked_lsn: Lsn::ZERO,
        }
    }

    /// Record a just-sent chunk. Chunks of one message must be tracked in
    /// sequence order (which is also the order they're sent).
    pub fn track(&mut self, message_id: &str, chunk: u32, last_lsn: Lsn, size: usize) {
        self.in_flight.push(PendingChunk {
            message_id: message_id.to_string(),
            chunk,
            last_lsn,
            size,
            deadline: Instant::now() + self.timeout,
        });
    }

    /// Process an ACK. An ACK for a chunk we aren't waiting on, an ACK that
    /// skips its predecessor in the same message, or an ACK whose LSN
    /// regresses are all protocol violations.
    pub fn ack(&mut self, in_reply_to: &str, chunk: u32, lsn: Lsn) -> Result<()> {
        let first_of_message = self
            .in_flight
            .iter()
            .position(|p| p.message_id == in_reply_to);
        let index = match first_of_message {
            Some(i) => i,
            None => {
                return Err(Error::Protocol(format!(
                    "ACK for unknown message {:?}",
                    in_reply_to
                )))
            }
        };
        if self.in_flight[index].chunk != chunk {
            return Err(Error::Protocol(format!(
                "ACK for chunk {} of {:?} but chunk {} is still outstanding",
                chunk, in_reply_to, self.in_flight[index].chunk
            )));
        }
        if lsn < self.acked_lsn {
            return Err(Error::Protocol(format!(
                "ACKed LSN {} regresses below {}",
                lsn, self.acked_lsn
            )));
        }
        self.in_flight.remove(index);
        self.acked_lsn = lsn;
        Ok(())
    }

    /// The oldest chunk whose ACK deadline has passed, if any.
    pub fn expired(&self, now: Instant) -> Option<&PendingChunk> {
        self.in_flight.iter().find(|p| p.deadline <= now)
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn acked_lsn(&self) -> Lsn {
        self.acked_lsn
    }
}

/// What the receiver should do with an arriving chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// First sight: apply it, then ACK.
    Apply,
    /// Already processed (retransmit crossed our ACK in flight): re-ACK,
    /// don't touch storage.
    Duplicate,
}

#[derive(Debug)]
struct StreamProgress {
    total: u32,
    next_chunk: u32,
}

/// Receiver-side ordering and duplicate detection, per message id.
#[derive(Debug, Default)]
pub struct ChunkReceiver {
    streams: HashMap<String, StreamProgress>,
}

impl ChunkReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, message_id: &str, sequence: ChunkSequence) -> Result<Disposition> {
        if sequence.total == 0 || sequence.chunk == 0 || sequence.chunk > sequence.total {
            return Err(Error::Protocol(format!(
                "nonsensical chunk sequence {}/{} in message {:?}",
                sequence.chunk, sequence.total, message_id
            )));
        }
        match self.streams.get_mut(message_id) {
            None => {
                if sequence.chunk != 1 {
                    return Err(Error::Protocol(format!(
                        "message {:?} began at chunk {} of {}",
                        message_id, sequence.chunk, sequence.total
                    )));
                }
                self.streams.insert(
                    message_id.to_string(),
                    StreamProgress {
                        total: sequence.total,
                        next_chunk: 2,
                    },
                );
                Ok(Disposition::Apply)
            }
            Some(progress) => {
                if progress.total != sequence.total {
                    return Err(Error::Protocol(format!(
                        "message {:?} changed total from {} to {}",
                        message_id, progress.total, sequence.total
                    )));
                }
                if sequence.chunk < progress.next_chunk {
                    return Ok(Disposition::Duplicate);
                }
                if sequence.chunk > progress.next_chunk {
                    return Err(Error::Protocol(format!(
                        "chunk {} of message {:?} arrived before chunk {}",
                        sequence.chunk, message_id, progress.next_chunk
                    )));
                }
                progress.next_chunk += 1;
                Ok(Disposition::Apply)
            }
        }
    }
}

/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The outbound drainer: locally originated changes leave in producer
//! order, one bounded batch at a time, and nothing is forgotten - a record
//! either becomes `processed_sync` with its server LSN, or keeps its error
//! and attempt count for the operator.

use crate::changelog::{self, ChangeRecord};
use crate::error::Result;
use rusqlite::Connection;
use walsync::messages::{AppliedChange, Change};

/// A `send_changes` batch we are waiting to hear back about.
#[derive(Debug, Clone)]
pub struct InFlightBatch {
    pub message_id: String,
    pub record_ids: Vec<i64>,
}

/// An outbound record the server rejected, ready for the UI.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFailure {
    pub record_id: i64,
    pub error: String,
}

#[derive(Debug)]
pub struct OutboundQueue {
    batch_size: usize,
    max_retries: u32,
}

impl OutboundQueue {
    pub fn new(batch_size: usize, max_retries: u32) -> Self {
        Self {
            batch_size,
            max_retries,
        }
    }

    /// The next batch to emit, in replay order. Empty when the queue is
    /// drained (or everything left is waiting on the operator).
    pub fn next_batch(&self, conn: &Connection) -> Result<Vec<ChangeRecord>> {
        changelog::select_unsynced(conn, self.batch_size, self.max_retries)
    }

    pub fn to_changes(records: &[ChangeRecord]) -> Vec<Change> {
        records.iter().map(|r| r.to_change()).collect()
    }

    /// Processes a `changes_applied` response. Confirmed records are marked
    /// synced with their assigned LSN; anything we sent that the server
    /// didn't confirm gets its attempts bumped and is returned so the
    /// session can surface it.
    pub fn handle_applied(
        &self,
        conn: &Connection,
        batch: &InFlightBatch,
        applied: &[AppliedChange],
        error: Option<&str>,
    ) -> Result<Vec<OutboundFailure>> {
        let mut failures = Vec::new();
        for record_id in &batch.record_ids {
            match applied.iter().find(|a| a.change_id == *record_id) {
                Some(applied) => {
                    changelog::mark_synced(conn, *record_id, applied.lsn)?;
                    log::debug!("record {} confirmed at {}", record_id, applied.lsn);
                }
                None => {
                    let reason = error.unwrap_or("change not applied by server");
                    changelog::mark_failed(conn, *record_id, reason)?;
                    failures.push(OutboundFailure {
                        record_id: *record_id,
                        error: reason.to_string(),
                    });
                }
            }
        }
        Ok(failures)
    }
}

/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The inbound applier: one chunk of server changes, one transaction. The
//! chunk's mutations, its change-log records and the LSN advance commit
//! together or not at all, which is what makes replay idempotent and the
//! persisted LSN trustworthy.
//!
//! Failures come back as a three-valued outcome rather than unwinding:
//! retryable engine trouble gets backoff, anything else rolls back and
//! surfaces the failing record.

use crate::changelog;
use crate::storage::persist_lsn;
use rusqlite::{Connection, ErrorCode};
use sql_support::ConnExt;
use std::thread;
use std::time::Duration;
use types::Timestamp;
use walsync::messages::{Change, Op};
use walsync::tables;
use walsync::Lsn;

const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// What happened to a chunk.
#[derive(Debug)]
pub enum ApplyOutcome {
    /// Committed; `count` changes are now part of local state.
    Applied { count: usize },
    /// The engine was busy; worth another try.
    Retryable { message: String },
    /// Rolled back; the named record cannot be applied.
    Fatal {
        table: String,
        primary_key: String,
        message: String,
    },
}

/// Applies one chunk of server changes in a single transaction, recording
/// them in the change log and advancing the persisted LSN (when the chunk
/// carries one) as part of the same commit.
pub fn apply_server_chunk(
    conn: &Connection,
    changes: &[Change],
    new_lsn: Option<Lsn>,
) -> ApplyOutcome {
    let tx = match conn.unchecked_transaction_imm() {
        Ok(tx) => tx,
        Err(e) => return classify_sql_error("", None, e),
    };
    for change in changes {
        let identity = match change.identity() {
            Ok((table, pk)) => (table, pk),
            // The session validates before applying, so this is a bug or a
            // schema mismatch; either way, not retryable.
            Err(e) => {
                return ApplyOutcome::Fatal {
                    table: change.table.clone(),
                    primary_key: String::new(),
                    message: e.to_string(),
                }
            }
        };
        if let Err(e) = apply_one(&tx, change, &identity.1) {
            drop(tx);
            return classify_sql_error(identity.0, Some(identity.1), e);
        }
    }
    if let Err(e) = changelog::record_server_changes(&tx, changes) {
        drop(tx);
        return ApplyOutcome::Fatal {
            table: String::new(),
            primary_key: String::new(),
            message: format!("failed to record chunk in the change log: {}", e),
        };
    }
    if let Some(lsn) = new_lsn {
        if let Err(e) = persist_lsn(&tx, lsn) {
            drop(tx);
            return ApplyOutcome::Fatal {
                table: String::new(),
                primary_key: String::new(),
                message: e.to_string(),
            };
        }
    }
    match tx.commit() {
        Ok(()) => ApplyOutcome::Applied {
            count: changes.len(),
        },
        Err(e) => classify_sql_error("", None, e),
    }
}

/// Re-applies a single change that already has a change-log record, so
/// nothing is logged and no LSN moves. Used by the operator's
/// retry-failed path.
pub(crate) fn reapply_change(conn: &Connection, change: &Change) -> ApplyOutcome {
    let (table, pk) = match change.identity() {
        Ok(identity) => identity,
        Err(e) => {
            return ApplyOutcome::Fatal {
                table: change.table.clone(),
                primary_key: String::new(),
                message: e.to_string(),
            }
        }
    };
    let tx = match conn.unchecked_transaction_imm() {
        Ok(tx) => tx,
        Err(e) => return classify_sql_error("", None, e),
    };
    if let Err(e) = apply_one(&tx, change, &pk) {
        drop(tx);
        return classify_sql_error(table, Some(pk), e);
    }
    match tx.commit() {
        Ok(()) => ApplyOutcome::Applied { count: 1 },
        Err(e) => classify_sql_error("", None, e),
    }
}

/// Like `apply_server_chunk`, but retrying retryable outcomes with
/// exponential backoff. Exhausting the budget escalates to fatal.
pub fn apply_with_retry(
    conn: &Connection,
    changes: &[Change],
    new_lsn: Option<Lsn>,
    max_retries: u32,
) -> ApplyOutcome {
    let mut attempt = 0;
    loop {
        match apply_server_chunk(conn, changes, new_lsn) {
            ApplyOutcome::Retryable { message } => {
                attempt += 1;
                if attempt >= max_retries {
                    log::warn!("chunk still failing after {} attempts", attempt);
                    return ApplyOutcome::Fatal {
                        table: String::new(),
                        primary_key: String::new(),
                        message: format!("retry budget exhausted: {}", message),
                    };
                }
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                log::debug!("retryable applier error ({}); sleeping {:?}", message, delay);
                thread::sleep(delay);
            }
            outcome => return outcome,
        }
    }
}

fn apply_one(conn: &Connection, change: &Change, pk: &str) -> rusqlite::Result<()> {
    // The registry was consulted during validation; a miss here would have
    // failed identity() already.
    let table = match tables::table(&change.table) {
        Ok(descriptor) => descriptor.name,
        Err(_) => unreachable!("validated change references unknown table"),
    };
    match change.operation {
        Op::Insert | Op::Update => {
            // Upsert by primary key; on conflict the newer `updated_at`
            // wins, so replaying an old chunk cannot clobber newer state.
            let stored: Option<Timestamp> = conn.try_query_one(
                &format!("SELECT updated_at FROM \"{}\" WHERE pk = :pk", table),
                [pk],
            )?;
            if let Some(stored) = stored {
                if stored > change.updated_at {
                    log::debug!(
                        "keeping newer local row {}/{} ({} > {})",
                        table,
                        pk,
                        stored,
                        change.updated_at
                    );
                    return Ok(());
                }
            }
            conn.execute_cached(
                &format!(
                    "INSERT OR REPLACE INTO \"{}\" (pk, data, updated_at)
                     VALUES (:pk, :data, :updated_at)",
                    table
                ),
                rusqlite::named_params! {
                    ":pk": pk,
                    ":data": change.data.to_string(),
                    ":updated_at": change.updated_at,
                },
            )?;
        }
        Op::Delete => {
            // Deleting an absent row is success: deletes are idempotent.
            conn.execute_cached(
                &format!("DELETE FROM \"{}\" WHERE pk = :pk", table),
                [pk],
            )?;
        }
    }
    Ok(())
}

fn classify_sql_error(table: &str, primary_key: Option<String>, e: rusqlite::Error) -> ApplyOutcome {
    let retryable = matches!(
        &e,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::DatabaseBusy || failure.code == ErrorCode::DatabaseLocked
    );
    if retryable {
        ApplyOutcome::Retryable {
            message: e.to_string(),
        }
    } else {
        ApplyOutcome::Fatal {
            table: table.to_string(),
            primary_key: primary_key.unwrap_or_default(),
            message: e.to_string(),
        }
    }
}

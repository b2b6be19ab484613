/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The append-only local change log: every mutation the replica ever saw,
//! locally originated or server originated, with its processing flags.
//! Records are retained for audit; nothing here deletes them.

use crate::error::Result;
use rusqlite::{Connection, Row};
use serde_json::Value;
use sql_support::ConnExt;
use std::str::FromStr;
use types::Timestamp;
use walsync::messages::{Change, Op};
use walsync::Lsn;

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub id: i64,
    pub table: String,
    pub primary_key: String,
    pub operation: Op,
    pub data: Value,
    pub old_data: Value,
    /// Local insertion time, which is also the outbound replay order.
    pub timestamp: Timestamp,
    /// Applied to the local mirror tables.
    pub processed_local: bool,
    /// Confirmed by the server. Always true for server-originated records.
    pub processed_sync: bool,
    pub from_server: bool,
    pub lsn: Option<Lsn>,
    pub attempts: u32,
    pub error: Option<String>,
}

impl ChangeRecord {
    fn from_row(row: &Row<'_>) -> Result<Self> {
        let operation: String = row.get("operation")?;
        let data: Option<String> = row.get("data")?;
        let old_data: Option<String> = row.get("old_data")?;
        let lsn: Option<String> = row.get("lsn")?;
        Ok(ChangeRecord {
            id: row.get("id")?,
            table: row.get("table_name")?,
            primary_key: row.get("primary_key")?,
            operation: Op::from_str(&operation)?,
            data: match data {
                Some(raw) => serde_json::from_str(&raw)?,
                None => Value::Null,
            },
            old_data: match old_data {
                Some(raw) => serde_json::from_str(&raw)?,
                None => Value::Null,
            },
            timestamp: row.get("timestamp")?,
            processed_local: row.get("processed_local")?,
            processed_sync: row.get("processed_sync")?,
            from_server: row.get("from_server")?,
            lsn: lsn.map(|raw| Lsn::parse(&raw)).transpose()?,
            attempts: row.get("attempts")?,
            error: row.get("error")?,
        })
    }

    /// The wire shape of a pending outbound record. The record id rides
    /// along as `changeId` so the server's acknowledgements can find their
    /// way back.
    pub fn to_change(&self) -> Change {
        Change {
            table: self.table.clone(),
            operation: self.operation,
            data: self.data.clone(),
            old_data: self.old_data.clone(),
            lsn: None,
            updated_at: self.timestamp,
            change_id: Some(self.id),
        }
    }
}

fn json_or_null(value: &Value) -> Option<String> {
    if value.is_null() {
        None
    } else {
        Some(value.to_string())
    }
}

fn insert_record(
    conn: &Connection,
    change: &Change,
    timestamp: Timestamp,
    processed_local: bool,
    processed_sync: bool,
    from_server: bool,
    error: Option<&str>,
) -> Result<i64> {
    let (_, primary_key) = change.identity()?;
    conn.execute_cached(
        "INSERT INTO change_log
            (table_name, primary_key, operation, data, old_data, timestamp,
             processed_local, processed_sync, from_server, lsn, attempts, error)
         VALUES
            (:table_name, :primary_key, :operation, :data, :old_data, :timestamp,
             :processed_local, :processed_sync, :from_server, :lsn, 0, :error)",
        rusqlite::named_params! {
            ":table_name": change.table,
            ":primary_key": primary_key,
            ":operation": change.operation.as_str(),
            ":data": json_or_null(&change.data),
            ":old_data": json_or_null(&change.old_data),
            ":timestamp": timestamp,
            ":processed_local": processed_local,
            ":processed_sync": processed_sync,
            ":from_server": from_server,
            ":lsn": change.lsn.map(|lsn| lsn.to_string()),
            ":error": error,
        },
    )?;
    Ok(conn.last_insert_rowid())
}

/// Records a locally originated mutation. Callers run this inside the same
/// transaction as the SQL mutation it describes.
pub fn record_local_change(conn: &Connection, change: &Change) -> Result<i64> {
    insert_record(conn, change, change.updated_at, true, false, false, None)
}

/// Records a batch of applied server changes. Server records are complete
/// on arrival: the server is authoritative, so `processed_sync` is true by
/// construction.
pub fn record_server_changes(conn: &Connection, changes: &[Change]) -> Result<()> {
    for change in changes {
        insert_record(conn, change, Timestamp::now(), true, true, true, None)?;
    }
    Ok(())
}

/// Records a server change the applier could not apply, so an operator can
/// resolve it. Kept out of the rolled-back chunk transaction on purpose.
pub fn record_failed_server_change(
    conn: &Connection,
    change: &Change,
    error: &str,
) -> Result<i64> {
    insert_record(
        conn,
        change,
        Timestamp::now(),
        false,
        true,
        true,
        Some(error),
    )
}

/// Marks an outbound record confirmed, storing the server-assigned LSN.
pub fn mark_synced(conn: &Connection, id: i64, lsn: Lsn) -> Result<()> {
    conn.execute_cached(
        "UPDATE change_log
         SET processed_sync = 1, lsn = :lsn, error = NULL
         WHERE id = :id",
        rusqlite::named_params! { ":id": id, ":lsn": lsn.to_string() },
    )?;
    Ok(())
}

/// Marks a previously-failed record as applied to the local tables.
pub fn mark_local_applied(conn: &Connection, id: i64) -> Result<()> {
    conn.execute_cached(
        "UPDATE change_log
         SET processed_local = 1, error = NULL
         WHERE id = :id",
        rusqlite::named_params! { ":id": id },
    )?;
    Ok(())
}

/// Bumps the retry bookkeeping on a failed record.
pub fn mark_failed(conn: &Connection, id: i64, error: &str) -> Result<()> {
    conn.execute_cached(
        "UPDATE change_log
         SET attempts = attempts + 1, error = :error
         WHERE id = :id",
        rusqlite::named_params! { ":id": id, ":error": error },
    )?;
    Ok(())
}

/// Unconfirmed locally-originated records in replay order, capped at
/// `limit`. Records that burned through their retry budget wait for the
/// operator and are not selected.
pub fn select_unsynced(
    conn: &Connection,
    limit: usize,
    max_attempts: u32,
) -> Result<Vec<ChangeRecord>> {
    conn.query_rows_and_then(
        "SELECT * FROM change_log
         WHERE from_server = 0 AND processed_sync = 0 AND attempts < :max_attempts
         ORDER BY timestamp ASC, id ASC
         LIMIT :limit",
        rusqlite::named_params! { ":max_attempts": max_attempts, ":limit": limit as i64 },
        |row| ChangeRecord::from_row(row),
    )
}

/// Records that failed local application and still have retry budget.
pub fn select_failed(conn: &Connection, max_attempts: u32) -> Result<Vec<ChangeRecord>> {
    conn.query_rows_and_then(
        "SELECT * FROM change_log
         WHERE processed_local = 0 AND attempts < :max_attempts
         ORDER BY timestamp ASC, id ASC",
        rusqlite::named_params! { ":max_attempts": max_attempts },
        |row| ChangeRecord::from_row(row),
    )
}

/// Everything still awaiting server confirmation, for the operator surface.
pub fn select_pending(conn: &Connection) -> Result<Vec<ChangeRecord>> {
    conn.query_rows_and_then(
        "SELECT * FROM change_log
         WHERE from_server = 0 AND processed_sync = 0
         ORDER BY timestamp ASC, id ASC",
        [],
        |row| ChangeRecord::from_row(row),
    )
}

/// Operator "retry failed changes": hands exhausted records their retry
/// budget back.
pub fn reset_failed(conn: &Connection) -> Result<usize> {
    Ok(conn.execute_cached(
        "UPDATE change_log
         SET attempts = 0, error = NULL
         WHERE from_server = 0 AND processed_sync = 0 AND attempts > 0",
        [],
    )?)
}

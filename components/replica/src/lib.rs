/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The client replica engine: a local mirror of the server's tables, the
//! change log that remembers every mutation, and the session machinery that
//! keeps both in step with the server over the sync protocol.
//!
//! The `ReplicaStore` is the single owner of local state. The app's writer
//! goes through [`ReplicaStore::apply_local_change`]; the supervisor owns
//! the connection lifecycle and runs one [`session::SyncSession`] per
//! connection.

#![warn(rust_2018_idioms)]

pub mod applier;
pub mod changelog;
mod error;
pub mod outbound;
mod schema;
pub mod session;
mod storage;
pub mod supervisor;

pub use error::{Error, Result};
pub use storage::ReplicaStorage;

use changelog::ChangeRecord;
use parking_lot::Mutex;
use sql_support::ConnExt;
use std::path::Path;
use walsync::messages::{validate_changes, Change, Op};
use walsync::tables;

/// The owner of one replica's local state. Sessions, the local writer and
/// the operator surface all go through here; the change log underneath is
/// the single point of serialisation between them.
pub struct ReplicaStore {
    pub storage: Mutex<ReplicaStorage>,
}

impl ReplicaStore {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            storage: Mutex::new(ReplicaStorage::new(db_path)?),
        })
    }

    pub fn new_in_memory() -> Result<Self> {
        Ok(Self {
            storage: Mutex::new(ReplicaStorage::new_in_memory()?),
        })
    }

    pub fn client_id(&self) -> Result<String> {
        self.storage.lock().client_id()
    }

    /// The local writer's entry point: applies a mutation to the mirror and
    /// appends its change record atomically, in one transaction. The record
    /// starts `processed_local = true, processed_sync = false` and waits
    /// for the outbound drainer.
    pub fn apply_local_change(&self, change: &Change) -> Result<i64> {
        validate_changes(std::slice::from_ref(change))?;
        let descriptor = tables::table(&change.table)?;
        let (_, pk) = change.identity()?;
        let storage = self.storage.lock();
        let tx = storage.conn().unchecked_transaction_imm()?;
        match change.operation {
            Op::Insert | Op::Update => {
                tx.execute_cached(
                    &format!(
                        "INSERT OR REPLACE INTO \"{}\" (pk, data, updated_at)
                         VALUES (:pk, :data, :updated_at)",
                        descriptor.name
                    ),
                    rusqlite::named_params! {
                        ":pk": pk,
                        ":data": change.data.to_string(),
                        ":updated_at": change.updated_at,
                    },
                )?;
            }
            Op::Delete => {
                tx.execute_cached(
                    &format!("DELETE FROM \"{}\" WHERE pk = :pk", descriptor.name),
                    [pk.as_str()],
                )?;
            }
        }
        let id = changelog::record_local_change(&tx, change)?;
        tx.commit()?;
        log::debug!("local change {} recorded for {}/{}", id, change.table, pk);
        Ok(id)
    }

    /// Operator: reset the applied LSN to `0/0`, forcing the next session
    /// into a full initial sync.
    pub fn reset_sync(&self) -> Result<()> {
        self.storage.lock().reset_lsn()
    }

    /// Operator: drop everything - identity, LSN, change log, mirrors.
    pub fn drop_local_state(&self) -> Result<()> {
        self.storage.lock().drop_local_state()
    }

    /// Operator: every locally originated change still awaiting the server.
    pub fn list_pending_changes(&self) -> Result<Vec<ChangeRecord>> {
        let storage = self.storage.lock();
        changelog::select_pending(storage.conn())
    }

    /// Operator: give failed outbound changes their retry budget back.
    /// Returns how many were revived.
    pub fn retry_failed_changes(&self) -> Result<usize> {
        let storage = self.storage.lock();
        changelog::reset_failed(storage.conn())
    }

    /// Operator: re-apply server changes that failed local application
    /// (after whatever blocked them has been resolved). Returns how many
    /// now applied cleanly.
    pub fn retry_failed_server_changes(&self, max_attempts: u32) -> Result<usize> {
        let storage = self.storage.lock();
        let failed = changelog::select_failed(storage.conn(), max_attempts)?;
        let mut applied = 0;
        for record in failed {
            let change = record.to_change();
            match applier::reapply_change(storage.conn(), &change) {
                applier::ApplyOutcome::Applied { .. } => {
                    changelog::mark_local_applied(storage.conn(), record.id)?;
                    applied += 1;
                }
                applier::ApplyOutcome::Fatal { message, .. }
                | applier::ApplyOutcome::Retryable { message } => {
                    log::warn!("record {} still failing: {}", record.id, message);
                    changelog::mark_failed(storage.conn(), record.id, &message)?;
                }
            }
        }
        Ok(applied)
    }
}

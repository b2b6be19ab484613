/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! An in-memory `ServerStore` + `WalTail` pair backed by one mutex-guarded
//! state blob. This is the development/test backend - the protocol tests
//! run real sessions against it - not a production store.

use crate::lsn::Lsn;
use crate::messages::{AppliedChange, Change, Op};
use crate::server::backend::{ClientApplyResult, RejectedChange, ServerStore, WalTail};
use crate::tables;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use types::Timestamp;

#[derive(Debug, Clone)]
struct Row {
    data: Value,
    updated_at: Timestamp,
    lsn: Lsn,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<&'static str, BTreeMap<String, Row>>,
    wal: Vec<Change>,
    last_lsn: Lsn,
}

impl State {
    fn next_lsn(&mut self) -> Lsn {
        let next = if self.last_lsn.minor == u32::MAX {
            Lsn::new(self.last_lsn.major + 1, 1)
        } else {
            Lsn::new(self.last_lsn.major, self.last_lsn.minor + 1)
        };
        self.last_lsn = next;
        next
    }
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A server-side write: mutates the authoritative table and emits the
    /// WAL entry, exactly what the out-of-scope application server would
    /// do. Returns the assigned LSN.
    pub fn write(&self, op: Op, table: &str, data: Value, updated_at: Timestamp) -> Lsn {
        let descriptor = tables::table(table).expect("server writes use known tables");
        let pk = descriptor
            .primary_key_of(&data)
            .expect("server writes carry a primary key");
        write_locked(&mut self.state.lock(), op, table, pk, data, updated_at)
    }

    /// Advances the WAL position without emitting a replicated change, the
    /// way writes to tables outside the registry do. Sessions turn this
    /// into `lsn_update`.
    pub fn bump_lsn(&self) -> Lsn {
        self.state.lock().next_lsn()
    }

    /// Test/diagnostic access to a row image.
    pub fn row(&self, table: &str, pk: &str) -> Option<Value> {
        self.state
            .lock()
            .tables
            .get(table)
            .and_then(|rows| rows.get(pk))
            .map(|row| row.data.clone())
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|rows| rows.len())
            .unwrap_or(0)
    }
}

impl WalTail for MemoryBackend {
    fn current_lsn(&self) -> anyhow::Result<Lsn> {
        Ok(self.state.lock().last_lsn)
    }

    fn changes_since(&self, after: Lsn, limit: usize) -> anyhow::Result<Vec<Change>> {
        let state = self.state.lock();
        Ok(state
            .wal
            .iter()
            .filter(|change| change.lsn.expect("WAL changes always carry an LSN") > after)
            .take(limit)
            .cloned()
            .collect())
    }
}

impl ServerStore for MemoryBackend {
    fn snapshot(&self, table: &str) -> anyhow::Result<Vec<Change>> {
        let descriptor = tables::table(table)?;
        let state = self.state.lock();
        Ok(state
            .tables
            .get(descriptor.name)
            .into_iter()
            .flat_map(|rows| rows.values())
            .map(|row| Change {
                table: descriptor.name.to_string(),
                operation: Op::Insert,
                data: row.data.clone(),
                old_data: Value::Null,
                lsn: Some(row.lsn),
                updated_at: row.updated_at,
                change_id: None,
            })
            .collect())
    }

    fn apply_client_changes(
        &self,
        client_id: &str,
        changes: &[Change],
    ) -> anyhow::Result<ClientApplyResult> {
        let mut result = ClientApplyResult::default();
        // One lock for the whole batch: the LWW check and the write must
        // not interleave with another session's batch.
        let mut state = self.state.lock();
        for change in changes {
            let descriptor = tables::table(&change.table)?;
            let (_, pk) = change.identity()?;
            let stored = state
                .tables
                .get(descriptor.name)
                .and_then(|rows| rows.get(&pk));
            // Last-writer-wins: a client change older than the stored row
            // lost a race with some other writer and is rejected, not
            // merged.
            if let Some(row) = stored {
                if change.updated_at < row.updated_at {
                    log::info!(
                        "rejecting stale change from {} for {}/{} ({} < {})",
                        client_id,
                        descriptor.name,
                        pk,
                        change.updated_at,
                        row.updated_at
                    );
                    result.rejected.push(RejectedChange {
                        change_id: change.change_id,
                        reason: format!(
                            "stale write for {}/{}: {} < {}",
                            descriptor.name, pk, change.updated_at, row.updated_at
                        ),
                    });
                    continue;
                }
            }
            let image = match change.operation {
                Op::Delete => {
                    if change.old_data.is_null() {
                        change.data.clone()
                    } else {
                        change.old_data.clone()
                    }
                }
                _ => change.data.clone(),
            };
            let lsn = write_locked(
                &mut state,
                change.operation,
                descriptor.name,
                pk,
                image,
                change.updated_at,
            );
            result.applied.push(AppliedChange {
                change_id: change.change_id.unwrap_or(0),
                lsn,
            });
        }
        Ok(result)
    }
}

/// The shared write path: assign an LSN, mutate the table, append the WAL
/// entry. Callers hold the state lock.
fn write_locked(
    state: &mut State,
    op: Op,
    table: &str,
    pk: String,
    data: Value,
    updated_at: Timestamp,
) -> Lsn {
    let descriptor = tables::table(table).expect("callers resolve the table first");
    let lsn = state.next_lsn();
    // The pre-image for a delete always identifies the row, even when
    // there was nothing to delete.
    let old_data = state
        .tables
        .get(descriptor.name)
        .and_then(|rows| rows.get(&pk))
        .map(|row| row.data.clone())
        .unwrap_or_else(|| match op {
            Op::Delete => {
                let mut image = serde_json::Map::new();
                image.insert(descriptor.primary_key.to_string(), Value::String(pk.clone()));
                Value::Object(image)
            }
            _ => Value::Null,
        });
    let rows = state.tables.entry(descriptor.name).or_default();
    match op {
        Op::Insert | Op::Update => {
            rows.insert(
                pk,
                Row {
                    data: data.clone(),
                    updated_at,
                    lsn,
                },
            );
        }
        Op::Delete => {
            rows.remove(&pk);
        }
    }
    state.wal.push(Change {
        table: descriptor.name.to_string(),
        operation: op,
        data: match op {
            Op::Delete => Value::Null,
            _ => data,
        },
        old_data,
        lsn: Some(lsn),
        updated_at,
        change_id: None,
    });
    lsn
}

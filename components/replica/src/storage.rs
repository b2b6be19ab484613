/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Durable per-replica state: the client identity, the applied LSN and the
//! meta key-value records behind them. The applied LSN is monotonic
//! non-decreasing; regressing it takes the explicit reset operation.

use crate::error::{Error, Result};
use crate::schema::{
    ReplicaMigrationLogic, APPLIED_LSN_META_KEY, CLIENT_ID_META_KEY, CREATE_MIGRATIONS_STATUS_SQL,
    MIGRATION_APPLIED, REQUIRED_MIGRATIONS, STATE_TIMESTAMP_META_KEY,
};
use rusqlite::types::{FromSql, ToSql};
use rusqlite::{Connection, OpenFlags};
use sql_support::open_database::{open_database_with_flags, open_memory_database};
use sql_support::ConnExt;
use std::path::Path;
use types::Timestamp;
use walsync::tables::TABLES;
use walsync::Lsn;

pub struct ReplicaStorage {
    db: Connection,
}

impl ReplicaStorage {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE;
        let db = open_database_with_flags(db_path, flags, &ReplicaMigrationLogic)?;
        Ok(Self { db })
    }

    /// An in-memory replica, for tests and the cli.
    pub fn new_in_memory() -> Result<Self> {
        let db = open_memory_database(&ReplicaMigrationLogic)?;
        Ok(Self { db })
    }

    pub fn conn(&self) -> &Connection {
        &self.db
    }

    pub(crate) fn put_meta(&self, key: &str, value: &dyn ToSql) -> Result<()> {
        self.db.execute_cached(
            "REPLACE INTO meta (key, value) VALUES (:key, :value)",
            &[(":key", &key as &dyn ToSql), (":value", value)],
        )?;
        Ok(())
    }

    pub(crate) fn get_meta<T: FromSql>(&self, key: &str) -> Result<Option<T>> {
        Ok(self
            .db
            .try_query_one("SELECT value FROM meta WHERE key = :key", [key])?)
    }

    pub(crate) fn delete_meta(&self, key: &str) -> Result<()> {
        self.db
            .execute_cached("DELETE FROM meta WHERE key = :key", [key])?;
        Ok(())
    }

    /// The persistent replica identity. Assigned on first call and never
    /// changed afterwards, except by corruption recovery or
    /// `drop_local_state`.
    pub fn client_id(&self) -> Result<String> {
        if let Some(id) = self.get_meta::<String>(CLIENT_ID_META_KEY)? {
            return Ok(id);
        }
        let id = uuid::Uuid::new_v4().to_string();
        log::info!("assigning new client id {}", id);
        self.put_meta(CLIENT_ID_META_KEY, &id)?;
        self.put_meta(STATE_TIMESTAMP_META_KEY, &Timestamp::now())?;
        Ok(id)
    }

    /// The last LSN applied locally. A value that no longer parses means
    /// the persisted state is corrupt: we back it up, discard the identity
    /// and restart from `0/0`, so the next session is a full initial sync.
    pub fn applied_lsn(&self) -> Result<Lsn> {
        let raw = match self.get_meta::<String>(APPLIED_LSN_META_KEY)? {
            None => return Ok(Lsn::ZERO),
            Some(raw) => raw,
        };
        match Lsn::parse(&raw) {
            Ok(lsn) => Ok(lsn),
            Err(_) => {
                log::error!("persisted LSN {:?} is corrupt; starting over", raw);
                self.put_meta(&format!("corrupt.{}", APPLIED_LSN_META_KEY), &raw)?;
                if let Some(old_id) = self.get_meta::<String>(CLIENT_ID_META_KEY)? {
                    self.put_meta(&format!("corrupt.{}", CLIENT_ID_META_KEY), &old_id)?;
                }
                self.delete_meta(CLIENT_ID_META_KEY)?;
                self.delete_meta(APPLIED_LSN_META_KEY)?;
                self.put_meta(STATE_TIMESTAMP_META_KEY, &Timestamp::now())?;
                Ok(Lsn::ZERO)
            }
        }
    }

    /// Advances the applied LSN. Standalone variant for advances that
    /// happen outside an applier transaction (`init_complete`,
    /// `lsn_update`).
    pub fn set_applied_lsn(&self, lsn: Lsn) -> Result<()> {
        persist_lsn(&self.db, lsn)
    }

    /// Explicit operator reset: back to `0/0`, forcing the next session
    /// into a full initial sync. This is the only sanctioned regression.
    pub fn reset_lsn(&self) -> Result<()> {
        log::info!("resetting applied LSN to 0/0");
        self.put_meta(APPLIED_LSN_META_KEY, &Lsn::ZERO.to_string())?;
        self.put_meta(STATE_TIMESTAMP_META_KEY, &Timestamp::now())?;
        Ok(())
    }

    /// Operator "drop local state": identity, LSN, change log and all
    /// mirrored rows.
    pub fn drop_local_state(&self) -> Result<()> {
        let tx = self.db.unchecked_transaction()?;
        tx.execute_batch("DELETE FROM meta; DELETE FROM change_log;")?;
        for descriptor in TABLES {
            tx.execute_batch(&format!("DELETE FROM \"{}\";", descriptor.name))?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Empties the mirror tables ahead of an initial-sync snapshot.
    pub(crate) fn clear_mirrors(&self) -> Result<()> {
        let tx = self.db.unchecked_transaction()?;
        for descriptor in TABLES {
            tx.execute_batch(&format!("DELETE FROM \"{}\";", descriptor.name))?;
        }
        tx.commit()?;
        Ok(())
    }

    /// The migration gate: `migrations_status` is created on first need
    /// (never silently dropped), and every required migration must be
    /// recorded as applied before a session may proceed past initial sync.
    pub fn check_required_migrations(&self) -> Result<()> {
        self.db.execute_batch(CREATE_MIGRATIONS_STATUS_SQL)?;
        for name in REQUIRED_MIGRATIONS {
            let status: Option<String> = self.db.try_query_one(
                "SELECT status FROM migrations_status WHERE name = :name",
                [*name],
            )?;
            if status.as_deref() != Some(MIGRATION_APPLIED) {
                return Err(Error::MigrationMissing((*name).to_string()));
            }
        }
        Ok(())
    }

    /// Test/diagnostic access to a mirrored row image.
    pub fn mirror_row(&self, table: &str, pk: &str) -> Result<Option<serde_json::Value>> {
        let raw: Option<String> = self.db.try_query_one(
            &format!("SELECT data FROM \"{}\" WHERE pk = :pk", table),
            [pk],
        )?;
        Ok(match raw {
            None => None,
            Some(raw) => Some(serde_json::from_str(&raw)?),
        })
    }

    pub fn mirror_count(&self, table: &str) -> Result<i64> {
        Ok(self
            .db
            .query_one(&format!("SELECT COUNT(*) FROM \"{}\"", table))?)
    }
}

/// Advances the persisted LSN on whatever connection (or open transaction)
/// is given, enforcing monotonicity. ACK and LSN-advance being one atomic
/// step per chunk hinges on the applier calling this inside its chunk
/// transaction.
pub(crate) fn persist_lsn(conn: &Connection, lsn: Lsn) -> Result<()> {
    let current = match conn.try_query_one::<String, _>(
        "SELECT value FROM meta WHERE key = :key",
        [APPLIED_LSN_META_KEY],
    )? {
        Some(raw) => Lsn::parse(&raw).unwrap_or(Lsn::ZERO),
        None => Lsn::ZERO,
    };
    if lsn < current {
        return Err(Error::LsnRegression {
            from: current,
            to: lsn,
        });
    }
    conn.execute_cached(
        "REPLACE INTO meta (key, value) VALUES (:key, :value)",
        rusqlite::named_params! { ":key": APPLIED_LSN_META_KEY, ":value": lsn.to_string() },
    )?;
    conn.execute_cached(
        "REPLACE INTO meta (key, value) VALUES (:key, :value)",
        rusqlite::named_params! { ":key": STATE_TIMESTAMP_META_KEY, ":value": Timestamp::now() },
    )?;
    Ok(())
}
